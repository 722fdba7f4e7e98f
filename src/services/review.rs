use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;

use crate::core::time::{format_primitive, primitive_now_utc};
use crate::db::models::GradingResult;
use crate::db::types::{AuditEvent, ResultStatus};
use crate::repositories;
use crate::repositories::audit::NewAuditEntry;
use crate::repositories::results::Transition;
use crate::services::gradebook::{GradeEvent, GradebookEntry, GradebookSink};

#[derive(Debug, Error)]
pub(crate) enum ReviewError {
    #[error("result {0} not found")]
    NotFound(String),
    #[error("result {id} is already {} and cannot become {}", .from.as_str(), .to.as_str())]
    IllegalTransition { id: String, from: ResultStatus, to: ResultStatus },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseMode {
    Reviewer,
    Automatic,
}

impl ReleaseMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Reviewer => "reviewer",
            Self::Automatic => "automatic",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ReviewOutcome {
    pub(crate) result: GradingResult,
    /// `false` when the gradebook push failed; the maintenance loop retries it.
    pub(crate) gradebook_synced: bool,
}

async fn apply_transition(
    pool: &PgPool,
    result_id: &str,
    transition: Transition<'_>,
) -> Result<GradingResult, ReviewError> {
    let to = transition.to;
    let current = repositories::results::find_by_id(pool, result_id)
        .await?
        .ok_or_else(|| ReviewError::NotFound(result_id.to_string()))?;
    if !current.status.can_transition_to(to) {
        return Err(ReviewError::IllegalTransition {
            id: result_id.to_string(),
            from: current.status,
            to,
        });
    }

    // The update re-checks `draft`, so a concurrent reviewer cannot win twice.
    match repositories::results::transition_from_draft(pool, result_id, transition).await? {
        Some(updated) => Ok(updated),
        None => {
            let from = repositories::results::find_by_id(pool, result_id)
                .await?
                .map(|latest| latest.status)
                .unwrap_or(current.status);
            Err(ReviewError::IllegalTransition { id: result_id.to_string(), from, to })
        }
    }
}

/// Finalizes a draft and pushes it to the gradebook. `reviewer_id` is `None` only for
/// auto-release.
pub(crate) async fn release(
    pool: &PgPool,
    gradebook: &dyn GradebookSink,
    result_id: &str,
    reviewer_id: Option<&str>,
    mode: ReleaseMode,
) -> Result<ReviewOutcome, ReviewError> {
    let now = primitive_now_utc();
    let result = apply_transition(
        pool,
        result_id,
        Transition { to: ResultStatus::Released, reviewer_id, reject_reason: None, now },
    )
    .await?;

    let event = match mode {
        ReleaseMode::Reviewer => AuditEvent::Released,
        ReleaseMode::Automatic => AuditEvent::AutoReleased,
    };
    repositories::audit::record(
        pool,
        NewAuditEntry {
            queue_id: Some(&result.queue_id),
            result_id: Some(&result.id),
            event,
            message: None,
            details: json!({ "reviewer_id": reviewer_id, "grade": result.grade }),
            now,
        },
    )
    .await?;
    metrics::counter!("results_released_total", "mode" => mode.as_str()).increment(1);

    let gradebook_synced = push_to_gradebook(pool, gradebook, &result).await?;

    let notification = GradeEvent::Released {
        result_id: result.id.clone(),
        module_instance_id: result.module_instance_id.clone(),
        user_id: result.user_id.clone(),
        reviewer_id: reviewer_id.map(str::to_string),
        automatic: mode == ReleaseMode::Automatic,
    };
    if let Err(err) = gradebook.notify(&notification).await {
        tracing::warn!(result_id = %result.id, error = %err, "Failed to send release notification");
    }

    tracing::info!(
        result_id = %result.id,
        module_instance_id = %result.module_instance_id,
        user_id = %result.user_id,
        mode = mode.as_str(),
        gradebook_synced,
        "Result released"
    );

    Ok(ReviewOutcome { result, gradebook_synced })
}

/// Pushes a released result and stamps `gradebook_synced_at` on success. A failed push is
/// audited and reported as `false`, never as an error.
pub(crate) async fn push_to_gradebook(
    pool: &PgPool,
    gradebook: &dyn GradebookSink,
    result: &GradingResult,
) -> Result<bool, sqlx::Error> {
    let entry = GradebookEntry {
        result_id: result.id.clone(),
        course_id: result.course_id.clone(),
        module_instance_id: result.module_instance_id.clone(),
        user_id: result.user_id.clone(),
        grade: result.grade,
        max_grade: result.max_grade,
        feedback: result.reasoning.clone(),
        released_at: result.reviewed_at.map(format_primitive).unwrap_or_default(),
    };

    let now = primitive_now_utc();
    match gradebook.push_grade(&entry).await {
        Ok(()) => {
            repositories::results::mark_synced(pool, &result.id, now).await?;
            repositories::audit::record(
                pool,
                NewAuditEntry {
                    queue_id: Some(&result.queue_id),
                    result_id: Some(&result.id),
                    event: AuditEvent::GradebookSynced,
                    message: None,
                    details: json!({}),
                    now,
                },
            )
            .await?;
            Ok(true)
        }
        Err(err) => {
            let message = err.to_string();
            tracing::warn!(result_id = %result.id, error = %message, "Gradebook push failed");
            repositories::audit::record(
                pool,
                NewAuditEntry {
                    queue_id: Some(&result.queue_id),
                    result_id: Some(&result.id),
                    event: AuditEvent::GradebookSyncFailed,
                    message: Some(&message),
                    details: json!({}),
                    now,
                },
            )
            .await?;
            Ok(false)
        }
    }
}

/// Marks a draft as rejected. The gradebook is left untouched and the instructor is told to
/// grade by hand.
pub(crate) async fn reject(
    pool: &PgPool,
    gradebook: &dyn GradebookSink,
    result_id: &str,
    reviewer_id: &str,
    reason: Option<&str>,
) -> Result<GradingResult, ReviewError> {
    let now = primitive_now_utc();
    let result = apply_transition(
        pool,
        result_id,
        Transition {
            to: ResultStatus::Rejected,
            reviewer_id: Some(reviewer_id),
            reject_reason: reason,
            now,
        },
    )
    .await?;

    repositories::audit::record(
        pool,
        NewAuditEntry {
            queue_id: Some(&result.queue_id),
            result_id: Some(&result.id),
            event: AuditEvent::Rejected,
            message: reason,
            details: json!({ "reviewer_id": reviewer_id }),
            now,
        },
    )
    .await?;
    metrics::counter!("results_rejected_total").increment(1);

    let notification = GradeEvent::Rejected {
        result_id: result.id.clone(),
        module_instance_id: result.module_instance_id.clone(),
        user_id: result.user_id.clone(),
        reviewer_id: reviewer_id.to_string(),
        reason: reason.map(str::to_string),
    };
    if let Err(err) = gradebook.notify(&notification).await {
        tracing::warn!(result_id = %result.id, error = %err, "Failed to send rejection notification");
    }

    tracing::info!(
        result_id = %result.id,
        module_instance_id = %result.module_instance_id,
        user_id = %result.user_id,
        reviewer_id = %reviewer_id,
        "Result rejected; manual grading required"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gradebook::testing::RecordingGradebook;
    use crate::test_support;

    #[tokio::test]
    async fn release_pushes_grade_and_stamps_reviewer() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let pool = ctx.state.db();
        let sink = RecordingGradebook::default();
        let result_id = test_support::insert_draft_result(pool, "m1", "u1").await;

        let outcome = release(pool, &sink, &result_id, Some("t1"), ReleaseMode::Reviewer)
            .await
            .expect("release");

        assert_eq!(outcome.result.status, ResultStatus::Released);
        assert_eq!(outcome.result.reviewer_id.as_deref(), Some("t1"));
        assert!(outcome.result.reviewed);
        assert!(outcome.result.reviewed_at.is_some());
        assert!(outcome.gradebook_synced);
        assert_eq!(sink.entries().len(), 1);
        assert_eq!(sink.events().len(), 1);

        let stored = repositories::results::find_by_id(pool, &result_id).await.unwrap().unwrap();
        assert!(stored.gradebook_synced_at.is_some());
    }

    #[tokio::test]
    async fn second_release_is_an_illegal_transition() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let pool = ctx.state.db();
        let sink = RecordingGradebook::default();
        let result_id = test_support::insert_draft_result(pool, "m1", "u1").await;

        release(pool, &sink, &result_id, Some("t1"), ReleaseMode::Reviewer).await.unwrap();
        let err = release(pool, &sink, &result_id, Some("t2"), ReleaseMode::Reviewer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReviewError::IllegalTransition { from: ResultStatus::Released, .. }
        ));

        let err = reject(pool, &sink, &result_id, "t2", None).await.unwrap_err();
        assert!(matches!(err, ReviewError::IllegalTransition { .. }));
        assert_eq!(sink.entries().len(), 1);
    }

    #[tokio::test]
    async fn reject_leaves_gradebook_untouched() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let pool = ctx.state.db();
        let sink = RecordingGradebook::default();
        let result_id = test_support::insert_draft_result(pool, "m1", "u1").await;

        let result = reject(pool, &sink, &result_id, "t1", Some("off-topic")).await.unwrap();

        assert_eq!(result.status, ResultStatus::Rejected);
        assert_eq!(result.reject_reason.as_deref(), Some("off-topic"));
        assert!(sink.entries().is_empty());
        assert!(matches!(sink.events()[0], GradeEvent::Rejected { .. }));

        let err = release(pool, &sink, &result_id, Some("t1"), ReleaseMode::Reviewer)
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::IllegalTransition { from: ResultStatus::Rejected, .. }));
    }

    #[tokio::test]
    async fn failed_push_keeps_release_and_audits() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let pool = ctx.state.db();
        let sink = RecordingGradebook::failing();
        let result_id = test_support::insert_draft_result(pool, "m1", "u1").await;

        let outcome = release(pool, &sink, &result_id, None, ReleaseMode::Automatic).await.unwrap();

        assert_eq!(outcome.result.status, ResultStatus::Released);
        assert!(!outcome.result.reviewed);
        assert!(!outcome.gradebook_synced);
        let events: Vec<AuditEvent> = repositories::audit::list_for_result(pool, &result_id)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        assert_eq!(events, vec![AuditEvent::AutoReleased, AuditEvent::GradebookSyncFailed]);
    }

    #[tokio::test]
    async fn unknown_result_is_not_found() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let sink = RecordingGradebook::default();
        let err = reject(ctx.state.db(), &sink, "missing", "t1", None).await.unwrap_err();
        assert!(matches!(err, ReviewError::NotFound(_)));
    }
}
