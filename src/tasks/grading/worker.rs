use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;
use uuid::Uuid;

use crate::core::state::AppState;
use crate::core::time::{format_primitive, primitive_now_utc, seconds_between};
use crate::db::models::{GradingResult, JobPayload, QueueItem, TraceEntry};
use crate::db::types::{AuditEvent, ResultStatus};
use crate::repositories;
use crate::repositories::audit::NewAuditEntry;
use crate::repositories::results::NewResult;
use crate::services::gradebook::GradeEvent;
use crate::services::grading::{plan_failure, FailurePlan, Grader, GradingStage};
use crate::services::review::{self, ReleaseMode};

const MAX_ERROR_CHARS: usize = 2000;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct PassSummary {
    pub(crate) claimed: usize,
    pub(crate) graded: usize,
    pub(crate) retried: usize,
    pub(crate) failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ItemOutcome {
    Graded { result_id: String, stage: GradingStage },
    RetryScheduled { retries: i32 },
    Failed { retries: i32 },
    /// The claim was taken over (stale recovery) before this worker could record anything.
    Lost,
}

/// Grades up to `batch_size` eligible items oldest first. Each item is claimed only when
/// the worker is ready to grade it, so `started_at` always marks a live attempt.
pub(crate) async fn run_pass(state: &AppState) -> Result<PassSummary> {
    let mut summary = PassSummary::default();

    for _ in 0..state.settings().queue().batch_size {
        let claimed = repositories::queue::claim_next(state.db(), primitive_now_utc())
            .await
            .context("Failed to claim queue item")?;
        let Some(item) = claimed else {
            break;
        };
        summary.claimed += 1;

        match process_item(state, &item).await {
            Ok(ItemOutcome::Graded { .. }) => summary.graded += 1,
            Ok(ItemOutcome::RetryScheduled { .. }) => summary.retried += 1,
            Ok(ItemOutcome::Failed { .. }) => summary.failed += 1,
            Ok(ItemOutcome::Lost) => {}
            Err(err) => {
                tracing::error!(queue_id = %item.id, error = %err, "Failed to record grading outcome");
            }
        }
    }

    if summary.claimed == 0 {
        return Ok(summary);
    }

    tracing::info!(
        claimed = summary.claimed,
        graded = summary.graded,
        retried = summary.retried,
        failed = summary.failed,
        "Grading pass finished"
    );

    Ok(summary)
}

pub(crate) async fn process_item(state: &AppState, item: &QueueItem) -> Result<ItemOutcome> {
    let started = Instant::now();
    let claimed_at = item.started_at.unwrap_or_else(primitive_now_utc);
    metrics::histogram!("grading_queue_latency_seconds")
        .record(seconds_between(item.created_at, claimed_at));

    let mut stage = GradingStage::New;
    let graded = grade_and_persist(state, item, &mut stage).await;
    metrics::histogram!("grading_duration_seconds").record(started.elapsed().as_secs_f64());

    let (result, auto_release) = match graded {
        Ok(graded) => graded,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::warn!(
                queue_id = %item.id,
                module_instance_id = %item.module_instance_id,
                user_id = %item.user_id,
                stage = stage.as_str(),
                error = %message,
                "Grading attempt failed"
            );
            return record_failure(state, item, &message).await;
        }
    };
    metrics::counter!("grading_jobs_total", "status" => "success").increment(1);

    let stage = if auto_release {
        match review::release(state.db(), state.gradebook(), &result.id, None, ReleaseMode::Automatic)
            .await
        {
            Ok(_) => GradingStage::AutoReleased,
            Err(err) => {
                let status = repositories::results::find_by_id(state.db(), &result.id)
                    .await
                    .ok()
                    .flatten()
                    .map(|current| current.status);
                tracing::error!(
                    result_id = %result.id,
                    status = ?status,
                    error = %err,
                    "Auto-release failed"
                );
                if status == Some(ResultStatus::Released) {
                    GradingStage::AutoReleased
                } else {
                    GradingStage::AwaitingReview
                }
            }
        }
    } else {
        GradingStage::AwaitingReview
    };

    tracing::info!(
        queue_id = %item.id,
        result_id = %result.id,
        module_instance_id = %result.module_instance_id,
        user_id = %result.user_id,
        method = result.method.as_str(),
        grade = result.grade,
        max_grade = result.max_grade,
        stage = stage.as_str(),
        "Submission graded"
    );

    Ok(ItemOutcome::Graded { result_id: result.id, stage })
}

async fn grade_and_persist(
    state: &AppState,
    item: &QueueItem,
    stage: &mut GradingStage,
) -> Result<(GradingResult, bool)> {
    let payload: JobPayload =
        serde_json::from_value(item.payload.0.clone()).context("Queue payload is not a job")?;

    let grader = Grader::new(state.oracle(), state.settings().oracle().quality);
    let outcome = grader.grade(&payload).await?;
    *stage = GradingStage::Scored;

    let now = primitive_now_utc();
    let result_id = Uuid::new_v4().to_string();
    let mut tx = state.db().begin().await.context("Failed to open grading transaction")?;

    let result = repositories::results::insert_draft(
        &mut *tx,
        NewResult {
            id: &result_id,
            queue_id: &item.id,
            module_instance_id: &item.module_instance_id,
            user_id: &item.user_id,
            course_id: &payload.courseid,
            grade: outcome.grade,
            max_grade: outcome.max_grade,
            reasoning: &outcome.reasoning,
            confidence: outcome.confidence,
            method: outcome.method,
            rubric_analysis: &outcome.analysis,
            now,
        },
    )
    .await
    .context("Failed to store draft result")?;

    repositories::result_criteria::insert_all(&mut tx, &result.id, &outcome.criteria)
        .await
        .context("Failed to store criterion scores")?;

    let trace = TraceEntry {
        at: format_primitive(now),
        event: AuditEvent::Graded,
        message: Some(format!("{} {}/{}", outcome.method.as_str(), outcome.grade, outcome.max_grade)),
        retries: None,
    };
    let still_claimed = repositories::queue::complete(&mut *tx, &item.id, item.claim_token, &trace, now)
        .await
        .context("Failed to complete queue item")?;
    if !still_claimed {
        anyhow::bail!("queue item {} is no longer claimed by this worker", item.id);
    }

    repositories::audit::record(
        &mut *tx,
        NewAuditEntry {
            queue_id: Some(&item.id),
            result_id: Some(&result.id),
            event: AuditEvent::Graded,
            message: None,
            details: json!({
                "method": outcome.method.as_str(),
                "grade": outcome.grade,
                "max_grade": outcome.max_grade,
                "confidence": outcome.confidence,
            }),
            now,
        },
    )
    .await
    .context("Failed to audit grading")?;

    tx.commit().await.context("Failed to commit grading transaction")?;
    *stage = GradingStage::Finalizing;

    Ok((result, payload.auto_release))
}

/// Routes a failed attempt through the retry policy: back to `pending` with a delay, or
/// parked as `failed` once the retry budget is spent.
pub(crate) async fn record_failure(
    state: &AppState,
    item: &QueueItem,
    message: &str,
) -> Result<ItemOutcome> {
    let error: String = message.chars().take(MAX_ERROR_CHARS).collect();
    let now = primitive_now_utc();

    match plan_failure(item.retries, state.settings().queue().backoff_step()) {
        FailurePlan::Retry { retries, delay } => {
            let next_run_at = now + delay;
            let trace = TraceEntry {
                at: format_primitive(now),
                event: AuditEvent::RetryScheduled,
                message: Some(error.clone()),
                retries: Some(retries),
            };
            let updated = repositories::queue::schedule_retry(
                state.db(),
                &item.id,
                item.claim_token,
                retries,
                next_run_at,
                &error,
                &trace,
                now,
            )
            .await
            .context("Failed to schedule retry")?;
            if !updated {
                return Ok(ItemOutcome::Lost);
            }

            repositories::audit::record(
                state.db(),
                NewAuditEntry {
                    queue_id: Some(&item.id),
                    result_id: None,
                    event: AuditEvent::RetryScheduled,
                    message: Some(&error),
                    details: json!({
                        "retries": retries,
                        "next_run_at": format_primitive(next_run_at),
                    }),
                    now,
                },
            )
            .await
            .context("Failed to audit retry")?;
            metrics::counter!("grading_jobs_total", "status" => "retry").increment(1);

            tracing::warn!(
                queue_id = %item.id,
                retries,
                next_run_at = %format_primitive(next_run_at),
                "Grading retry scheduled"
            );
            Ok(ItemOutcome::RetryScheduled { retries })
        }
        FailurePlan::Fail { retries } => {
            let trace = TraceEntry {
                at: format_primitive(now),
                event: AuditEvent::Failed,
                message: Some(error.clone()),
                retries: Some(retries),
            };
            let updated = repositories::queue::mark_failed(
                state.db(),
                &item.id,
                item.claim_token,
                retries,
                &error,
                &trace,
                now,
            )
            .await
            .context("Failed to mark queue item as failed")?;
            if !updated {
                return Ok(ItemOutcome::Lost);
            }

            repositories::audit::record(
                state.db(),
                NewAuditEntry {
                    queue_id: Some(&item.id),
                    result_id: None,
                    event: AuditEvent::Failed,
                    message: Some(&error),
                    details: json!({ "retries": retries }),
                    now,
                },
            )
            .await
            .context("Failed to audit failure")?;
            metrics::counter!("grading_jobs_total", "status" => "failed").increment(1);

            let event = GradeEvent::GradingFailed {
                queue_id: item.id.clone(),
                module_instance_id: item.module_instance_id.clone(),
                user_id: item.user_id.clone(),
                error: error.clone(),
            };
            if let Err(err) = state.gradebook().notify(&event).await {
                tracing::warn!(queue_id = %item.id, error = %err, "Failed to send failure notification");
            }

            tracing::error!(
                queue_id = %item.id,
                module_instance_id = %item.module_instance_id,
                user_id = %item.user_id,
                retries,
                error = %error,
                "Grading failed permanently"
            );
            Ok(ItemOutcome::Failed { retries })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::state::Collaborators;
    use crate::db::types::QueueStatus;
    use crate::services::enqueue::{self, EnqueueOutcome};
    use crate::services::gradebook::testing::RecordingGradebook;
    use crate::services::submission_source::UnconfiguredSource;
    use crate::tasks::grading::recover_stale_claims;
    use crate::test_support;

    async fn queue_job(state: &AppState, payload: &JobPayload) -> String {
        match enqueue::enqueue(state.db(), payload).await.expect("enqueue") {
            EnqueueOutcome::Queued { queue_id } => queue_id,
            other => panic!("expected a queued outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pass_grades_by_key_and_leaves_draft() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let state = &ctx.state;
        let queue_id = queue_job(state, &test_support::job_payload("m1", "u1")).await;

        let summary = run_pass(state).await.expect("pass");
        assert_eq!(summary, PassSummary { claimed: 1, graded: 1, retried: 0, failed: 0 });

        let item = repositories::queue::find_by_id(state.db(), &queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Done);
        assert!(item.completed_at.is_some());
        assert_eq!(item.payload.0["trace"][1]["event"], "graded");

        let results = repositories::results::list(state.db(), Some("m1"), None, 0, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ResultStatus::Draft);
        assert_eq!(results[0].queue_id, queue_id);
        assert_eq!(results[0].grade, 9.25);
    }

    #[tokio::test]
    async fn auto_release_pushes_to_gradebook() {
        let gradebook = Arc::new(RecordingGradebook::default());
        let collaborators = Collaborators {
            oracle: None,
            gradebook: gradebook.clone(),
            submissions: Arc::new(UnconfiguredSource),
        };
        let Some(ctx) = test_support::setup_test_context_with(collaborators).await else {
            return;
        };
        let state = &ctx.state;
        let mut payload = test_support::job_payload("m1", "u1");
        payload.auto_release = true;
        queue_job(state, &payload).await;

        let item = repositories::queue::claim_eligible(state.db(), 1, primitive_now_utc())
            .await
            .unwrap()
            .remove(0);
        let outcome = process_item(state, &item).await.unwrap();

        let ItemOutcome::Graded { result_id, stage } = outcome else {
            panic!("expected a graded outcome, got {outcome:?}");
        };
        assert_eq!(stage, GradingStage::AutoReleased);
        let result = repositories::results::find_by_id(state.db(), &result_id).await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Released);
        assert!(!result.reviewed);
        assert_eq!(gradebook.entries().len(), 1);
    }

    #[tokio::test]
    async fn empty_submission_retries_then_fails() {
        let gradebook = Arc::new(RecordingGradebook::default());
        let collaborators = Collaborators {
            oracle: None,
            gradebook: gradebook.clone(),
            submissions: Arc::new(UnconfiguredSource),
        };
        let Some(ctx) = test_support::setup_test_context_with(collaborators).await else {
            return;
        };
        let state = &ctx.state;
        let mut payload = test_support::job_payload("m1", "u1");
        payload.submission_text = String::from("<p> </p>");
        let queue_id = queue_job(state, &payload).await;

        let summary = run_pass(state).await.unwrap();
        assert_eq!(summary.retried, 1);
        let item = repositories::queue::find_by_id(state.db(), &queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retries, 1);
        let delay = item.next_run_at.unwrap().assume_utc() - item.updated_at.assume_utc();
        assert_eq!(delay, state.settings().queue().backoff_step());

        // Not eligible again until the backoff elapses.
        assert_eq!(run_pass(state).await.unwrap().claimed, 0);

        sqlx::query(
            "UPDATE grading_queue SET status = 'processing', retries = 2, started_at = now() WHERE id = $1",
        )
        .bind(&queue_id)
        .execute(state.db())
        .await
        .unwrap();
        let item = repositories::queue::find_by_id(state.db(), &queue_id).await.unwrap().unwrap();
        let outcome = record_failure(state, &item, "submission text is empty").await.unwrap();
        assert_eq!(outcome, ItemOutcome::Failed { retries: 3 });

        let item = repositories::queue::find_by_id(state.db(), &queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.last_error.as_deref(), Some("submission text is empty"));
        assert!(matches!(gradebook.events()[0], GradeEvent::GradingFailed { .. }));
    }

    #[tokio::test]
    async fn failure_on_lost_claim_changes_nothing() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let state = &ctx.state;
        let queue_id = queue_job(state, &test_support::job_payload("m1", "u1")).await;
        let item = repositories::queue::find_by_id(state.db(), &queue_id).await.unwrap().unwrap();

        let outcome = record_failure(state, &item, "boom").await.unwrap();
        assert_eq!(outcome, ItemOutcome::Lost);
        let audit = repositories::audit::list_for_queue(state.db(), &queue_id).await.unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn pass_claims_each_item_only_when_it_starts() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let state = &ctx.state;
        let first = queue_job(state, &test_support::job_payload("m1", "u1")).await;
        let second = queue_job(state, &test_support::job_payload("m1", "u2")).await;

        let summary = run_pass(state).await.unwrap();
        assert_eq!(summary, PassSummary { claimed: 2, graded: 2, retried: 0, failed: 0 });

        let first = repositories::queue::find_by_id(state.db(), &first).await.unwrap().unwrap();
        let second = repositories::queue::find_by_id(state.db(), &second).await.unwrap().unwrap();
        assert_eq!((first.retries, second.retries), (0, 0));
        assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
    }

    #[tokio::test]
    async fn stale_recovery_never_touches_items_waiting_for_their_turn() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let state = &ctx.state;
        let slow = queue_job(state, &test_support::job_payload("m1", "u1")).await;
        let waiting = queue_job(state, &test_support::job_payload("m1", "u2")).await;

        let claimed = repositories::queue::claim_next(state.db(), primitive_now_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, slow);
        sqlx::query("UPDATE grading_queue SET started_at = started_at - interval '1 day' WHERE id = $1")
            .bind(&slow)
            .execute(state.db())
            .await
            .unwrap();

        assert_eq!(recover_stale_claims(state).await.unwrap(), 1);

        let item = repositories::queue::find_by_id(state.db(), &waiting).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retries, 0);
        assert!(item.started_at.is_none());
        assert!(item.last_error.is_none());

        let claimed = repositories::queue::claim_next(state.db(), primitive_now_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, waiting);
        assert!(matches!(process_item(state, &claimed).await.unwrap(), ItemOutcome::Graded { .. }));
    }

    #[tokio::test]
    async fn late_worker_cannot_overwrite_a_newer_claim() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let state = &ctx.state;
        let queue_id = queue_job(state, &test_support::job_payload("m1", "u1")).await;

        let first_claim = repositories::queue::claim_next(state.db(), primitive_now_utc())
            .await
            .unwrap()
            .unwrap();
        sqlx::query("UPDATE grading_queue SET started_at = started_at - interval '1 day' WHERE id = $1")
            .bind(&queue_id)
            .execute(state.db())
            .await
            .unwrap();
        assert_eq!(recover_stale_claims(state).await.unwrap(), 1);
        sqlx::query("UPDATE grading_queue SET next_run_at = NULL WHERE id = $1")
            .bind(&queue_id)
            .execute(state.db())
            .await
            .unwrap();

        let second_claim = repositories::queue::claim_next(state.db(), primitive_now_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second_claim.retries, 1);
        assert_ne!(second_claim.claim_token, first_claim.claim_token);

        let outcome = record_failure(state, &first_claim, "late failure").await.unwrap();
        assert_eq!(outcome, ItemOutcome::Lost);

        let item = repositories::queue::find_by_id(state.db(), &queue_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Processing);
        assert_eq!(item.retries, 1);
        assert!(item.last_error.unwrap().contains("claim expired"));

        let outcome = process_item(state, &second_claim).await.unwrap();
        assert!(matches!(outcome, ItemOutcome::Graded { .. }));
    }

    #[tokio::test]
    async fn auto_release_that_fails_after_the_transition_reports_released() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let state = &ctx.state;
        sqlx::query(
            "CREATE FUNCTION reject_auto_release_audit() RETURNS trigger AS $$
             BEGIN
                 IF NEW.event = 'auto_released' THEN
                     RAISE EXCEPTION 'audit log unavailable';
                 END IF;
                 RETURN NEW;
             END
             $$ LANGUAGE plpgsql",
        )
        .execute(state.db())
        .await
        .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_auto_release_audit BEFORE INSERT ON grading_audit_log
             FOR EACH ROW EXECUTE FUNCTION reject_auto_release_audit()",
        )
        .execute(state.db())
        .await
        .unwrap();
        let mut payload = test_support::job_payload("m1", "u1");
        payload.auto_release = true;
        queue_job(state, &payload).await;

        let item = repositories::queue::claim_next(state.db(), primitive_now_utc())
            .await
            .unwrap()
            .unwrap();
        let outcome = process_item(state, &item).await.unwrap();

        let ItemOutcome::Graded { result_id, stage } = outcome else {
            panic!("expected a graded outcome, got {outcome:?}");
        };
        assert_eq!(stage, GradingStage::AutoReleased);
        let result = repositories::results::find_by_id(state.db(), &result_id).await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Released);
    }
}
