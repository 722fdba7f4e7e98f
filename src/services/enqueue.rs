use std::collections::HashSet;

use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::core::time::{format_primitive, primitive_now_utc};
use crate::db::models::{JobPayload, TraceEntry};
use crate::db::types::AuditEvent;
use crate::repositories;
use crate::repositories::audit::NewAuditEntry;
use crate::services::submission_source::{SourceError, SubmissionSource};

#[derive(Debug, Error)]
pub(crate) enum EnqueueError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    Queued { queue_id: String },
    /// A draft or released result already exists for the pair.
    AlreadyGraded { result_id: String },
    /// A pending or processing item already exists for the pair.
    AlreadyQueued { queue_id: String },
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub(crate) struct BatchSummary {
    pub(crate) queued: u32,
    pub(crate) already_graded: u32,
    pub(crate) errors: Vec<BatchItemError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct BatchItemError {
    pub(crate) user_id: String,
    pub(crate) message: String,
}

fn validate(payload: &JobPayload) -> Result<(), EnqueueError> {
    let required = [
        ("userid", &payload.userid),
        ("courseid", &payload.courseid),
        ("module_instance_id", &payload.module_instance_id),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(EnqueueError::Invalid(format!("{field} must not be empty")));
        }
    }
    Ok(())
}

/// Queues one submission unless the pair already has a live result or a live queue item.
/// The check and the insert run under a per-pair advisory lock.
pub(crate) async fn enqueue(
    pool: &PgPool,
    payload: &JobPayload,
) -> Result<EnqueueOutcome, EnqueueError> {
    validate(payload)?;

    let now = primitive_now_utc();
    let mut job = payload.clone();
    job.trace = vec![TraceEntry {
        at: format_primitive(now),
        event: AuditEvent::Queued,
        message: None,
        retries: None,
    }];
    let document =
        serde_json::to_value(&job).map_err(|err| EnqueueError::Invalid(err.to_string()))?;

    let instance = job.module_instance_id.as_str();
    let user = job.userid.as_str();

    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("{instance}:{user}"))
        .execute(&mut *tx)
        .await?;

    if let Some(result_id) = repositories::results::find_active_for(&mut *tx, instance, user).await? {
        return Ok(EnqueueOutcome::AlreadyGraded { result_id });
    }
    if let Some(queue_id) = repositories::queue::find_active_for(&mut *tx, instance, user).await? {
        return Ok(EnqueueOutcome::AlreadyQueued { queue_id });
    }

    let queue_id = Uuid::new_v4().to_string();
    repositories::queue::insert(&mut *tx, &queue_id, instance, user, &document, now).await?;
    repositories::audit::record(
        &mut *tx,
        NewAuditEntry {
            queue_id: Some(&queue_id),
            result_id: None,
            event: AuditEvent::Queued,
            message: None,
            details: serde_json::json!({
                "module_instance_id": instance,
                "user_id": user,
                "module_name": job.module_name,
            }),
            now,
        },
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        queue_id = %queue_id,
        module_instance_id = %instance,
        user_id = %user,
        "Submission queued for grading"
    );

    Ok(EnqueueOutcome::Queued { queue_id })
}

/// Pulls submissions for one module instance from the host and queues each of them.
/// Problems with individual users end up in `errors`; only a source-level failure aborts.
pub(crate) async fn trigger_batch(
    pool: &PgPool,
    source: &dyn SubmissionSource,
    module_instance_id: &str,
    user_ids: Option<&[String]>,
) -> Result<BatchSummary, SourceError> {
    let submissions = source.list_submissions(module_instance_id, user_ids).await?;
    let mut summary = BatchSummary::default();
    let mut seen = HashSet::new();

    for submission in submissions {
        let user_id = submission.user_id.clone();
        seen.insert(user_id.clone());

        let payload = match submission.payload {
            Ok(payload) => payload,
            Err(message) => {
                summary.errors.push(BatchItemError { user_id, message });
                continue;
            }
        };

        if payload.module_instance_id != module_instance_id {
            summary.errors.push(BatchItemError {
                user_id,
                message: format!(
                    "submission belongs to module instance {}",
                    payload.module_instance_id
                ),
            });
            continue;
        }

        match enqueue(pool, &payload).await {
            Ok(EnqueueOutcome::Queued { .. }) => summary.queued += 1,
            Ok(EnqueueOutcome::AlreadyGraded { .. } | EnqueueOutcome::AlreadyQueued { .. }) => {
                summary.already_graded += 1
            }
            Err(err) => {
                tracing::warn!(
                    module_instance_id = %module_instance_id,
                    user_id = %user_id,
                    error = %err,
                    "Failed to queue submission from batch"
                );
                summary.errors.push(BatchItemError { user_id, message: err.to_string() });
            }
        }
    }

    for requested in user_ids.unwrap_or_default() {
        if !seen.contains(requested) {
            summary.errors.push(BatchItemError {
                user_id: requested.clone(),
                message: String::from("no submission found for this user"),
            });
        }
    }

    tracing::info!(
        module_instance_id = %module_instance_id,
        queued = summary.queued,
        already_graded = summary.already_graded,
        errors = summary.errors.len(),
        "Batch grading trigger finished"
    );

    Ok(summary)
}
