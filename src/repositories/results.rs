use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::GradingResult;
use crate::db::types::{GradingMethod, ResultStatus};

pub(crate) const COLUMNS: &str = "\
    id, queue_id, module_instance_id, user_id, course_id, grade, max_grade, reasoning, \
    confidence, method, rubric_analysis, status, reviewed, reviewer_id, reject_reason, \
    gradebook_synced_at, created_at, reviewed_at, updated_at";

pub(crate) struct NewResult<'a> {
    pub(crate) id: &'a str,
    pub(crate) queue_id: &'a str,
    pub(crate) module_instance_id: &'a str,
    pub(crate) user_id: &'a str,
    pub(crate) course_id: &'a str,
    pub(crate) grade: f64,
    pub(crate) max_grade: f64,
    pub(crate) reasoning: &'a str,
    pub(crate) confidence: f64,
    pub(crate) method: GradingMethod,
    pub(crate) rubric_analysis: &'a serde_json::Value,
    pub(crate) now: PrimitiveDateTime,
}

/// Review decision applied to a draft.
pub(crate) struct Transition<'a> {
    pub(crate) to: ResultStatus,
    pub(crate) reviewer_id: Option<&'a str>,
    pub(crate) reject_reason: Option<&'a str>,
    pub(crate) now: PrimitiveDateTime,
}

pub(crate) async fn insert_draft(
    executor: impl sqlx::PgExecutor<'_>,
    params: NewResult<'_>,
) -> Result<GradingResult, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "INSERT INTO grading_results (
            id, queue_id, module_instance_id, user_id, course_id, grade, max_grade, reasoning,
            confidence, method, rubric_analysis, status, reviewed, created_at, updated_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, FALSE, $13, $13)
         RETURNING {COLUMNS}"
    ))
    .bind(params.id)
    .bind(params.queue_id)
    .bind(params.module_instance_id)
    .bind(params.user_id)
    .bind(params.course_id)
    .bind(params.grade)
    .bind(params.max_grade)
    .bind(params.reasoning)
    .bind(params.confidence)
    .bind(params.method)
    .bind(Json(params.rubric_analysis))
    .bind(ResultStatus::Draft)
    .bind(params.now)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "SELECT {COLUMNS}
         FROM grading_results
         WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Id of the non-rejected result for the pair, if any.
pub(crate) async fn find_active_for(
    executor: impl sqlx::PgExecutor<'_>,
    module_instance_id: &str,
    user_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT id
         FROM grading_results
         WHERE module_instance_id = $1
           AND user_id = $2
           AND status <> $3
         LIMIT 1",
    )
    .bind(module_instance_id)
    .bind(user_id)
    .bind(ResultStatus::Rejected)
    .fetch_optional(executor)
    .await
}

/// Applies `transition` only while the result is still a draft. `None` means the row is
/// missing or already terminal.
pub(crate) async fn transition_from_draft(
    pool: &PgPool,
    id: &str,
    transition: Transition<'_>,
) -> Result<Option<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "UPDATE grading_results
         SET status = $1,
             reviewed = $2,
             reviewer_id = $3,
             reject_reason = $4,
             reviewed_at = $5,
             updated_at = $5
         WHERE id = $6 AND status = $7
         RETURNING {COLUMNS}"
    ))
    .bind(transition.to)
    .bind(transition.reviewer_id.is_some())
    .bind(transition.reviewer_id)
    .bind(transition.reject_reason)
    .bind(transition.now)
    .bind(id)
    .bind(ResultStatus::Draft)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn mark_synced(
    pool: &PgPool,
    id: &str,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE grading_results
         SET gradebook_synced_at = $1,
             updated_at = $1
         WHERE id = $2",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) async fn list_unsynced_released(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "SELECT {COLUMNS}
         FROM grading_results
         WHERE status = $1
           AND gradebook_synced_at IS NULL
         ORDER BY reviewed_at, id
         LIMIT $2"
    ))
    .bind(ResultStatus::Released)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list(
    pool: &PgPool,
    module_instance_id: Option<&str>,
    status: Option<ResultStatus>,
    skip: i64,
    limit: i64,
) -> Result<Vec<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(&format!(
        "SELECT {COLUMNS}
         FROM grading_results
         WHERE ($1::text IS NULL OR module_instance_id = $1)
           AND ($2::resultstatus IS NULL OR status = $2)
         ORDER BY created_at DESC, id
         OFFSET $3
         LIMIT $4"
    ))
    .bind(module_instance_id)
    .bind(status)
    .bind(skip)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub(crate) async fn count(
    pool: &PgPool,
    module_instance_id: Option<&str>,
    status: Option<ResultStatus>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*)
         FROM grading_results
         WHERE ($1::text IS NULL OR module_instance_id = $1)
           AND ($2::resultstatus IS NULL OR status = $2)",
    )
    .bind(module_instance_id)
    .bind(status)
    .fetch_one(pool)
    .await
}
