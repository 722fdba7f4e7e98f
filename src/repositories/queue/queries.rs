use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::QueueItem;
use crate::db::types::QueueStatus;

use super::types::{QueueStats, COLUMNS};

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<QueueItem>, sqlx::Error> {
    sqlx::query_as::<_, QueueItem>(&format!(
        "SELECT {COLUMNS}
         FROM grading_queue
         WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Id of a pending or processing item for the pair, if any.
pub(crate) async fn find_active_for(
    executor: impl sqlx::PgExecutor<'_>,
    module_instance_id: &str,
    user_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT id
         FROM grading_queue
         WHERE module_instance_id = $1
           AND user_id = $2
           AND status IN ($3, $4)
         ORDER BY created_at
         LIMIT 1",
    )
    .bind(module_instance_id)
    .bind(user_id)
    .bind(QueueStatus::Pending)
    .bind(QueueStatus::Processing)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn stats(
    pool: &PgPool,
    module_instance_id: Option<&str>,
) -> Result<QueueStats, sqlx::Error> {
    sqlx::query_as::<_, QueueStats>(
        "SELECT COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'done') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total,
                MIN(created_at) FILTER (WHERE status = 'pending') AS oldest_pending_at,
                (AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))
                    FILTER (WHERE status = 'done' AND started_at IS NOT NULL))::float8
                    AS average_processing_seconds
         FROM grading_queue
         WHERE ($1::text IS NULL OR module_instance_id = $1)",
    )
    .bind(module_instance_id)
    .fetch_one(pool)
    .await
}

/// Items still marked `processing` whose claim is older than `cutoff`.
pub(crate) async fn list_stale(
    pool: &PgPool,
    cutoff: PrimitiveDateTime,
    limit: i64,
) -> Result<Vec<QueueItem>, sqlx::Error> {
    sqlx::query_as::<_, QueueItem>(&format!(
        "SELECT {COLUMNS}
         FROM grading_queue
         WHERE status = $1
           AND started_at < $2
         ORDER BY started_at
         LIMIT $3"
    ))
    .bind(QueueStatus::Processing)
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await
}
