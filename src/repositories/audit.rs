use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::AuditEntry;
use crate::db::types::AuditEvent;

const COLUMNS: &str = "id, queue_id, result_id, event, message, details, created_at";

pub(crate) struct NewAuditEntry<'a> {
    pub(crate) queue_id: Option<&'a str>,
    pub(crate) result_id: Option<&'a str>,
    pub(crate) event: AuditEvent,
    pub(crate) message: Option<&'a str>,
    pub(crate) details: serde_json::Value,
    pub(crate) now: PrimitiveDateTime,
}

pub(crate) async fn record(
    executor: impl sqlx::PgExecutor<'_>,
    entry: NewAuditEntry<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO grading_audit_log (queue_id, result_id, event, message, details, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(entry.queue_id)
    .bind(entry.result_id)
    .bind(entry.event)
    .bind(entry.message)
    .bind(Json(entry.details))
    .bind(entry.now)
    .execute(executor)
    .await?;

    Ok(())
}

pub(crate) async fn list_for_queue(
    pool: &PgPool,
    queue_id: &str,
) -> Result<Vec<AuditEntry>, sqlx::Error> {
    sqlx::query_as::<_, AuditEntry>(&format!(
        "SELECT {COLUMNS}
         FROM grading_audit_log
         WHERE queue_id = $1
         ORDER BY id"
    ))
    .bind(queue_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list_for_result(
    pool: &PgPool,
    result_id: &str,
) -> Result<Vec<AuditEntry>, sqlx::Error> {
    sqlx::query_as::<_, AuditEntry>(&format!(
        "SELECT {COLUMNS}
         FROM grading_audit_log
         WHERE result_id = $1
         ORDER BY id"
    ))
    .bind(result_id)
    .fetch_all(pool)
    .await
}
