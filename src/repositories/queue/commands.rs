use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{QueueItem, TraceEntry};
use crate::db::types::QueueStatus;

use super::types::COLUMNS;

pub(crate) async fn insert(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    module_instance_id: &str,
    user_id: &str,
    payload: &serde_json::Value,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO grading_queue (
            id, module_instance_id, user_id, status, payload, retries, created_at, updated_at
         )
         VALUES ($1, $2, $3, $4, $5, 0, $6, $6)",
    )
    .bind(id)
    .bind(module_instance_id)
    .bind(user_id)
    .bind(QueueStatus::Pending)
    .bind(Json(payload))
    .bind(now)
    .execute(executor)
    .await?;

    Ok(())
}

/// Moves up to `limit` eligible items to `processing` under a fresh claim token and
/// returns them oldest first. Rows locked by another worker are skipped, never shared.
pub(crate) async fn claim_eligible(
    pool: &PgPool,
    limit: i64,
    now: PrimitiveDateTime,
) -> Result<Vec<QueueItem>, sqlx::Error> {
    let mut items = sqlx::query_as::<_, QueueItem>(&format!(
        "WITH candidate AS (
            SELECT id AS candidate_id
            FROM grading_queue
            WHERE status = $1
              AND (next_run_at IS NULL OR next_run_at <= $2)
            ORDER BY created_at, id
            FOR UPDATE SKIP LOCKED
            LIMIT $3
        )
        UPDATE grading_queue
        SET status = $4,
            started_at = $2,
            claim_token = $5,
            updated_at = $2
        FROM candidate
        WHERE grading_queue.id = candidate.candidate_id
        RETURNING {COLUMNS}"
    ))
    .bind(QueueStatus::Pending)
    .bind(now)
    .bind(limit)
    .bind(QueueStatus::Processing)
    .bind(Uuid::new_v4())
    .fetch_all(pool)
    .await?;

    items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(items)
}

/// Claims the single oldest eligible item, if any.
pub(crate) async fn claim_next(
    pool: &PgPool,
    now: PrimitiveDateTime,
) -> Result<Option<QueueItem>, sqlx::Error> {
    Ok(claim_eligible(pool, 1, now).await?.pop())
}

/// Marks a claimed item `done`. Returns `false` when the item was no longer ours.
pub(crate) async fn complete(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    claim_token: Option<Uuid>,
    trace: &TraceEntry,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE grading_queue
         SET status = $1,
             completed_at = $2,
             next_run_at = NULL,
             last_error = NULL,
             payload = jsonb_set(
                 payload,
                 '{trace}',
                 COALESCE(payload -> 'trace', '[]'::jsonb) || jsonb_build_array($3::jsonb)
             ),
             claim_token = NULL,
             updated_at = $2
         WHERE id = $4 AND status = $5 AND claim_token IS NOT DISTINCT FROM $6",
    )
    .bind(QueueStatus::Done)
    .bind(now)
    .bind(Json(trace))
    .bind(id)
    .bind(QueueStatus::Processing)
    .bind(claim_token)
    .execute(executor)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn schedule_retry(
    pool: &PgPool,
    id: &str,
    claim_token: Option<Uuid>,
    retries: i32,
    next_run_at: PrimitiveDateTime,
    error: &str,
    trace: &TraceEntry,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE grading_queue
         SET status = $1,
             retries = $2,
             next_run_at = $3,
             last_error = $4,
             started_at = NULL,
             claim_token = NULL,
             payload = jsonb_set(
                 payload,
                 '{trace}',
                 COALESCE(payload -> 'trace', '[]'::jsonb) || jsonb_build_array($5::jsonb)
             ),
             updated_at = $6
         WHERE id = $7 AND status = $8 AND claim_token IS NOT DISTINCT FROM $9",
    )
    .bind(QueueStatus::Pending)
    .bind(retries)
    .bind(next_run_at)
    .bind(error)
    .bind(Json(trace))
    .bind(now)
    .bind(id)
    .bind(QueueStatus::Processing)
    .bind(claim_token)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

pub(crate) async fn mark_failed(
    pool: &PgPool,
    id: &str,
    claim_token: Option<Uuid>,
    retries: i32,
    error: &str,
    trace: &TraceEntry,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE grading_queue
         SET status = $1,
             retries = $2,
             next_run_at = NULL,
             last_error = $3,
             completed_at = $4,
             claim_token = NULL,
             payload = jsonb_set(
                 payload,
                 '{trace}',
                 COALESCE(payload -> 'trace', '[]'::jsonb) || jsonb_build_array($5::jsonb)
             ),
             updated_at = $4
         WHERE id = $6 AND status = $7 AND claim_token IS NOT DISTINCT FROM $8",
    )
    .bind(QueueStatus::Failed)
    .bind(retries)
    .bind(error)
    .bind(now)
    .bind(Json(trace))
    .bind(id)
    .bind(QueueStatus::Processing)
    .bind(claim_token)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

/// Deletes `done` and `failed` items that completed before `cutoff`.
pub(crate) async fn purge_terminal(
    pool: &PgPool,
    cutoff: PrimitiveDateTime,
) -> Result<u64, sqlx::Error> {
    let deleted = sqlx::query(
        "DELETE FROM grading_queue
         WHERE status IN ($1, $2)
           AND completed_at < $3",
    )
    .bind(QueueStatus::Done)
    .bind(QueueStatus::Failed)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(deleted.rows_affected())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;
    use time::Duration;

    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn claim_takes_oldest_eligible_and_skips_terminal_and_delayed() {
        let Some(ctx) = test_support::setup_test_context().await else {
            return;
        };
        let pool = ctx.state.db();
        let now = datetime!(2025-03-01 12:00:00);
        for (id, minutes_ago) in [("a", 50), ("b", 40), ("c", 30), ("d", 20), ("e", 10), ("f", 5)] {
            insert(pool, id, "m1", id, &json!({}), now - Duration::minutes(minutes_ago))
                .await
                .expect("insert");
        }
        sqlx::query("UPDATE grading_queue SET status = 'done', completed_at = $1 WHERE id = 'b'")
            .bind(now)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("UPDATE grading_queue SET status = 'failed', retries = 3 WHERE id = 'c'")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("UPDATE grading_queue SET next_run_at = $1 WHERE id = 'd'")
            .bind(now + Duration::minutes(10))
            .execute(pool)
            .await
            .unwrap();

        let first = claim_eligible(pool, 2, now).await.unwrap();
        let ids: Vec<&str> = first.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, ["a", "e"]);
        assert!(first.iter().all(|item| item.status == QueueStatus::Processing));
        assert!(first.iter().all(|item| item.started_at == Some(now) && item.claim_token.is_some()));

        let rest = claim_eligible(pool, 10, now).await.unwrap();
        let ids: Vec<&str> = rest.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, ["f"]);
        assert_ne!(rest[0].claim_token, first[0].claim_token);

        assert!(claim_next(pool, now).await.unwrap().is_none());
    }
}
