use time::PrimitiveDateTime;

pub(crate) const COLUMNS: &str = "\
    id, module_instance_id, user_id, status, payload, retries, next_run_at, last_error, \
    created_at, started_at, claim_token, completed_at, updated_at";

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub(crate) struct QueueStats {
    pub(crate) pending: i64,
    pub(crate) processing: i64,
    pub(crate) completed: i64,
    pub(crate) failed: i64,
    pub(crate) total: i64,
    pub(crate) oldest_pending_at: Option<PrimitiveDateTime>,
    pub(crate) average_processing_seconds: Option<f64>,
}
