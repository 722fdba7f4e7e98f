mod commands;
mod queries;
mod types;

pub(crate) use commands::{
    claim_eligible, claim_next, complete, insert, mark_failed, purge_terminal, schedule_retry,
};
pub(crate) use queries::{find_active_for, find_by_id, list_stale, stats};
pub(crate) use types::QueueStats;
