use anyhow::{Context, Result};
use time::Duration;

use crate::core::state::AppState;
use crate::core::time::{primitive_now_utc, seconds_as_duration};
use crate::repositories;
use crate::services::review;

use super::worker::{record_failure, ItemOutcome};

const STALE_BATCH: i64 = 100;
const RESYNC_BATCH: i64 = 50;

/// Items a crashed worker left in `processing` are charged one failed attempt and routed
/// through the normal retry policy.
pub(crate) async fn recover_stale_claims(state: &AppState) -> Result<usize> {
    let cutoff = primitive_now_utc() - seconds_as_duration(state.settings().stale_claim_seconds());
    let items = repositories::queue::list_stale(state.db(), cutoff, STALE_BATCH)
        .await
        .context("Failed to list stale queue items")?;

    let mut recovered = 0;
    for item in &items {
        match record_failure(state, item, "claim expired before grading finished").await {
            Ok(ItemOutcome::Lost) => {}
            Ok(_) => recovered += 1,
            Err(err) => {
                tracing::error!(queue_id = %item.id, error = %err, "Failed to recover stale claim");
            }
        }
    }

    if recovered > 0 {
        tracing::warn!(recovered, "Recovered stale queue claims");
        metrics::counter!("queue_stale_claims_recovered_total").increment(recovered as u64);
    }

    Ok(recovered)
}

pub(crate) async fn purge_expired(state: &AppState) -> Result<u64> {
    let retention_days = state.settings().queue().retention_days.min(i64::MAX as u64) as i64;
    let cutoff = primitive_now_utc() - Duration::days(retention_days);
    let purged = repositories::queue::purge_terminal(state.db(), cutoff)
        .await
        .context("Failed to purge terminal queue items")?;

    if purged > 0 {
        tracing::info!(purged, retention_days, "Purged terminal queue items");
        metrics::counter!("queue_items_purged_total").increment(purged);
    }

    Ok(purged)
}

/// Retries gradebook pushes for released results that never synced.
pub(crate) async fn resync_gradebook(state: &AppState) -> Result<usize> {
    let pending = repositories::results::list_unsynced_released(state.db(), RESYNC_BATCH)
        .await
        .context("Failed to list unsynced results")?;

    let mut synced = 0;
    for result in &pending {
        if review::push_to_gradebook(state.db(), state.gradebook(), result)
            .await
            .context("Failed to record gradebook sync")?
        {
            synced += 1;
        }
    }

    if !pending.is_empty() {
        tracing::info!(pending = pending.len(), synced, "Gradebook resync finished");
    }

    Ok(synced)
}
