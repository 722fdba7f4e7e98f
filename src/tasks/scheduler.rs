use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::state::AppState;
use crate::tasks::grading;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

pub(crate) async fn run(state: AppState) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = vec![
        tokio::spawn(grading_loop(state.clone(), shutdown_rx.clone())),
        tokio::spawn(maintenance_loop(state.clone(), shutdown_rx.clone())),
        tokio::spawn(retention_loop(state.clone(), shutdown_rx.clone())),
    ];

    tracing::info!(
        batch_size = state.settings().queue().batch_size,
        poll_interval_seconds = state.settings().queue().poll_interval_seconds,
        oracle_enabled = state.oracle().is_some(),
        "Grading worker started"
    );

    crate::core::shutdown::broadcast_on_signal(shutdown_tx).await;

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn grading_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(Duration::from_secs(state.settings().queue().poll_interval_seconds));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = grading::run_pass(&state).await {
                    tracing::error!(error = %err, "grading pass failed");
                }
            }
        }
    }
}

async fn maintenance_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick =
        interval(Duration::from_secs(state.settings().queue().maintenance_interval_seconds));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = grading::recover_stale_claims(&state).await {
                    tracing::error!(error = %err, "recover_stale_claims failed");
                }
                if let Err(err) = grading::resync_gradebook(&state).await {
                    tracing::error!(error = %err, "resync_gradebook failed");
                }
            }
        }
    }
}

async fn retention_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(RETENTION_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = grading::purge_expired(&state).await {
                    tracing::error!(error = %err, "purge_expired failed");
                }
            }
        }
    }
}
