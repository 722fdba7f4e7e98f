use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    if PROM_HANDLE.get().is_none() {
        let handle = PrometheusBuilder::new().install_recorder()?;
        let _ = PROM_HANDLE.set(handle);
    }
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    describe_counter!("grading_jobs_total", "Queue items processed, labelled by outcome");
    describe_histogram!(
        "grading_duration_seconds",
        Unit::Seconds,
        "Time spent grading one claimed queue item"
    );
    describe_histogram!(
        "grading_queue_latency_seconds",
        Unit::Seconds,
        "Delay between enqueue and claim"
    );
    describe_counter!("similarity_fallback_total", "Semantic scoring fell back to term overlap");
    describe_counter!("results_released_total", "Results released to the gradebook");
    describe_counter!("results_rejected_total", "Results rejected by a reviewer");
    describe_counter!("queue_items_purged_total", "Terminal queue items purged after retention");
    describe_counter!(
        "queue_stale_claims_recovered_total",
        "Processing claims recovered after their worker disappeared"
    );
}
