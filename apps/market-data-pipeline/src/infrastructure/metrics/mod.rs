//! Prometheus Metrics
//!
//! Installs the global `metrics` recorder and describes the pipeline's
//! metrics. Call sites use the `metrics` macros directly; the rendered text
//! is served at `/metrics` on the health port.
//!
//! # Metrics
//!
//! - `feed_ticks_received_total`, `feed_frames_dropped_total{reason}`
//! - `feed_connects_total`, `feed_reconnects_total{reason}`
//! - `ticks_written_total`
//! - `materializations_total{kind, outcome}`
//! - `scheduler_job_runs_total{job, outcome}`
//! - `subscriptions_active`, `worker_pool_size`

use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the first handle.
///
/// # Errors
///
/// Returns an error if another recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// The installed handle, `None` before [`init_metrics`].
#[must_use]
pub fn metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn describe_metrics() {
    // Feed
    describe_counter!(
        "feed_ticks_received_total",
        "Ticks decoded from the exchange feed"
    );
    describe_counter!(
        "feed_frames_dropped_total",
        "Feed frames dropped, by reason"
    );
    describe_counter!("feed_connects_total", "Successful feed connections");
    describe_counter!(
        "feed_reconnects_total",
        "Scheduled feed reconnects, by reason"
    );

    // Pipeline
    describe_counter!(
        "ticks_written_total",
        "Feed ticks written to the time-series store"
    );
    describe_counter!(
        "materializations_total",
        "Cache materializations, by query kind and outcome"
    );
    describe_counter!(
        "scheduler_job_runs_total",
        "Scheduled job runs, by job and outcome"
    );

    describe_gauge!("subscriptions_active", "Registry subscription rows");
    describe_gauge!("worker_pool_size", "Current worker pool concurrency target");
}
