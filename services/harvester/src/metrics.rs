//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade; this module installs
//! the recorder that renders them on `/metrics`:
//!
//! - `harvest_upstream_calls_total` (counter): label `outcome`
//! - `harvest_upstream_retries_total` (counter): label `classification`
//! - `harvest_pool_healthy_credentials` (gauge)
//! - `harvest_credential_errors_total` (counter): label `classification`
//! - `harvest_job_runs_total` (counter): labels `job`, `status`
//! - `harvest_job_duration_seconds` (histogram): label `job`
//! - `harvest_manual_triggers_total` (counter): labels `job`, `status`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Job runs range from a single sub-second call to multi-hour batches.
const JOB_DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("harvest_job_duration_seconds".to_string()),
        JOB_DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `harvest_job_duration_seconds` gets explicit buckets so it renders as a
/// histogram rather than the exporter's default summary.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record an admin-initiated job run.
pub fn record_manual_trigger(job: &str, status: &'static str) {
    metrics::counter!("harvest_manual_triggers_total", "job" => job.to_string(), "status" => status)
        .increment(1);
}
