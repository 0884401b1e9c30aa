//! Worker metrics.
//!
//! Counters and histograms for the job lifecycle, exported through
//! Prometheus when a listener address is configured.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "renderq_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "renderq_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "renderq_jobs_failed_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "renderq_jobs_cancelled_total";
    pub const POLL_TICKS_TOTAL: &str = "renderq_poll_ticks_total";
    pub const STATUS_ERRORS_TOTAL: &str = "renderq_status_errors_total";
    pub const UPLOAD_FALLBACKS_TOTAL: &str = "renderq_upload_fallbacks_total";
    pub const RENDER_DURATION_SECONDS: &str = "renderq_render_duration_seconds";
}

/// Install the Prometheus recorder and its HTTP listener.
pub fn install_exporter(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config(format!("metrics exporter: {}", e)))
}

pub fn record_job_started(algorithm: &str) {
    counter!(names::JOBS_STARTED_TOTAL, "algorithm" => algorithm.to_string()).increment(1);
}

pub fn record_job_completed(algorithm: &str, kind: &str) {
    counter!(
        names::JOBS_COMPLETED_TOTAL,
        "algorithm" => algorithm.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_job_failed(algorithm: &str, reason: &str) {
    counter!(
        names::JOBS_FAILED_TOTAL,
        "algorithm" => algorithm.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_job_cancelled(algorithm: &str) {
    counter!(names::JOBS_CANCELLED_TOTAL, "algorithm" => algorithm.to_string()).increment(1);
}

pub fn record_poll_tick(backend: &str) {
    counter!(names::POLL_TICKS_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn record_status_error(backend: &str) {
    counter!(names::STATUS_ERRORS_TOTAL, "backend" => backend.to_string()).increment(1);
}

pub fn record_upload_fallback(kind: &str) {
    counter!(names::UPLOAD_FALLBACKS_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_render_duration(algorithm: &str, seconds: f64) {
    histogram!(names::RENDER_DURATION_SECONDS, "algorithm" => algorithm.to_string()).record(seconds);
}

/// Low-cardinality label for a failure.
pub fn failure_label(error: &WorkerError) -> &'static str {
    match error {
        WorkerError::Cancelled => "cancelled",
        WorkerError::BackendFailed { .. } => "backend_failed",
        WorkerError::MissingArtifact(_) => "missing_artifact",
        WorkerError::Submit(_) => "submit",
        WorkerError::Payload(_) => "payload",
        WorkerError::Queue(_) => "queue",
        _ => "other",
    }
}
