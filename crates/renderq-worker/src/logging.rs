//! Structured job logging utilities.
//!
//! Provides tracing initialisation for the binaries and a per-job logger
//! with consistent contextual fields.

use tracing::{error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use renderq_models::JobId;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter`. JSON output when `LOG_FORMAT=json`.
/// Logs go to stderr; stdout carries the CLI's machine-readable output.
pub fn init_tracing(default_filter: &str) {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    queue: String,
    algorithm: String,
}

impl JobLogger {
    /// Create a new job logger.
    ///
    /// # Arguments
    /// * `job_id` - The unique identifier for the job
    /// * `queue` - Queue the job came from
    /// * `algorithm` - Workflow name (e.g., "animatediff", "hunyuan")
    pub fn new(job_id: &JobId, queue: &str, algorithm: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            queue: queue.to_string(),
            algorithm: algorithm.to_string(),
        }
    }

    /// Log the start of a job.
    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            algorithm = %self.algorithm,
            "Job started: {}", message
        );
    }

    /// Log a progress update during job execution.
    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            "Job progress: {}", message
        );
    }

    /// Log a warning during job execution.
    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            queue = %self.queue,
            "Job warning: {}", message
        );
    }

    /// Log an error during job execution.
    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            queue = %self.queue,
            algorithm = %self.algorithm,
            "Job error: {}", message
        );
    }

    /// Log the completion of a job.
    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            queue = %self.queue,
            algorithm = %self.algorithm
        )
    }
}
