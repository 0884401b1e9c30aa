//! Worker configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum jobs polled concurrently by this process
    pub concurrency: usize,
    /// Delay between status polls of one job
    pub poll_interval: Duration,
    /// How long a queue read blocks waiting for new jobs
    pub consume_block: Duration,
    /// How often the worker should scan for orphaned pending jobs
    pub claim_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Interval for refreshing job ownership while processing (prevents premature reclamation)
    pub job_heartbeat_interval: Duration,
    /// How long a job's owner may go without a heartbeat before others may resume it
    pub job_lease_ttl: Duration,
    /// Prometheus listener address, if metrics should be exported
    pub metrics_addr: Option<SocketAddr>,
    /// Base URL of the external record service to notify about failures
    pub notify_url: Option<String>,
    /// Bearer token for the external record service
    pub notify_api_key: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_millis(2000),
            consume_block: Duration::from_secs(1),
            claim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            job_heartbeat_interval: Duration::from_secs(30),
            job_lease_ttl: Duration::from_secs(120),
            metrics_addr: None,
            notify_url: None,
            notify_api_key: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(10),
            poll_interval: Duration::from_millis(
                std::env::var("WORKER_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2000),
            ),
            consume_block: Duration::from_millis(
                std::env::var("WORKER_CONSUME_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            claim_interval: Duration::from_secs(
                std::env::var("WORKER_CLAIM_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            job_heartbeat_interval: Duration::from_secs(
                std::env::var("WORKER_JOB_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n: &u64| *n > 0)
                    .unwrap_or(30),
            ),
            job_lease_ttl: Duration::from_secs(
                std::env::var("WORKER_JOB_LEASE_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
            metrics_addr: std::env::var("METRICS_ADDR")
                .ok()
                .and_then(|s| s.parse().ok()),
            notify_url: std::env::var("NOTIFY_URL").ok().filter(|s| !s.is_empty()),
            notify_api_key: std::env::var("NOTIFY_API_KEY").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Artifact download settings for the CLI.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Timeout of a single download attempt
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First backoff delay; doubles per retry
    pub base_delay: Duration,
    /// Redirects followed per attempt
    pub max_redirects: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_redirects: 10,
        }
    }
}

impl DownloadConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            timeout: Duration::from_secs(
                std::env::var("DOWNLOAD_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            max_retries: std::env::var("DOWNLOAD_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            base_delay: Duration::from_millis(
                std::env::var("DOWNLOAD_BASE_DELAY_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            max_redirects: 10,
        }
    }
}
