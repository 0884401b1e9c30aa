//! Worker error types.

use thiserror::Error;

use renderq_backend::BackendError;
use renderq_models::StatusSnapshot;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The user asked for the job to stop.
    #[error("Cancelled by user")]
    Cancelled,

    /// The backend reported a terminal failure.
    #[error("Backend job failed: {}", failure_reason(.snapshot))]
    BackendFailed { snapshot: Box<StatusSnapshot> },

    /// The backend claims success but produced nothing usable.
    #[error("No artifact in backend output: {0}")]
    MissingArtifact(String),

    /// The job never started on the backend.
    #[error("Submitting job failed: {0}")]
    Submit(#[source] BackendError),

    #[error("Invalid job payload: {0}")]
    Payload(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Failure notification failed: {0}")]
    Notify(String),

    /// Another live worker owns the job.
    #[error("Job is held by worker {0}")]
    LeaseHeld(String),

    /// Terminal failure observed from outside the worker.
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Event stream closed before job {0} finished")]
    StreamClosed(String),

    /// Result lookup on a job that has not settled.
    #[error("Job {job_id} is still {state}")]
    Unsettled { job_id: String, state: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Queue error: {0}")]
    Queue(#[from] renderq_queue::QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] renderq_storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn failure_reason(snapshot: &StatusSnapshot) -> String {
    snapshot
        .error
        .clone()
        .or_else(|| snapshot.output.as_ref().and_then(|o| o.message.clone()))
        .unwrap_or_else(|| format!("status {}", snapshot.status))
}

impl WorkerError {
    pub fn backend_failed(snapshot: StatusSnapshot) -> Self {
        Self::BackendFailed {
            snapshot: Box::new(snapshot),
        }
    }

    pub fn missing_artifact(msg: impl Into<String>) -> Self {
        Self::MissingArtifact(msg.into())
    }

    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn notify(msg: impl Into<String>) -> Self {
        Self::Notify(msg.into())
    }

    /// User-initiated stop, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }

    /// Whether this outcome should be surfaced as a failure (logs at error,
    /// external record notified, DLQ).
    pub fn should_alert(&self) -> bool {
        !self.is_cancellation()
    }

    /// Failures where redelivering the job could succeed.
    ///
    /// Only errors before the backend accepted the job qualify; once a render
    /// runs, retrying would start a second one.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Submit(e) => e.is_retryable(),
            WorkerError::Queue(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Snapshot carried by a backend failure, for diagnostics.
    pub fn snapshot(&self) -> Option<&StatusSnapshot> {
        match self {
            WorkerError::BackendFailed { snapshot } => Some(&**snapshot),
            _ => None,
        }
    }
}
