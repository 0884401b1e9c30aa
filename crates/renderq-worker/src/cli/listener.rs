//! Waits for a submitted job to finish.
//!
//! Completion is observed through queue events rather than the worker, so a
//! CLI can wait on jobs it did not run itself.

use futures_util::{Stream, StreamExt};
use tracing::{debug, info};

use renderq_models::{JobId, JobRecord, JobState, NormalizedResult, QueueEvent};
use renderq_queue::{JobStore, QueueError};

use crate::error::{WorkerError, WorkerResult};

/// Artifact of a completed job, or its failure.
fn settled(job_id: &JobId, record: &JobRecord) -> Option<WorkerResult<NormalizedResult>> {
    match record.state {
        JobState::Completed => Some(
            record
                .artifact()
                .ok_or_else(|| WorkerError::missing_artifact(format!("job {} has no durable URL", job_id))),
        ),
        JobState::Failed => Some(Err(failure(
            record.failed_reason.clone().unwrap_or_default(),
            record.cancelled_by_user,
        ))),
        JobState::Pending | JobState::Processing => None,
    }
}

fn failure(reason: String, cancelled: bool) -> WorkerError {
    if cancelled {
        WorkerError::Cancelled
    } else {
        WorkerError::JobFailed(reason)
    }
}

/// Wait for `job_id` to complete or fail.
///
/// `events` must have been subscribed before the job was enqueued. The stored
/// record is checked once first, which covers a job that settled before this
/// call.
pub async fn wait_for_completion<S>(
    mut events: S,
    jobs: &dyn JobStore,
    job_id: &JobId,
) -> WorkerResult<NormalizedResult>
where
    S: Stream<Item = QueueEvent> + Unpin,
{
    if let Some(record) = jobs.fetch(job_id).await? {
        if let Some(outcome) = settled(job_id, &record) {
            debug!(job_id = %job_id, "Job had already settled");
            return outcome;
        }
    }

    while let Some(event) = events.next().await {
        if event.job_id() != job_id {
            continue;
        }
        match event {
            QueueEvent::Progress { progress, .. } => {
                info!(job_id = %job_id, "Progress: {}", progress.snapshot.summary());
            }
            QueueEvent::Completed { return_value, .. } => {
                return NormalizedResult::from_return_value(&return_value).ok_or_else(|| {
                    WorkerError::missing_artifact(format!("unusable return value: {}", return_value))
                });
            }
            QueueEvent::Failed { reason, cancelled, .. } => return Err(failure(reason, cancelled)),
        }
    }

    Err(WorkerError::StreamClosed(job_id.to_string()))
}

/// Read the artifact of a job that has already settled, without waiting.
pub async fn lookup_result(jobs: &dyn JobStore, job_id: &JobId) -> WorkerResult<NormalizedResult> {
    let record = jobs.fetch(job_id).await?.ok_or_else(|| QueueError::job_not_found(job_id))?;
    settled(job_id, &record).unwrap_or_else(|| {
        Err(WorkerError::Unsettled {
            job_id: job_id.to_string(),
            state: record.state.to_string(),
        })
    })
}
