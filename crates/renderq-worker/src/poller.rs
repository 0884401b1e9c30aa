//! Status polling.
//!
//! One loop per job: re-read the job record for a cancellation request, ask
//! the backend for a snapshot, publish anything new, sleep, repeat. There is
//! no overall deadline; renders legitimately take many minutes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use renderq_backend::EndpointAdapter;
use renderq_models::{BackendHandle, JobProgress, RenderJob, StatusSnapshot};
use renderq_queue::JobStore;

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::FailureTracker;

/// Consecutive status failures logged before going quiet.
const MAX_LOGGED_STATUS_FAILURES: u32 = 3;

/// Polls one backend job to a terminal state.
pub struct StatusPoller {
    endpoint: Arc<dyn EndpointAdapter>,
    jobs: Arc<dyn JobStore>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(endpoint: Arc<dyn EndpointAdapter>, jobs: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self {
            endpoint,
            jobs,
            interval,
        }
    }

    /// Poll until the backend completes the job.
    ///
    /// Returns the final snapshot. Errors with [`WorkerError::Cancelled`] when
    /// the job record asks for cancellation and with
    /// [`WorkerError::BackendFailed`] when the backend reports failure. A
    /// failed status call is not an error; the next tick simply tries again.
    pub async fn poll(&self, job: &RenderJob, handle: &BackendHandle) -> WorkerResult<StatusSnapshot> {
        let backend = self.endpoint.kind();
        let mut failures = FailureTracker::new(MAX_LOGGED_STATUS_FAILURES);
        let mut last: Option<StatusSnapshot> = None;

        loop {
            metrics::record_poll_tick(backend.as_str());

            if self.cancel_requested(job).await {
                info!(
                    job_id = %job.job_id,
                    backend_job_id = %handle.id,
                    "Cancellation requested, stopping backend job"
                );
                if let Err(e) = self.endpoint.cancel(handle).await {
                    warn!(
                        job_id = %job.job_id,
                        backend_job_id = %handle.id,
                        "Backend cancel failed: {}", e
                    );
                }
                return Err(WorkerError::Cancelled);
            }

            match self.endpoint.status(handle).await {
                Ok(snapshot) => {
                    failures.record_success();

                    if snapshot.is_failed() {
                        return Err(WorkerError::backend_failed(snapshot));
                    }

                    let changed = last
                        .as_ref()
                        .map_or(true, |previous| !previous.same_observation(&snapshot));
                    if changed {
                        info!(
                            job_id = %job.job_id,
                            backend_job_id = %handle.id,
                            "Status: {}", snapshot.summary()
                        );
                        let progress = JobProgress::new(job, Some(handle), snapshot.clone());
                        if let Err(e) = self.jobs.update_progress(&progress).await {
                            warn!(job_id = %job.job_id, "Failed to publish progress: {}", e);
                        }
                    }

                    if snapshot.completed {
                        return Ok(snapshot);
                    }
                    last = Some(snapshot);
                }
                Err(e) => {
                    metrics::record_status_error(backend.as_str());
                    if failures.record_failure() {
                        warn!(
                            job_id = %job.job_id,
                            backend_job_id = %handle.id,
                            "Status check failed: {}", e
                        );
                    }
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Re-read the persisted record; the job the poll started with may be stale.
    async fn cancel_requested(&self, job: &RenderJob) -> bool {
        match self.jobs.fetch(&job.job_id).await {
            Ok(Some(record)) => record.cancelled_by_user,
            Ok(None) => {
                debug!(job_id = %job.job_id, "Job record missing during poll");
                false
            }
            Err(e) => {
                warn!(job_id = %job.job_id, "Failed to read job record: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use crate::testing::{progress_events, scripted, ScriptedEndpoint};
    use renderq_backend::BackendError;
    use renderq_models::{ArtifactKind, BackendKind, BackendStatus, RawOutput};
    use renderq_queue::MemoryJobStore;
    use serde_json::{json, Map};

    fn poller(endpoint: &Arc<ScriptedEndpoint>, store: &Arc<MemoryJobStore>) -> StatusPoller {
        StatusPoller::new(endpoint.clone(), store.clone(), Duration::from_millis(1))
    }

    async fn stored_job(store: &MemoryJobStore) -> RenderJob {
        let mut input = Map::new();
        input.insert("prompt".to_string(), json!("fish"));
        let job = RenderJob::new("video", "animatediff", input);
        store.insert(&job).await.unwrap();
        job
    }

    fn in_progress(progress: f64) -> StatusSnapshot {
        StatusSnapshot::new(BackendStatus::InProgress).with_progress(Some(progress))
    }

    fn completed_video() -> StatusSnapshot {
        StatusSnapshot::new(BackendStatus::Completed)
            .with_output(RawOutput::from_value(&json!({"video_url": "https://x/y.mp4"})))
    }

    #[tokio::test]
    async fn test_repeated_progress_is_published_once() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store).await;
        let endpoint = scripted(vec![
            Ok(in_progress(0.4)),
            Ok(in_progress(0.4)),
            Ok(completed_video()),
        ]);
        let handle = BackendHandle::new("b-1", BackendKind::Direct);

        let snapshot = poller(&endpoint, &store).poll(&job, &handle).await.unwrap();
        assert!(snapshot.completed);

        let progress = progress_events(&store).await;
        assert_eq!(progress.len(), 2, "one for 0.4, one for completion");
        assert_eq!(progress[0].snapshot.progress, Some(0.4));
        assert_eq!(progress[0].backend_job_id.as_deref(), Some("b-1"));

        let result = normalize(&snapshot).unwrap();
        assert_eq!(result.kind, ArtifactKind::Video);
        assert_eq!(result.source_url, "https://x/y.mp4");
        assert!(result.requires_reupload);
    }

    #[tokio::test]
    async fn test_failed_status_carries_snapshot() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store).await;
        let endpoint = scripted(vec![
            Ok(in_progress(0.1)),
            Ok(StatusSnapshot::new(BackendStatus::Failed).with_error(Some("CUDA OOM".to_string()))),
        ]);
        let handle = BackendHandle::new("b-2", BackendKind::Managed);

        let err = poller(&endpoint, &store).poll(&job, &handle).await.unwrap_err();
        let snapshot = err.snapshot().expect("backend failure keeps its snapshot");
        assert_eq!(snapshot.error.as_deref(), Some("CUDA OOM"));
        assert_eq!(endpoint.cancel_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_backend_once() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store).await;
        let endpoint = Arc::new(
            ScriptedEndpoint::new(vec![
                Ok(in_progress(0.2)),
                Ok(in_progress(0.3)),
                Ok(completed_video()),
            ])
            .cancel_after(2, store.clone(), job.job_id.clone()),
        );
        let handle = BackendHandle::new("b-3", BackendKind::Direct);

        let err = poller(&endpoint, &store).poll(&job, &handle).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(err.snapshot().is_none());
        assert_eq!(endpoint.cancel_calls(), 1);
        assert_eq!(endpoint.status_calls(), 2);
    }

    #[tokio::test]
    async fn test_transport_errors_keep_polling() {
        let store = Arc::new(MemoryJobStore::new());
        let job = stored_job(&store).await;
        let endpoint = scripted(vec![
            Ok(in_progress(0.5)),
            Err(BackendError::invalid_response("connection reset")),
            Err(BackendError::Http {
                status: 502,
                body: "bad gateway".to_string(),
            }),
            Ok(completed_video()),
        ]);
        let handle = BackendHandle::new("b-4", BackendKind::Direct);

        let snapshot = poller(&endpoint, &store).poll(&job, &handle).await.unwrap();
        assert!(snapshot.completed);
        assert_eq!(endpoint.status_calls(), 4);
    }

    #[tokio::test]
    async fn test_missing_record_does_not_stop_polling() {
        let store = Arc::new(MemoryJobStore::new());
        let job = RenderJob::new("video", "hunyuan", Map::new());
        let endpoint = scripted(vec![Ok(completed_video())]);
        let handle = BackendHandle::new("b-5", BackendKind::Direct);

        let snapshot = poller(&endpoint, &store).poll(&job, &handle).await.unwrap();
        assert!(snapshot.completed);
    }
}
