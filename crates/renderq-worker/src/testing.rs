//! Test doubles shared by the poller and runner tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use renderq_backend::{BackendError, BackendResult, EndpointAdapter};
use renderq_models::{BackendHandle, BackendKind, JobId, JobProgress, QueueEvent, StatusSnapshot};
use renderq_queue::{JobStore, MemoryJobStore};

/// Flags a job for cancellation after a number of status calls.
struct CancelTrigger {
    after: usize,
    store: Arc<dyn JobStore>,
    job_id: JobId,
}

/// Endpoint that replays a fixed sequence of status results.
pub(crate) struct ScriptedEndpoint {
    kind: BackendKind,
    run_result: Mutex<Option<BackendError>>,
    statuses: Mutex<VecDeque<BackendResult<StatusSnapshot>>>,
    submitted: Mutex<Vec<Value>>,
    status_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    trigger: Option<CancelTrigger>,
}

impl ScriptedEndpoint {
    pub(crate) fn new(statuses: Vec<BackendResult<StatusSnapshot>>) -> Self {
        Self {
            kind: BackendKind::Direct,
            run_result: Mutex::new(None),
            statuses: Mutex::new(statuses.into()),
            submitted: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            trigger: None,
        }
    }

    pub(crate) fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Make `run` fail with `error`.
    pub(crate) fn failing_run(self, error: BackendError) -> Self {
        *self.run_result.lock().unwrap() = Some(error);
        self
    }

    /// Request cancellation of `job_id` once `after` status calls were served.
    pub(crate) fn cancel_after(mut self, after: usize, store: Arc<dyn JobStore>, job_id: JobId) -> Self {
        self.trigger = Some(CancelTrigger { after, store, job_id });
        self
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn submitted(&self) -> Vec<Value> {
        self.submitted.lock().unwrap().clone()
    }
}

pub(crate) fn scripted(statuses: Vec<BackendResult<StatusSnapshot>>) -> Arc<ScriptedEndpoint> {
    Arc::new(ScriptedEndpoint::new(statuses))
}

#[async_trait]
impl EndpointAdapter for ScriptedEndpoint {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn run(&self, input: Value) -> BackendResult<BackendHandle> {
        let failure = self.run_result.lock().unwrap().take();
        if let Some(error) = failure {
            return Err(error);
        }
        self.submitted.lock().unwrap().push(input);
        Ok(BackendHandle::new("scripted-1", self.kind))
    }

    async fn status(&self, _handle: &BackendHandle) -> BackendResult<StatusSnapshot> {
        let served = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let next = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::invalid_response("script exhausted")));

        if let Some(trigger) = &self.trigger {
            if served == trigger.after {
                trigger.store.request_cancel(&trigger.job_id).await.unwrap();
            }
        }
        next
    }

    async fn cancel(&self, _handle: &BackendHandle) -> BackendResult<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Progress updates the store has announced, oldest first.
pub(crate) async fn progress_events(store: &MemoryJobStore) -> Vec<JobProgress> {
    store
        .published()
        .await
        .into_iter()
        .filter_map(|event| match event {
            QueueEvent::Progress { progress, .. } => Some(progress),
            _ => None,
        })
        .collect()
}
