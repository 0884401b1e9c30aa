//! In-process job store.
//!
//! Used by tests and single-process tools that don't have a broker.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};

use renderq_models::{BackendHandle, JobId, JobProgress, JobRecord, JobState, QueueEvent, RenderJob};

use crate::error::{QueueError, QueueResult};
use crate::store::JobStore;

const EVENT_BUFFER: usize = 256;

/// Job records kept in memory, with a broadcast feed of queue events.
pub struct MemoryJobStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
    history: Mutex<Vec<QueueEvent>>,
    events: broadcast::Sender<QueueEvent>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            records: RwLock::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Receive events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Every event published so far, oldest first.
    pub async fn published(&self) -> Vec<QueueEvent> {
        self.history.lock().await.clone()
    }

    async fn announce(&self, event: QueueEvent) {
        self.history.lock().await.push(event.clone());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn update<F>(&self, job_id: &JobId, f: F) -> QueueResult<()>
    where
        F: FnOnce(&mut JobRecord) + Send,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(job_id)
            .ok_or_else(|| QueueError::job_not_found(job_id))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &RenderJob) -> QueueResult<()> {
        self.records
            .write()
            .await
            .insert(job.job_id.clone(), JobRecord::new(job.clone()));
        Ok(())
    }

    async fn fetch(&self, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.records.read().await.get(job_id).cloned())
    }

    async fn mark_active(&self, job_id: &JobId, owner: &str) -> QueueResult<()> {
        let owner = owner.to_string();
        self.update(job_id, move |r| {
            r.state = JobState::Processing;
            r.owner = Some(owner);
            r.heartbeat_at = Some(Utc::now());
        })
        .await
    }

    async fn heartbeat(&self, job_id: &JobId, owner: &str) -> QueueResult<()> {
        let owner = owner.to_string();
        self.update(job_id, move |r| {
            r.owner = Some(owner);
            r.heartbeat_at = Some(Utc::now());
        })
        .await
    }

    async fn set_backend_handle(&self, job_id: &JobId, handle: &BackendHandle) -> QueueResult<()> {
        let handle = handle.clone();
        self.update(job_id, move |r| r.backend_handle = Some(handle)).await
    }

    async fn update_progress(&self, progress: &JobProgress) -> QueueResult<()> {
        let stored = progress.clone();
        self.update(&progress.job_id, move |r| r.progress = Some(stored))
            .await?;
        self.announce(QueueEvent::Progress {
            job_id: progress.job_id.clone(),
            progress: progress.clone(),
        })
        .await;
        Ok(())
    }

    async fn complete(&self, job_id: &JobId, return_value: &Value) -> QueueResult<()> {
        let stored = return_value.clone();
        self.update(job_id, move |r| {
            r.state = JobState::Completed;
            r.return_value = Some(stored);
        })
        .await?;
        self.announce(QueueEvent::Completed {
            job_id: job_id.clone(),
            return_value: return_value.clone(),
        })
        .await;
        Ok(())
    }

    async fn fail(&self, job_id: &JobId, reason: &str, cancelled: bool) -> QueueResult<()> {
        let stored = reason.to_string();
        self.update(job_id, move |r| {
            r.state = JobState::Failed;
            r.failed_reason = Some(stored);
        })
        .await?;
        self.announce(QueueEvent::Failed {
            job_id: job_id.clone(),
            reason: reason.to_string(),
            cancelled,
        })
        .await;
        Ok(())
    }

    async fn request_cancel(&self, job_id: &JobId) -> QueueResult<bool> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(job_id)
            .ok_or_else(|| QueueError::job_not_found(job_id))?;
        if record.state.is_terminal() {
            return Ok(false);
        }
        record.cancelled_by_user = true;
        Ok(true)
    }
}
