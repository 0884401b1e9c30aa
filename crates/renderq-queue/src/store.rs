//! Persisted job records.
//!
//! The record is the single point of serialization between the worker that
//! owns a job and everyone else: progress, the backend handle, the
//! cancellation flag and the terminal outcome all live on it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde_json::{json, Value};
use tracing::{debug, warn};

use renderq_models::{
    BackendHandle, JobId, JobProgress, JobRecord, JobState, QueueEvent, RenderJob,
};

use crate::error::{QueueError, QueueResult};
use crate::events::EventChannel;
use crate::queue::QueueConfig;

/// How long terminal job records are kept (7 days).
pub const JOB_RECORD_TTL_SECS: i64 = 7 * 24 * 3600;

/// Hash field names of a job record.
pub mod fields {
    pub const DATA: &str = "data";
    pub const STATE: &str = "state";
    pub const PROGRESS: &str = "progress";
    pub const RETURN_VALUE: &str = "returnvalue";
    pub const FAILED_REASON: &str = "failedReason";
    pub const CANCELLED_BY_USER: &str = "cancelled_by_user";
    pub const BACKEND_HANDLE: &str = "backend_handle";
    pub const OWNER: &str = "owner";
    pub const HEARTBEAT_AT: &str = "heartbeat_at";
}

/// Read/write access to job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create the record for a freshly submitted job.
    async fn insert(&self, job: &RenderJob) -> QueueResult<()>;

    /// Load the current record. `None` when the job is unknown or expired.
    async fn fetch(&self, job_id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// `owner` picked the job up. Starts its lease.
    async fn mark_active(&self, job_id: &JobId, owner: &str) -> QueueResult<()>;

    /// `owner` is still working on the job. Extends its lease.
    async fn heartbeat(&self, job_id: &JobId, owner: &str) -> QueueResult<()>;

    /// Remember the remote handle so observation can resume after a restart.
    async fn set_backend_handle(&self, job_id: &JobId, handle: &BackendHandle) -> QueueResult<()>;

    /// Publish a progress snapshot to observers.
    async fn update_progress(&self, progress: &JobProgress) -> QueueResult<()>;

    /// Terminal success.
    async fn complete(&self, job_id: &JobId, return_value: &Value) -> QueueResult<()>;

    /// Terminal failure. `cancelled` marks a user-initiated stop.
    async fn fail(&self, job_id: &JobId, reason: &str, cancelled: bool) -> QueueResult<()>;

    /// Ask the owning worker to stop the job.
    ///
    /// Returns `false` when the job has already reached a terminal state.
    async fn request_cancel(&self, job_id: &JobId) -> QueueResult<bool>;
}

/// Parse a stored return value.
///
/// A JSON object is used as-is; anything else (including a bare, unquoted
/// URL) is treated as the durable artifact URL.
pub fn parse_return_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(Value::String(url)) => json!({ "r2_url": url }),
        _ => json!({ "r2_url": raw }),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Build a record from its hash fields. `None` for an empty hash.
pub fn parse_record(mut hash: HashMap<String, String>) -> QueueResult<Option<JobRecord>> {
    let Some(data) = hash.remove(fields::DATA) else {
        if hash.is_empty() {
            return Ok(None);
        }
        return Err(QueueError::invalid_record("job record has no data field"));
    };

    let job: RenderJob = serde_json::from_str(&data)?;
    let mut record = JobRecord::new(job);

    if let Some(state) = hash.remove(fields::STATE) {
        record.state = state
            .parse::<JobState>()
            .map_err(|e| QueueError::invalid_record(e.to_string()))?;
    }
    if let Some(progress) = hash.remove(fields::PROGRESS) {
        // Progress is advisory; a malformed entry must not hide the record
        match serde_json::from_str(&progress) {
            Ok(progress) => record.progress = Some(progress),
            Err(e) => warn!(job_id = %record.job.job_id, "Ignoring unreadable progress: {}", e),
        }
    }
    if let Some(raw) = hash.remove(fields::RETURN_VALUE) {
        record.return_value = Some(parse_return_value(&raw));
    }
    record.failed_reason = hash.remove(fields::FAILED_REASON);
    record.cancelled_by_user = hash
        .remove(fields::CANCELLED_BY_USER)
        .map(|raw| parse_flag(&raw))
        .unwrap_or(false);
    if let Some(handle) = hash.remove(fields::BACKEND_HANDLE) {
        record.backend_handle = Some(serde_json::from_str(&handle)?);
    }
    record.owner = hash.remove(fields::OWNER);
    if let Some(raw) = hash.remove(fields::HEARTBEAT_AT) {
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => record.heartbeat_at = Some(at.with_timezone(&Utc)),
            Err(e) => warn!(job_id = %record.job.job_id, "Ignoring unreadable heartbeat: {}", e),
        }
    }

    Ok(Some(record))
}

/// Job records stored as Redis hashes, with state changes announced on the
/// queue's event channel.
pub struct RedisJobStore {
    client: redis::Client,
    config: QueueConfig,
    events: EventChannel,
}

impl RedisJobStore {
    pub fn new(client: redis::Client, config: QueueConfig) -> Self {
        let events = EventChannel::new(client.clone(), &config);
        Self { client, config, events }
    }

    /// Create from a URL and config.
    pub fn open(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self::new(client, config))
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    async fn ensure_exists(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: &JobId,
    ) -> QueueResult<String> {
        let key = self.config.job_key(job_id);
        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Err(QueueError::job_not_found(job_id));
        }
        Ok(key)
    }

    /// Event delivery is best-effort; the record is the source of truth.
    async fn announce(&self, event: QueueEvent) {
        if let Err(e) = self.events.publish(&event).await {
            warn!(job_id = %event.job_id(), "Failed to publish queue event: {}", e);
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: &RenderJob) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.config.job_key(&job.job_id);
        let data = serde_json::to_string(job)?;

        redis::pipe()
            .atomic()
            .hset(&key, fields::DATA, data)
            .ignore()
            .hset(&key, fields::STATE, JobState::Pending.as_str())
            .ignore()
            .hset(&key, fields::CANCELLED_BY_USER, "0")
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(job_id = %job.job_id, "Stored job record");
        Ok(())
    }

    async fn fetch(&self, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let hash: HashMap<String, String> = conn.hgetall(self.config.job_key(job_id)).await?;
        parse_record(hash)
    }

    async fn mark_active(&self, job_id: &JobId, owner: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.ensure_exists(&mut conn, job_id).await?;

        redis::pipe()
            .atomic()
            .hset(&key, fields::STATE, JobState::Processing.as_str())
            .ignore()
            .hset(&key, fields::OWNER, owner)
            .ignore()
            .hset(&key, fields::HEARTBEAT_AT, Utc::now().to_rfc3339())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, job_id: &JobId, owner: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.ensure_exists(&mut conn, job_id).await?;

        redis::pipe()
            .atomic()
            .hset(&key, fields::OWNER, owner)
            .ignore()
            .hset(&key, fields::HEARTBEAT_AT, Utc::now().to_rfc3339())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_backend_handle(&self, job_id: &JobId, handle: &BackendHandle) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.ensure_exists(&mut conn, job_id).await?;
        let handle = serde_json::to_string(handle)?;
        conn.hset::<_, _, _, ()>(&key, fields::BACKEND_HANDLE, handle).await?;
        Ok(())
    }

    async fn update_progress(&self, progress: &JobProgress) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.ensure_exists(&mut conn, &progress.job_id).await?;
        let payload = serde_json::to_string(progress)?;
        conn.hset::<_, _, _, ()>(&key, fields::PROGRESS, payload).await?;

        self.announce(QueueEvent::Progress {
            job_id: progress.job_id.clone(),
            progress: progress.clone(),
        })
        .await;
        Ok(())
    }

    async fn complete(&self, job_id: &JobId, return_value: &Value) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.ensure_exists(&mut conn, job_id).await?;
        let payload = serde_json::to_string(return_value)?;

        redis::pipe()
            .atomic()
            .hset(&key, fields::STATE, JobState::Completed.as_str())
            .ignore()
            .hset(&key, fields::RETURN_VALUE, payload)
            .ignore()
            .expire(&key, JOB_RECORD_TTL_SECS)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        self.announce(QueueEvent::Completed {
            job_id: job_id.clone(),
            return_value: return_value.clone(),
        })
        .await;
        Ok(())
    }

    async fn fail(&self, job_id: &JobId, reason: &str, cancelled: bool) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.ensure_exists(&mut conn, job_id).await?;

        redis::pipe()
            .atomic()
            .hset(&key, fields::STATE, JobState::Failed.as_str())
            .ignore()
            .hset(&key, fields::FAILED_REASON, reason)
            .ignore()
            .expire(&key, JOB_RECORD_TTL_SECS)
            .ignore()
            .query_async::<()>(&mut conn)
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
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.ensure_exists(&mut conn, job_id).await?;

        let state: Option<String> = conn.hget(&key, fields::STATE).await?;
        let terminal = state
            .and_then(|s| s.parse::<JobState>().ok())
            .map(|s| s.is_terminal())
            .unwrap_or(false);
        if terminal {
            return Ok(false);
        }

        conn.hset::<_, _, _, ()>(&key, fields::CANCELLED_BY_USER, "1").await?;
        debug!(job_id = %job_id, "Cancellation requested");
        Ok(true)
    }
}
