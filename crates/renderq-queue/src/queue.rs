//! Job queue using Redis Streams.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use redis::AsyncCommands;
use tracing::{debug, info, warn};

use renderq_models::{JobId, RenderJob};

use crate::error::{QueueError, QueueResult};

/// How long an enqueued job's idempotency key blocks duplicates.
pub const DEDUP_TTL_SECS: u64 = 3600;

/// How long retry counters live.
pub const RETRY_COUNTER_TTL_SECS: i64 = 86400;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Logical queue name; every key is namespaced by it
    pub queue_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Max delivery attempts for retryable failures before DLQ
    pub max_retries: u32,
    /// Minimum idle time before a pending entry can be claimed (crash recovery)
    pub claim_min_idle: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "render".to_string(),
            consumer_group: "renderq:workers".to_string(),
            max_retries: 3,
            claim_min_idle: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            queue_name: std::env::var("RENDER_QUEUE").unwrap_or_else(|_| "render".to_string()),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or_else(|_| "renderq:workers".to_string()),
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            claim_min_idle: Duration::from_secs(
                std::env::var("QUEUE_CLAIM_MIN_IDLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }

    /// Same settings, different queue.
    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn stream_key(&self) -> String {
        format!("renderq:{}:stream", self.queue_name)
    }

    pub fn dlq_key(&self) -> String {
        format!("renderq:{}:dlq", self.queue_name)
    }

    pub fn events_channel(&self) -> String {
        format!("renderq:{}:events", self.queue_name)
    }

    pub fn job_key(&self, job_id: &JobId) -> String {
        format!("renderq:{}:job:{}", self.queue_name, job_id)
    }

    fn dedup_key(&self, idempotency_key: &str) -> String {
        format!("renderq:dedup:{}", idempotency_key)
    }

    fn retry_key(&self, message_id: &str) -> String {
        format!("renderq:{}:retry:{}", self.queue_name, message_id)
    }
}

/// Job queue client.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Underlying client, shared with the job store and event channel.
    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.config.stream_key())
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Enqueue a render job. Returns the stream message ID.
    pub async fn enqueue(&self, job: &RenderJob) -> QueueResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let payload = serde_json::to_string(job)?;
        let idempotency_key = job.idempotency_key();

        // SET NX doubles as the duplicate check
        let dedup_key = self.config.dedup_key(&idempotency_key);
        let fresh: bool = redis::cmd("SET")
            .arg(&dedup_key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        if !fresh {
            warn!("Duplicate job rejected: {}", idempotency_key);
            return Err(QueueError::enqueue_failed("Duplicate job"));
        }

        let message_id: String = redis::cmd("XADD")
            .arg(self.config.stream_key())
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("key")
            .arg(&idempotency_key)
            .query_async(&mut conn)
            .await?;

        info!(
            job_id = %job.job_id,
            queue = %self.config.queue_name,
            "Enqueued job with message ID {}",
            message_id
        );

        Ok(message_id)
    }

    /// Release a job's idempotency key.
    pub async fn clear_dedup(&self, job: &RenderJob) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(self.config.dedup_key(&job.idempotency_key())).await?;
        Ok(())
    }

    /// Acknowledge a job (mark as handled).
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        redis::cmd("XACK")
            .arg(self.config.stream_key())
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        // Delete the message from the stream
        redis::cmd("XDEL")
            .arg(self.config.stream_key())
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        // Retry counter is no longer needed
        conn.del::<_, ()>(self.config.retry_key(message_id)).await?;

        debug!("Acknowledged job: {}", message_id);
        Ok(())
    }

    /// Move a job to the dead letter queue.
    pub async fn dlq(&self, message_id: &str, job: &RenderJob, error: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let payload = serde_json::to_string(job)?;

        redis::cmd("XADD")
            .arg(self.config.dlq_key())
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        // Ack the original message
        self.ack(message_id).await?;

        warn!(job_id = %job.job_id, "Moved job to DLQ: {}", error);
        Ok(())
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(self.config.stream_key()).await?;
        Ok(len)
    }

    /// Get DLQ length.
    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(self.config.dlq_key()).await?;
        Ok(len)
    }

    /// Consume new jobs from the queue as (message_id, job) pairs.
    pub async fn consume(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, RenderJob)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Option<redis::streams::StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(self.config.stream_key())
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::new();
        let Some(result) = result else {
            return Ok(jobs);
        };

        for stream_key in result.keys {
            for entry in stream_key.ids {
                if let Some(job) = self.decode_entry(&entry.id, &entry.map).await {
                    debug!(job_id = %job.job_id, "Consumed job from stream");
                    jobs.push((entry.id, job));
                }
            }
        }

        Ok(jobs)
    }

    /// Claim pending jobs that have been idle for too long.
    /// This handles jobs from crashed workers.
    ///
    /// Entries in `in_flight` are still being worked on by the caller and are
    /// left alone.
    pub async fn claim_pending(
        &self,
        consumer_name: &str,
        count: usize,
        in_flight: &HashSet<String>,
    ) -> QueueResult<Vec<(String, RenderJob)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(self.config.stream_key())
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(self.config.claim_min_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let stale: Vec<&str> = pending
            .ids
            .iter()
            .map(|entry| entry.id.as_str())
            .filter(|id| !in_flight.contains(*id))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(self.config.stream_key())
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(self.config.claim_min_idle.as_millis() as u64);
        for id in stale {
            claim.arg(id);
        }
        let result: redis::streams::StreamClaimReply = claim.query_async(&mut conn).await?;

        let mut jobs = Vec::new();
        for entry in result.ids {
            if let Some(job) = self.decode_entry(&entry.id, &entry.map).await {
                info!(job_id = %job.job_id, "Claimed pending job from stream");
                jobs.push((entry.id, job));
            }
        }

        Ok(jobs)
    }

    /// Refresh a pending entry's ownership so claim scans leave it alone.
    ///
    /// Resets the entry's idle time. Returns `false` once the entry is no
    /// longer pending.
    pub async fn touch(&self, consumer_name: &str, message_id: &str) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(self.config.stream_key())
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(0)
            .arg(message_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        Ok(!claimed.is_empty())
    }

    /// Parse a stream entry, acking malformed messages so they are not redelivered.
    async fn decode_entry(
        &self,
        message_id: &str,
        fields: &HashMap<String, redis::Value>,
    ) -> Option<RenderJob> {
        let payload = match fields.get("job") {
            Some(redis::Value::BulkString(payload)) => String::from_utf8_lossy(payload).into_owned(),
            Some(redis::Value::SimpleString(payload)) => payload.clone(),
            _ => {
                warn!("Stream entry {} has no job payload", message_id);
                self.ack(message_id).await.ok();
                return None;
            }
        };

        match serde_json::from_str::<RenderJob>(&payload) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("Failed to parse job payload {}: {}", message_id, e);
                self.ack(message_id).await.ok();
                None
            }
        }
    }

    /// Increment the delivery attempt counter for a message.
    pub async fn increment_retry(&self, message_id: &str) -> QueueResult<u32> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let key = self.config.retry_key(message_id);
        let count: u32 = conn.incr(&key, 1).await?;
        conn.expire::<_, ()>(&key, RETRY_COUNTER_TTL_SECS).await?;
        Ok(count)
    }

    /// Get max retries from config.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}
