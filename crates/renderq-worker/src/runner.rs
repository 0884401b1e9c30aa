//! Job execution.
//!
//! [`JobProcessor`] takes one job from submission to a terminal outcome.
//! [`WorkerRunner`] feeds it from the queue with a bounded pool of slots.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use renderq_backend::EndpointAdapter;
use renderq_models::{BackendHandle, JobRecord, JobState, NormalizedResult, RenderJob};
use renderq_queue::{JobQueue, JobStore};
use renderq_storage::{ArtifactUploader, UploadOptions};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::normalizer::normalize;
use crate::notify::{FailureNotifier, NoopNotifier};
use crate::payload::PayloadRegistry;
use crate::poller::StatusPoller;

/// Pending entries claimed per scan.
const CLAIM_BATCH: usize = 5;

/// How a job run ended.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(NormalizedResult),
    /// Stopped at the user's request
    Cancelled,
    /// Terminal failure, already recorded on the job
    Failed(WorkerError),
    /// Failed before the backend accepted it; redelivery may succeed.
    /// Nothing has been recorded yet.
    Retry(WorkerError),
    /// Another live worker owns the job; nothing was touched
    Busy(String),
}

/// Runs single jobs against one backend.
pub struct JobProcessor {
    endpoint: Arc<dyn EndpointAdapter>,
    jobs: Arc<dyn JobStore>,
    payloads: PayloadRegistry,
    uploader: Option<Arc<ArtifactUploader>>,
    notifier: Arc<dyn FailureNotifier>,
    poll_interval: Duration,
    owner: String,
    lease_ttl: Duration,
}

impl JobProcessor {
    pub fn new(endpoint: Arc<dyn EndpointAdapter>, jobs: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            endpoint,
            jobs,
            payloads: PayloadRegistry::passthrough(),
            uploader: None,
            notifier: Arc::new(NoopNotifier),
            poll_interval,
            owner: format!("worker-{}", Uuid::new_v4()),
            lease_ttl: Duration::from_secs(120),
        }
    }

    /// Name recorded as the job owner while this processor drives a job.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// How stale another owner's heartbeat must be before its job is resumed here.
    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extend this processor's lease on `job`.
    pub async fn heartbeat(&self, job: &RenderJob) {
        if let Err(e) = self.jobs.heartbeat(&job.job_id, &self.owner).await {
            warn!(job_id = %job.job_id, "Failed to record heartbeat: {}", e);
        }
    }

    pub fn with_payloads(mut self, payloads: PayloadRegistry) -> Self {
        self.payloads = payloads;
        self
    }

    /// Re-host transient artifacts through `uploader`.
    pub fn with_uploader(mut self, uploader: Arc<ArtifactUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run a job and record its outcome.
    ///
    /// Retryable errors are handed back untouched so the caller can decide
    /// between redelivery and [`JobProcessor::report_failure`].
    pub async fn run_job(&self, job: &RenderJob) -> JobOutcome {
        metrics::record_job_started(&job.algorithm);
        let span = JobLogger::new(&job.job_id, &job.queue, &job.algorithm).create_span();

        match self.execute(job).instrument(span).await {
            Ok(result) => {
                metrics::record_job_completed(&job.algorithm, result.kind.as_str());
                if let Some(seconds) = result.render_duration {
                    metrics::record_render_duration(&job.algorithm, seconds);
                }
                JobOutcome::Completed(result)
            }
            Err(WorkerError::LeaseHeld(owner)) => {
                info!(job_id = %job.job_id, "Job is running on {}, leaving it alone", owner);
                JobOutcome::Busy(owner)
            }
            Err(e) if e.is_retryable() => JobOutcome::Retry(e),
            Err(e) => {
                self.report_failure(job, &e).await;
                if e.is_cancellation() {
                    JobOutcome::Cancelled
                } else {
                    JobOutcome::Failed(e)
                }
            }
        }
    }

    /// Submit (or resume), poll, normalize, re-host, complete.
    pub async fn execute(&self, job: &RenderJob) -> WorkerResult<NormalizedResult> {
        let logger = JobLogger::new(&job.job_id, &job.queue, &job.algorithm);

        let record = match self.jobs.fetch(&job.job_id).await? {
            Some(record) => record,
            None => {
                // Produced without a record; adopt it
                self.jobs.insert(job).await?;
                JobRecord::new(job.clone())
            }
        };

        if record.state == JobState::Completed {
            if let Some(result) = record.artifact() {
                logger.log_completion("already completed, skipping");
                return Ok(result);
            }
        }
        if let Some(holder) = record.lease_holder(Utc::now(), self.lease_ttl) {
            if holder != self.owner {
                return Err(WorkerError::LeaseHeld(holder.to_string()));
            }
        }
        if record.cancelled_by_user {
            return Err(WorkerError::Cancelled);
        }

        self.jobs.mark_active(&job.job_id, &self.owner).await?;

        let handle = match record.backend_handle {
            Some(handle) => self.resume(handle, &logger)?,
            None => self.submit(job, &logger).await?,
        };

        let poller = StatusPoller::new(self.endpoint.clone(), self.jobs.clone(), self.poll_interval);
        let snapshot = poller.poll(job, &handle).await?;

        let mut result = normalize(&snapshot)?;
        if result.requires_reupload {
            self.rehost(job, &mut result).await;
        }

        let return_value = serde_json::to_value(&result)?;
        self.jobs.complete(&job.job_id, &return_value).await?;

        logger.log_completion(&format!("{} at {}", result.kind, result.durable_url()));
        Ok(result)
    }

    async fn submit(&self, job: &RenderJob, logger: &JobLogger) -> WorkerResult<BackendHandle> {
        let input = self.payloads.build(job)?;
        let handle = self.endpoint.run(input).await.map_err(WorkerError::Submit)?;

        logger.log_start(&format!("submitted as {} ({})", handle.id, handle.kind));
        if let Err(e) = self.jobs.set_backend_handle(&job.job_id, &handle).await {
            logger.log_warning(&format!("failed to persist backend handle: {}", e));
        }
        Ok(handle)
    }

    fn resume(&self, handle: BackendHandle, logger: &JobLogger) -> WorkerResult<BackendHandle> {
        if handle.kind != self.endpoint.kind() {
            return Err(WorkerError::config(format!(
                "job was submitted to a {} backend but this worker drives {}",
                handle.kind,
                self.endpoint.kind()
            )));
        }
        logger.log_start(&format!("resuming backend job {}", handle.id));
        Ok(handle)
    }

    async fn rehost(&self, job: &RenderJob, result: &mut NormalizedResult) {
        let Some(uploader) = &self.uploader else {
            debug!(job_id = %job.job_id, "No object storage configured, keeping backend URL");
            return;
        };

        let outcome = uploader
            .rehost_or_fallback(&result.source_url, result.kind, &job.job_id, &UploadOptions::default())
            .await;
        if outcome.rehosted {
            result.requires_reupload = false;
        } else {
            metrics::record_upload_fallback(result.kind.as_str());
        }
        result.r2_url = Some(outcome.url);
    }

    /// Record a terminal failure on the job.
    ///
    /// Cancellations are informational. Everything else is logged with its
    /// diagnostics and reported to the job's external record, if it has one.
    pub async fn report_failure(&self, job: &RenderJob, error: &WorkerError) {
        let logger = JobLogger::new(&job.job_id, &job.queue, &job.algorithm);

        if !error.should_alert() {
            logger.log_progress("cancelled by user");
            if let Err(e) = self.jobs.fail(&job.job_id, &error.to_string(), true).await {
                logger.log_warning(&format!("failed to record cancellation: {}", e));
            }
            metrics::record_job_cancelled(&job.algorithm);
            return;
        }

        match error.snapshot() {
            Some(snapshot) => logger.log_error(&format!(
                "{} (snapshot: {})",
                error,
                serde_json::to_string(snapshot).unwrap_or_default()
            )),
            None => logger.log_error(&error.to_string()),
        }

        let reason = error.to_string();
        if let Err(e) = self.jobs.fail(&job.job_id, &reason, false).await {
            logger.log_warning(&format!("failed to record failure: {}", e));
        }

        if let Some(external_id) = &job.external_id {
            if let Err(e) = self.notifier.notify_failure(external_id, &reason).await {
                logger.log_warning(&format!("failed to notify external record {}: {}", external_id, e));
            }
        }

        metrics::record_job_failed(&job.algorithm, metrics::failure_label(error));
    }
}

/// Stream entries this worker is currently running.
#[derive(Default)]
struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    fn ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if the entry is already running here.
    fn begin(&self, message_id: &str) -> bool {
        self.ids().insert(message_id.to_string())
    }

    fn finish(&self, message_id: &str) {
        self.ids().remove(message_id);
    }

    fn snapshot(&self) -> HashSet<String> {
        self.ids().clone()
    }
}

/// Everything a spawned job task needs.
#[derive(Clone)]
struct Dispatch {
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    in_flight: Arc<InFlight>,
    heartbeat_interval: Duration,
}

impl Dispatch {
    /// Run one delivered job and settle its stream entry.
    async fn handle(self, message_id: String, job: RenderJob) {
        if !self.in_flight.begin(&message_id) {
            debug!(job_id = %job.job_id, "Entry {} is already running here", message_id);
            return;
        }

        let outcome = self.run_with_heartbeat(&message_id, &job).await;
        self.settle(&message_id, &job, outcome).await;
        self.in_flight.finish(&message_id);
    }

    /// Keep the stream entry and the job lease fresh for as long as the job runs.
    async fn run_with_heartbeat(&self, message_id: &str, job: &RenderJob) -> JobOutcome {
        let run = self.processor.run_job(job);
        tokio::pin!(run);

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; run_job starts the lease itself
        ticker.tick().await;

        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = ticker.tick() => self.heartbeat(message_id, job).await,
            }
        }
    }

    async fn heartbeat(&self, message_id: &str, job: &RenderJob) {
        match self.queue.touch(self.processor.owner(), message_id).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %job.job_id, "Entry {} is no longer pending", message_id),
            Err(e) => warn!(job_id = %job.job_id, "Failed to refresh stream entry: {}", e),
        }
        self.processor.heartbeat(job).await;
    }

    async fn settle(&self, message_id: &str, job: &RenderJob, outcome: JobOutcome) {
        let job_id = &job.job_id;

        match outcome {
            JobOutcome::Completed(_) | JobOutcome::Cancelled => {
                if let Err(e) = self.queue.ack(message_id).await {
                    error!(job_id = %job_id, "Failed to ack job: {}", e);
                }
                if let Err(e) = self.queue.clear_dedup(job).await {
                    warn!(job_id = %job_id, "Failed to clear dedup key: {}", e);
                }
            }
            JobOutcome::Failed(e) => {
                self.dead_letter(message_id, job, &e).await;
            }
            JobOutcome::Retry(e) => {
                let attempts = self.queue.increment_retry(message_id).await.unwrap_or(u32::MAX);
                let max_retries = self.queue.max_retries();
                if attempts >= max_retries {
                    warn!(job_id = %job_id, "Giving up after {} attempts: {}", attempts, e);
                    self.processor.report_failure(job, &e).await;
                    self.dead_letter(message_id, job, &e).await;
                } else {
                    // Left pending; the claim scan redelivers it once idle
                    info!(
                        job_id = %job_id,
                        "Job will be retried (attempt {}/{}): {}",
                        attempts, max_retries, e
                    );
                }
            }
            JobOutcome::Busy(owner) => {
                // The owner's heartbeat takes the entry back
                debug!(job_id = %job_id, "Leaving entry {} to {}", message_id, owner);
            }
        }
    }

    async fn dead_letter(&self, message_id: &str, job: &RenderJob, error: &WorkerError) {
        if let Err(e) = self.queue.dlq(message_id, job, &error.to_string()).await {
            error!(job_id = %job.job_id, "Failed to move job to DLQ: {}", e);
        }
        if let Err(e) = self.queue.clear_dedup(job).await {
            warn!(job_id = %job.job_id, "Failed to clear dedup key: {}", e);
        }
    }
}

/// Consumes the queue and runs jobs on a bounded pool.
pub struct WorkerRunner {
    config: WorkerConfig,
    dispatch: Dispatch,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl WorkerRunner {
    /// The processor takes the runner's consumer name as its owner name.
    pub fn new(config: WorkerConfig, queue: JobQueue, processor: JobProcessor) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.concurrency));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        let processor = processor
            .with_owner(consumer_name.clone())
            .with_lease_ttl(config.job_lease_ttl);
        let dispatch = Dispatch {
            queue: Arc::new(queue),
            processor: Arc::new(processor),
            in_flight: Arc::new(InFlight::default()),
            heartbeat_interval: config.job_heartbeat_interval,
        };

        Self {
            config,
            dispatch,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`WorkerRunner::shutdown`] is called.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting worker '{}' on queue '{}' with {} slots",
            self.consumer_name,
            self.dispatch.queue.config().queue_name,
            self.config.concurrency
        );

        self.dispatch.queue.init().await?;

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = self.spawn_claim_task();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping consumption");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "{} jobs still running after {:?}; they will be reclaimed",
                self.in_flight(),
                self.config.shutdown_timeout
            );
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn in_flight(&self) -> usize {
        self.config.concurrency - self.job_semaphore.available_permits()
    }

    /// Periodically take over entries left pending by dead consumers.
    fn spawn_claim_task(&self) -> tokio::task::JoinHandle<()> {
        let dispatch = self.dispatch.clone();
        let semaphore = Arc::clone(&self.job_semaphore);
        let consumer_name = self.consumer_name.clone();
        let claim_interval = self.config.claim_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let running = dispatch.in_flight.snapshot();
                        match dispatch.queue.claim_pending(&consumer_name, CLAIM_BATCH, &running).await {
                            Ok(jobs) if !jobs.is_empty() => {
                                info!("Claimed {} pending jobs", jobs.len());
                                for (message_id, job) in jobs {
                                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                                        break;
                                    };
                                    let dispatch = dispatch.clone();
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        dispatch.handle(message_id, job).await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim pending jobs: {}", e),
                        }
                    }
                }
            }
        })
    }

    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self
            .dispatch
            .queue
            .consume(
                &self.consumer_name,
                self.config.consume_block.as_millis() as u64,
                available,
            )
            .await?;

        if jobs.is_empty() {
            return Ok(());
        }
        debug!("Consumed {} jobs from queue", jobs.len());

        for (message_id, job) in jobs {
            let permit = Arc::clone(&self.job_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::config("job pool closed"))?;
            let dispatch = self.dispatch.clone();

            tokio::spawn(async move {
                let _permit = permit;
                dispatch.handle(message_id, job).await;
            });
        }

        Ok(())
    }

    async fn wait_for_jobs(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
