//! Render worker binary.

use std::sync::Arc;

use tracing::{error, info, warn};

use renderq_backend::{build_endpoint, EndpointConfig};
use renderq_queue::{JobQueue, QueueConfig, RedisJobStore};
use renderq_storage::{ArtifactUploader, R2Client, UploadConfig};
use renderq_worker::{init_tracing, metrics, HttpFailureNotifier, JobProcessor, WorkerConfig, WorkerRunner};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();

    init_tracing("renderq=info,renderq_worker=info,renderq_queue=info,renderq_backend=info,renderq_storage=info");

    info!("Starting renderq-worker");

    let config = WorkerConfig::from_env();
    info!(
        concurrency = config.concurrency,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Worker configured"
    );

    if let Some(addr) = config.metrics_addr {
        if let Err(e) = metrics::install_exporter(addr) {
            error!("Failed to start metrics exporter: {}", e);
            std::process::exit(1);
        }
        info!("Serving metrics on {}", addr);
    }

    let queue_config = QueueConfig::from_env();
    let queue = match JobQueue::new(queue_config.clone()) {
        Ok(q) => q,
        Err(e) => {
            error!("Failed to create job queue: {}", e);
            std::process::exit(1);
        }
    };
    let store = RedisJobStore::new(queue.client().clone(), queue_config);

    let endpoint = match EndpointConfig::from_env().and_then(|c| build_endpoint(&c)) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("Failed to configure backend endpoint: {}", e);
            std::process::exit(1);
        }
    };
    info!("Driving {} backend", endpoint.kind());

    let mut processor = JobProcessor::new(endpoint, Arc::new(store), config.poll_interval)
        .with_lease_ttl(config.job_lease_ttl);

    match R2Client::from_env().await {
        Ok(r2) => {
            if let Err(e) = r2.check_connectivity().await {
                warn!("Object storage check failed, uploads may fall back to backend URLs: {}", e);
            }
            info!("Re-hosting artifacts to bucket {}", r2.bucket());
            match ArtifactUploader::new(Arc::new(r2), UploadConfig::from_env()) {
                Ok(uploader) => processor = processor.with_uploader(Arc::new(uploader)),
                Err(e) => {
                    error!("Failed to create artifact uploader: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Err(e) => warn!("Object storage unavailable, artifacts keep backend URLs: {}", e),
    }

    if let Some(url) = &config.notify_url {
        match HttpFailureNotifier::new(url.clone(), config.notify_api_key.clone()) {
            Ok(notifier) => processor = processor.with_notifier(Arc::new(notifier)),
            Err(e) => {
                error!("Failed to create failure notifier: {}", e);
                std::process::exit(1);
            }
        }
    }

    let runner = Arc::new(WorkerRunner::new(config, queue, processor));

    let signal_runner = Arc::clone(&runner);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_runner.shutdown();
    });

    if let Err(e) = runner.run().await {
        error!("Worker error: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}
