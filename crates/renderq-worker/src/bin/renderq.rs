//! Command-line client: submit a job, wait for the render and download the
//! artifact. Also queues jobs without waiting, looks up finished results and
//! requests cancellation.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use renderq_models::{JobId, RenderJob};
use renderq_queue::{JobQueue, JobStore, QueueConfig, RedisJobStore};
use renderq_worker::cli::{
    lookup_result, parse_job, receipt, resolve_output_path, wait_for_completion, ArtifactDownloader,
};
use renderq_worker::{init_tracing, DownloadConfig};

#[derive(Debug, Parser)]
#[command(name = "renderq", version, about = "Submit a render job and download its artifact")]
struct Args {
    /// Job description (JSON object with an `algorithm` field); `-` or absent reads stdin
    #[arg(value_name = "JOB_FILE")]
    job_file: Option<PathBuf>,

    /// Where to write the artifact
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Queue to submit to (defaults to RENDER_QUEUE, then "render")
    #[arg(long, value_name = "NAME")]
    queue: Option<String>,

    /// Queue the job, print `{"jobId": ...}` and exit
    #[arg(long, conflicts_with = "output")]
    no_wait: bool,

    /// Print the result of a finished job
    #[arg(long, value_name = "JOB_ID", conflicts_with_all = ["job_file", "no_wait", "cancel"])]
    result: Option<String>,

    /// Ask the worker running JOB_ID to stop it
    #[arg(long, value_name = "JOB_ID", conflicts_with_all = ["job_file", "no_wait"])]
    cancel: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    init_tracing("renderq=info,renderq_worker=info");

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = QueueConfig::from_env();
    if let Some(queue) = args.queue {
        config = config.with_queue(queue);
    }
    let store = RedisJobStore::open(config.clone()).context("connecting to Redis")?;

    if let Some(job_id) = args.cancel {
        let job_id = JobId::from_string(job_id);
        if !store.request_cancel(&job_id).await? {
            bail!("job {} has already finished", job_id);
        }
        info!(job_id = %job_id, "Cancellation requested");
        return Ok(());
    }

    if let Some(job_id) = args.result {
        let result = lookup_result(&store, &JobId::from_string(job_id)).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let job = read_job(args.job_file.as_deref(), &config.queue_name, args.output.as_deref()).await?;

    let queue = JobQueue::new(config)?;
    queue.init().await?;

    if args.no_wait {
        store.insert(&job).await?;
        queue.enqueue(&job).await?;
        info!(job_id = %job.job_id, algorithm = %job.algorithm, "Queued job");
        println!("{}", receipt(&job.job_id));
        return Ok(());
    }

    // Subscribe first so the completion event cannot slip past
    let events = store.events().subscribe().await?;
    store.insert(&job).await?;
    queue.enqueue(&job).await?;
    info!(job_id = %job.job_id, algorithm = %job.algorithm, "Submitted job, waiting for the render");

    let result = wait_for_completion(events, &store, &job.job_id).await?;

    let cwd = std::env::current_dir()?;
    let dest = resolve_output_path(&job, result.kind, &cwd, Utc::now());
    let downloader = ArtifactDownloader::new(DownloadConfig::from_env())?;
    downloader.download(result.durable_url(), &dest).await?;

    println!("{}", dest.display());
    Ok(())
}

/// Read the job document from `path`, or from stdin when it is absent or `-`.
async fn read_job(path: Option<&Path>, queue: &str, output: Option<&Path>) -> anyhow::Result<RenderJob> {
    match path.filter(|p| *p != Path::new("-")) {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            parse_job(&raw, queue, Some(path), output).with_context(|| format!("parsing {}", path.display()))
        }
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("reading job from stdin")?;
            parse_job(&raw, queue, None, output).context("parsing job from stdin")
        }
    }
}
