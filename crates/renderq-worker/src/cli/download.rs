//! Artifact download with retries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::redirect::Policy;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::DownloadConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::retry::{retry_async_if, RetryConfig, RetryResult};

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Status(u16),
    Transport(reqwest::Error),
    Io(std::io::Error),
}

impl AttemptError {
    /// Client errors won't change on retry, except timeouts and throttling.
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Status(status) => matches!(*status, 408 | 429) || *status >= 500,
            AttemptError::Transport(_) => true,
            AttemptError::Io(_) => false,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Status(status) => write!(f, "HTTP {}", status),
            AttemptError::Transport(e) => write!(f, "{}", e),
            AttemptError::Io(e) => write!(f, "writing file: {}", e),
        }
    }
}

/// Downloads finished artifacts to local files.
pub struct ArtifactDownloader {
    http: reqwest::Client,
    config: DownloadConfig,
}

impl ArtifactDownloader {
    pub fn new(config: DownloadConfig) -> WorkerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| WorkerError::config(format!("download HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Fetch `url` into `dest`, returning the number of bytes written.
    ///
    /// The body is written to a `.part` sibling and renamed on success, so
    /// `dest` never holds a truncated file.
    pub async fn download(&self, url: &str, dest: &Path) -> WorkerResult<u64> {
        if let Some(dir) = dest.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let partial = partial_path(dest);

        let retry = RetryConfig::new("artifact_download")
            .with_max_retries(self.config.max_retries)
            .with_base_delay(self.config.base_delay)
            .with_max_delay(Duration::from_secs(60));

        let size = match retry_async_if(&retry, || self.attempt(url, &partial), AttemptError::is_retryable)
            .await
        {
            RetryResult::Success(size) => size,
            RetryResult::Failed { error, attempts } => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(WorkerError::download(format!(
                    "{} failed after {} attempts: {}",
                    url, attempts, error
                )));
            }
        };

        tokio::fs::rename(&partial, dest).await?;
        info!(path = %dest.display(), bytes = size, "Downloaded artifact");
        Ok(size)
    }

    async fn attempt(&self, url: &str, path: &Path) -> Result<u64, AttemptError> {
        debug!("Downloading {}", url);
        let mut response = self.http.get(url).send().await.map_err(AttemptError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Status(status.as_u16()));
        }

        let mut file = tokio::fs::File::create(path).await.map_err(AttemptError::Io)?;
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(AttemptError::Transport)? {
            file.write_all(&chunk).await.map_err(AttemptError::Io)?;
            size += chunk.len() as u64;
        }
        file.flush().await.map_err(AttemptError::Io)?;
        Ok(size)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
