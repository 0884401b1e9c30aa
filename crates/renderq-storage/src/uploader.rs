//! Artifact re-hosting.
//!
//! Copies a transient backend artifact into owned object storage and hands
//! back a presigned URL. The source is spooled to a temporary file chunk by
//! chunk, so large videos never sit fully in memory.

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use renderq_models::{ArtifactKind, JobId};

use crate::error::{StorageError, StorageResult};
use crate::store::ObjectStore;

/// Re-hosting configuration.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Key prefix for video artifacts
    pub video_dir: String,
    /// Key prefix for image artifacts
    pub image_dir: String,
    /// Lifetime of presigned URLs
    pub url_expiry: Duration,
    /// Timeout for fetching the source artifact
    pub fetch_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            video_dir: "videos".to_string(),
            image_dir: "images".to_string(),
            url_expiry: Duration::from_secs(86400), // 24 hours
            fetch_timeout: Duration::from_secs(600),
        }
    }
}

impl UploadConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            video_dir: std::env::var("ARTIFACT_VIDEO_DIR").unwrap_or_else(|_| "videos".to_string()),
            image_dir: std::env::var("ARTIFACT_IMAGE_DIR").unwrap_or_else(|_| "images".to_string()),
            url_expiry: Duration::from_secs(
                std::env::var("ARTIFACT_URL_EXPIRY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(86400),
            ),
            fetch_timeout: Duration::from_secs(
                std::env::var("ARTIFACT_FETCH_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
        }
    }

    pub fn directory(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Video => &self.video_dir,
            ArtifactKind::Image => &self.image_dir,
        }
    }
}

/// Per-upload overrides.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Content type that beats anything inferred
    pub content_type: Option<String>,
    /// Explicit object name inside the kind's directory
    pub filename: Option<String>,
}

/// A successfully re-hosted artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedArtifact {
    pub key: String,
    pub url: String,
    pub content_type: String,
    pub size: u64,
}

/// Outcome of a best-effort re-host.
#[derive(Debug, Clone, PartialEq)]
pub struct RehostOutcome {
    /// URL to hand to consumers
    pub url: String,
    /// False when the original URL was kept because re-hosting failed
    pub rehosted: bool,
}

/// Streams remote artifacts into object storage.
pub struct ArtifactUploader {
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    config: UploadConfig,
}

impl ArtifactUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> StorageResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;
        Ok(Self { store, http, config })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Fetch `source_url` and store it under a key derived from the job.
    pub async fn upload_from_url(
        &self,
        source_url: &str,
        kind: ArtifactKind,
        job_id: &JobId,
        options: &UploadOptions,
    ) -> StorageResult<UploadedArtifact> {
        debug!(job_id = %job_id, "Fetching artifact from {}", source_url);

        let mut response = self
            .http
            .get(source_url)
            .send()
            .await
            .map_err(|e| StorageError::fetch_failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::fetch_failed(format!(
                "{} returned HTTP {}",
                source_url, status
            )));
        }

        let header = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = resolve_content_type(
            options.content_type.as_deref(),
            header.as_deref(),
            source_url,
            kind,
        );

        let key = match options.filename.as_deref() {
            Some(name) => named_key(self.config.directory(kind), name)?,
            None => object_key(
                self.config.directory(kind),
                job_id,
                extension_for(&content_type, kind),
                Utc::now(),
            ),
        };

        // Spool to disk so the upload knows its length without buffering
        let spool = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(spool.reopen()?);
        let mut size = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| StorageError::fetch_failed(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        let body = ByteStream::from_path(spool.path())
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;
        self.store
            .put_object(&key, body, &content_type, Some(size))
            .await?;

        let url = self.store.presign_get(&key, self.config.url_expiry).await?;

        info!(job_id = %job_id, key = %key, size, "Re-hosted {} artifact", kind);
        Ok(UploadedArtifact {
            key,
            url,
            content_type,
            size,
        })
    }

    /// Re-host `source_url`, keeping the original URL if anything fails.
    pub async fn rehost_or_fallback(
        &self,
        source_url: &str,
        kind: ArtifactKind,
        job_id: &JobId,
        options: &UploadOptions,
    ) -> RehostOutcome {
        match self.upload_from_url(source_url, kind, job_id, options).await {
            Ok(uploaded) => RehostOutcome {
                url: uploaded.url,
                rehosted: true,
            },
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    "Re-hosting failed, keeping backend URL: {}", e
                );
                RehostOutcome {
                    url: source_url.to_string(),
                    rehosted: false,
                }
            }
        }
    }
}

/// Object key `{directory}/{job_id}-{timestamp_millis}{ext}`.
pub fn object_key(directory: &str, job_id: &JobId, ext: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}-{}{}",
        directory.trim_end_matches('/'),
        job_id,
        at.timestamp_millis(),
        ext
    )
}

fn named_key(directory: &str, filename: &str) -> StorageResult<String> {
    let name = filename.trim().trim_start_matches('/');
    if name.is_empty() || name.split('/').any(|part| part == "..") {
        return Err(StorageError::InvalidKey(filename.to_string()));
    }
    Ok(format!("{}/{}", directory.trim_end_matches('/'), name))
}

/// Pick a content type: explicit hint, then a meaningful response header,
/// then the URL's extension, then the kind's default.
pub fn resolve_content_type(
    hint: Option<&str>,
    header: Option<&str>,
    source_url: &str,
    kind: ArtifactKind,
) -> String {
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        return hint.to_string();
    }

    if let Some(header) = header {
        let essence = header.split(';').next().unwrap_or("").trim().to_lowercase();
        if !essence.is_empty() && essence != "application/octet-stream" && essence != "binary/octet-stream" {
            return essence;
        }
    }

    if let Some(ct) = content_type_from_url(source_url) {
        return ct.to_string();
    }

    kind.default_content_type().to_string()
}

fn content_type_from_url(source_url: &str) -> Option<&'static str> {
    let path = url::Url::parse(source_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| source_url.to_string());
    let ext = path.rsplit_once('.')?.1.to_lowercase();
    match ext.as_str() {
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "gif" => Some("image/gif"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// File extension (with dot) for a content type.
pub fn extension_for(content_type: &str, kind: ArtifactKind) -> &'static str {
    match content_type {
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        "image/gif" => ".gif",
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/webp" => ".webp",
        _ => kind.default_extension(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn uploader(store: Arc<MemoryObjectStore>) -> ArtifactUploader {
        ArtifactUploader::new(store, UploadConfig::default()).unwrap()
    }

    #[test]
    fn test_content_type_precedence() {
        let url = "https://backend/out/frame.webp?token=1";
        assert_eq!(
            resolve_content_type(Some("image/png"), Some("image/jpeg"), url, ArtifactKind::Image),
            "image/png"
        );
        assert_eq!(
            resolve_content_type(None, Some("image/jpeg; charset=binary"), url, ArtifactKind::Image),
            "image/jpeg"
        );
        assert_eq!(
            resolve_content_type(None, Some("application/octet-stream"), url, ArtifactKind::Image),
            "image/webp"
        );
        assert_eq!(
            resolve_content_type(None, None, "https://backend/blob", ArtifactKind::Video),
            "video/mp4"
        );
    }

    #[test]
    fn test_object_key_unique_per_timestamp() {
        let job_id = JobId::from_string("job-1");
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(1);

        let a = object_key("videos", &job_id, ".mp4", t0);
        let b = object_key("videos", &job_id, ".mp4", t1);
        assert_ne!(a, b);
        assert_eq!(a, format!("videos/job-1-{}.mp4", t0.timestamp_millis()));
        assert_eq!(object_key("videos/", &job_id, ".mp4", t0), a);
    }

    #[test]
    fn test_named_key_rejects_traversal() {
        assert_eq!(named_key("images", "cover.png").unwrap(), "images/cover.png");
        assert!(named_key("images", "../secrets").is_err());
        assert!(named_key("images", "  ").is_err());
    }

    #[tokio::test]
    async fn test_rehost_round_trip_is_byte_identical() {
        let server = MockServer::start().await;
        let body: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        Mock::given(method("GET"))
            .and(path("/outputs/render"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(body.clone()),
            )
            .mount(&server)
            .await;

        let store = Arc::new(MemoryObjectStore::new());
        let uploader = uploader(store.clone());
        let job_id = JobId::from_string("job-42");

        let uploaded = uploader
            .upload_from_url(
                &format!("{}/outputs/render", server.uri()),
                ArtifactKind::Image,
                &job_id,
                &UploadOptions::default(),
            )
            .await
            .unwrap();

        assert!(uploaded.key.starts_with("images/job-42-"));
        assert!(uploaded.key.ends_with(".png"));
        assert_eq!(uploaded.size, body.len() as u64);

        let stored = store.get_presigned(&uploaded.url).await.unwrap();
        assert_eq!(stored.bytes, body);
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(stored.content_length, Some(body.len() as u64));
    }

    #[tokio::test]
    async fn test_fallback_to_source_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ok.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;
        let job_id = JobId::from_string("job-7");

        let missing = format!("{}/gone.mp4", server.uri());
        let outcome = uploader(Arc::new(MemoryObjectStore::new()))
            .rehost_or_fallback(&missing, ArtifactKind::Video, &job_id, &UploadOptions::default())
            .await;
        assert_eq!(outcome, RehostOutcome { url: missing, rehosted: false });

        let ok = format!("{}/ok.mp4", server.uri());
        let outcome = uploader(Arc::new(MemoryObjectStore::failing()))
            .rehost_or_fallback(&ok, ArtifactKind::Video, &job_id, &UploadOptions::default())
            .await;
        assert_eq!(outcome, RehostOutcome { url: ok, rehosted: false });
    }

    #[tokio::test]
    async fn test_explicit_filename() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 16]))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryObjectStore::new());
        let options = UploadOptions {
            content_type: Some("video/webm".to_string()),
            filename: Some("dream-1.webm".to_string()),
        };
        let uploaded = uploader(store.clone())
            .upload_from_url(&server.uri(), ArtifactKind::Video, &JobId::new(), &options)
            .await
            .unwrap();

        assert_eq!(uploaded.key, "videos/dream-1.webm");
        assert_eq!(store.get("videos/dream-1.webm").await.unwrap().content_type, "video/webm");
    }
}
