//! External record failure notification.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};

/// Tells an external system that the job behind one of its records failed.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify_failure(&self, external_id: &str, reason: &str) -> WorkerResult<()>;
}

/// Notifier for deployments without an external record service.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl FailureNotifier for NoopNotifier {
    async fn notify_failure(&self, external_id: &str, _reason: &str) -> WorkerResult<()> {
        debug!(external_id, "No failure notifier configured");
        Ok(())
    }
}

/// `POST {base}/records/{external_id}/failure` with `{"error": reason}`.
pub struct HttpFailureNotifier {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpFailureNotifier {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> WorkerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WorkerError::config(format!("notifier HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl FailureNotifier for HttpFailureNotifier {
    async fn notify_failure(&self, external_id: &str, reason: &str) -> WorkerResult<()> {
        let url = format!("{}/records/{}/failure", self.base_url, external_id);
        let mut request = self.http.post(&url).json(&json!({ "error": reason }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WorkerError::notify(format!("{}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::notify(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        debug!(external_id, "Reported failure to external record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_reason_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/records/dream-7/failure"))
            .and(header("authorization", "Bearer notify-key"))
            .and(body_json(json!({"error": "Backend job failed: CUDA OOM"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = HttpFailureNotifier::new(format!("{}/", server.uri()), Some("notify-key".to_string())).unwrap();
        tokio_test::assert_ok!(
            notifier
                .notify_failure("dream-7", "Backend job failed: CUDA OOM")
                .await
        );
    }

    #[tokio::test]
    async fn test_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such record"))
            .mount(&server)
            .await;

        let notifier = HttpFailureNotifier::new(server.uri(), None).unwrap();
        let err = tokio_test::assert_err!(notifier.notify_failure("missing", "boom").await);
        assert!(err.to_string().contains("no such record"));
    }
}
