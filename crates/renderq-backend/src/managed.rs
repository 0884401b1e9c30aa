//! Serverless-platform managed endpoint.
//!
//! The platform is reached through an [`InferenceClient`], which returns the
//! platform's native JSON. [`ManagedEndpoint`] turns that into handles and
//! snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use renderq_models::{BackendHandle, BackendKind, StatusSnapshot};

use crate::adapter::{snapshot_from_native, EndpointAdapter};
use crate::config::EndpointConfig;
use crate::error::{BackendError, BackendResult};

/// Raw access to a managed inference endpoint.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Submit input; returns the native submission document (must carry `id`).
    async fn run(&self, input: Value) -> BackendResult<Value>;

    /// Native status document for a job.
    async fn status(&self, job_id: &str) -> BackendResult<Value>;

    async fn cancel(&self, job_id: &str) -> BackendResult<()>;
}

/// [`InferenceClient`] over the platform's REST API
/// (`{base}/{endpoint_id}/run|status/{id}|cancel/{id}`).
pub struct HttpInferenceClient {
    http: Client,
    endpoint_url: String,
    api_key: String,
}

impl HttpInferenceClient {
    pub fn new(config: &EndpointConfig) -> BackendResult<Self> {
        let endpoint_id = config
            .endpoint_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BackendError::config("managed endpoint needs an endpoint id"))?;
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(BackendError::Network)?;

        Ok(Self {
            http,
            endpoint_url: format!("{}/{}", config.base_url.trim_end_matches('/'), endpoint_id),
            api_key: config.api_key.clone(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> BackendResult<Value> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn run(&self, input: Value) -> BackendResult<Value> {
        let url = format!("{}/run", self.endpoint_url);
        self.send(self.http.post(url).json(&json!({ "input": input })))
            .await
    }

    async fn status(&self, job_id: &str) -> BackendResult<Value> {
        let url = format!("{}/status/{}", self.endpoint_url, job_id);
        self.send(self.http.get(url)).await
    }

    async fn cancel(&self, job_id: &str) -> BackendResult<()> {
        let url = format!("{}/cancel/{}", self.endpoint_url, job_id);
        self.send(self.http.post(url)).await.map(|_| ())
    }
}

/// Endpoint driven through an [`InferenceClient`].
pub struct ManagedEndpoint {
    client: Arc<dyn InferenceClient>,
}

impl ManagedEndpoint {
    pub fn new(client: Arc<dyn InferenceClient>) -> Self {
        Self { client }
    }

    /// Managed endpoint over the platform's REST API.
    pub fn from_config(config: &EndpointConfig) -> BackendResult<Self> {
        Ok(Self::new(Arc::new(HttpInferenceClient::new(config)?)))
    }
}

#[async_trait]
impl EndpointAdapter for ManagedEndpoint {
    fn kind(&self) -> BackendKind {
        BackendKind::Managed
    }

    async fn run(&self, input: Value) -> BackendResult<BackendHandle> {
        let submitted = self.client.run(input).await?;
        let id = submitted
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::invalid_response(format!("run response has no id: {}", submitted)))?;

        info!(backend_job_id = %id, "Submitted job to managed endpoint");
        Ok(BackendHandle::new(id, BackendKind::Managed))
    }

    async fn status(&self, handle: &BackendHandle) -> BackendResult<StatusSnapshot> {
        let native = self.client.status(&handle.id).await?;
        debug!(backend_job_id = %handle.id, "Managed status: {}", native);
        Ok(snapshot_from_native(&native, handle))
    }

    async fn cancel(&self, handle: &BackendHandle) -> BackendResult<()> {
        self.client.cancel(&handle.id).await?;
        info!(backend_job_id = %handle.id, "Cancelled job on managed endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderq_models::BackendStatus;
    use tokio::sync::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Replays canned status documents.
    struct CannedClient {
        statuses: Mutex<Vec<Value>>,
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InferenceClient for CannedClient {
        async fn run(&self, _input: Value) -> BackendResult<Value> {
            Ok(json!({"id": "m-1", "status": "IN_QUEUE"}))
        }

        async fn status(&self, _job_id: &str) -> BackendResult<Value> {
            let mut statuses = self.statuses.lock().await;
            if statuses.is_empty() {
                return Err(BackendError::invalid_response("script exhausted"));
            }
            Ok(statuses.remove(0))
        }

        async fn cancel(&self, job_id: &str) -> BackendResult<()> {
            self.cancelled.lock().await.push(job_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_structured_progress_is_flattened() {
        let client = Arc::new(CannedClient {
            statuses: Mutex::new(vec![
                json!({
                    "status": "IN_PROGRESS",
                    "progress": {"progress": 0.5, "preview_frame": "frame-b64", "render_time_ms": 2000},
                }),
                json!({
                    "status": "COMPLETED",
                    "output": {"video": "https://pod/out.mp4"},
                    "progress": {"progress": 1.0, "render_time_ms": 9000},
                }),
            ]),
            cancelled: Mutex::new(Vec::new()),
        });
        let endpoint = ManagedEndpoint::new(client.clone());

        let handle = endpoint.run(json!({"prompt": "fish"})).await.unwrap();
        assert_eq!(handle.kind, BackendKind::Managed);

        let running = endpoint.status(&handle).await.unwrap();
        assert_eq!(running.status, BackendStatus::InProgress);
        assert_eq!(running.progress, Some(0.5));
        assert_eq!(running.preview, Some(json!("frame-b64")));
        assert_eq!(running.render_duration, Some(2.0));

        let done = endpoint.status(&handle).await.unwrap();
        assert!(done.completed);
        assert_eq!(done.render_duration, Some(9.0));

        endpoint.cancel(&handle).await.unwrap();
        assert_eq!(*client.cancelled.lock().await, vec!["m-1".to_string()]);
    }

    #[tokio::test]
    async fn test_http_client_paths() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ep-1/run"))
            .and(header("authorization", "Bearer k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "r-9"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ep-1/status/r-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "FAILED", "error": "CUDA OOM"})))
            .mount(&server)
            .await;

        let config = EndpointConfig {
            base_url: server.uri(),
            endpoint_id: Some("ep-1".to_string()),
            api_key: "k".to_string(),
            ..EndpointConfig::default()
        };
        let endpoint = ManagedEndpoint::from_config(&config).unwrap();

        let handle = endpoint.run(json!({})).await.unwrap();
        let snapshot = endpoint.status(&handle).await.unwrap();
        assert!(snapshot.is_failed());
        assert_eq!(snapshot.error.as_deref(), Some("CUDA OOM"));
    }

    #[tokio::test]
    async fn test_run_without_id_is_invalid() {
        struct NoId;

        #[async_trait]
        impl InferenceClient for NoId {
            async fn run(&self, _input: Value) -> BackendResult<Value> {
                Ok(json!({"status": "IN_QUEUE"}))
            }
            async fn status(&self, _job_id: &str) -> BackendResult<Value> {
                Ok(Value::Null)
            }
            async fn cancel(&self, _job_id: &str) -> BackendResult<()> {
                Ok(())
            }
        }

        let err = ManagedEndpoint::new(Arc::new(NoId)).run(json!({})).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }
}
