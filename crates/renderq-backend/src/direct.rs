//! Directly addressed HTTP endpoint (bearer-token REST).

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use renderq_models::{BackendHandle, BackendKind, StatusSnapshot};

use crate::adapter::{snapshot_from_native, EndpointAdapter};
use crate::config::EndpointConfig;
use crate::error::{BackendError, BackendResult};

#[derive(Debug, Deserialize)]
struct RunResponse {
    id: String,
}

/// Endpoint addressed at `{base}/run`, `{base}/status/{id}` and `{base}/cancel/{id}`.
pub struct DirectEndpoint {
    http: Client,
    base_url: String,
    api_key: String,
}

impl DirectEndpoint {
    pub fn new(config: &EndpointConfig) -> BackendResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(BackendError::Network)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

/// Turn non-2xx responses into [`BackendError::Http`] and decode the rest.
async fn read_json<T: DeserializeOwned>(response: Response) -> BackendResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Http {
            status: status.as_u16(),
            body,
        });
    }
    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}

#[async_trait]
impl EndpointAdapter for DirectEndpoint {
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    async fn run(&self, input: Value) -> BackendResult<BackendHandle> {
        let url = format!("{}/run", self.base_url);
        debug!("Submitting job to {}", url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "input": input }))
            .send()
            .await?;
        let run: RunResponse = read_json(response).await?;

        info!(backend_job_id = %run.id, "Submitted job to direct endpoint");
        Ok(BackendHandle::new(run.id, BackendKind::Direct))
    }

    async fn status(&self, handle: &BackendHandle) -> BackendResult<StatusSnapshot> {
        let url = format!("{}/status/{}", self.base_url, handle.id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let native: Value = read_json(response).await?;

        Ok(snapshot_from_native(&native, handle))
    }

    async fn cancel(&self, handle: &BackendHandle) -> BackendResult<()> {
        let url = format!("{}/cancel/{}", self.base_url, handle.id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let _: Value = read_json(response).await.or_else(|e| match e {
            // Some endpoints ack with an empty body
            BackendError::Json(_) => Ok(Value::Null),
            other => Err(other),
        })?;

        info!(backend_job_id = %handle.id, "Cancelled job on direct endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderq_models::BackendStatus;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(server: &MockServer) -> DirectEndpoint {
        DirectEndpoint::new(&EndpointConfig {
            kind: BackendKind::Direct,
            base_url: server.uri(),
            api_key: "test-key".to_string(),
            ..EndpointConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_posts_input_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_json(json!({"input": {"prompt": "fish"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "job-abc", "status": "IN_QUEUE"})))
            .expect(1)
            .mount(&server)
            .await;

        let handle = endpoint(&server).run(json!({"prompt": "fish"})).await.unwrap();
        assert_eq!(handle.id, "job-abc");
        assert_eq!(handle.kind, BackendKind::Direct);
    }

    #[tokio::test]
    async fn test_status_maps_native_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "COMPLETED",
                "output": {"video_url": "https://x/y.mp4"},
                "executionTime": 12500,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status/job-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "IN_QUEUE",
            })))
            .mount(&server)
            .await;

        let endpoint = endpoint(&server);
        let done = endpoint
            .status(&BackendHandle::new("job-1", BackendKind::Direct))
            .await
            .unwrap();
        assert_eq!(done.status, BackendStatus::Completed);
        assert!(done.completed);
        assert_eq!(done.render_duration, Some(12.5));

        let queued = endpoint
            .status(&BackendHandle::new("job-2", BackendKind::Direct))
            .await
            .unwrap();
        assert_eq!(queued.status, BackendStatus::Queued);
        assert!(!queued.completed);
    }

    #[tokio::test]
    async fn test_non_2xx_is_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/job-1"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let err = endpoint(&server)
            .status(&BackendHandle::new("job-1", BackendKind::Direct))
            .await
            .unwrap_err();
        match err {
            BackendError::Http { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid api key");
            }
            other => panic!("expected Http error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_accepts_empty_ack() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cancel/job-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        endpoint(&server)
            .cancel(&BackendHandle::new("job-1", BackendKind::Direct))
            .await
            .unwrap();
    }
}
