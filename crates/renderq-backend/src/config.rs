//! Endpoint configuration.

use std::time::Duration;

use renderq_models::BackendKind;

use crate::error::{BackendError, BackendResult};

/// Default API root of the managed serverless platform.
pub const DEFAULT_MANAGED_BASE_URL: &str = "https://api.runpod.ai/v2";

/// Configuration for an endpoint adapter.
#[derive(Clone)]
pub struct EndpointConfig {
    /// Which variant to build
    pub kind: BackendKind,
    /// API root. For direct endpoints this is the endpoint's own base URL.
    pub base_url: String,
    /// Endpoint id on the managed platform
    pub endpoint_id: Option<String>,
    /// Bearer token
    pub api_key: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("endpoint_id", &self.endpoint_id)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Managed,
            base_url: DEFAULT_MANAGED_BASE_URL.to_string(),
            endpoint_id: None,
            api_key: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl EndpointConfig {
    /// Create config from environment variables.
    pub fn from_env() -> BackendResult<Self> {
        let kind = match std::env::var("BACKEND_KIND") {
            Ok(raw) => raw.parse::<BackendKind>().map_err(BackendError::config)?,
            Err(_) => BackendKind::Managed,
        };

        let base_url = match (kind, std::env::var("BACKEND_URL")) {
            (_, Ok(url)) => url,
            (BackendKind::Managed, Err(_)) => DEFAULT_MANAGED_BASE_URL.to_string(),
            (BackendKind::Direct, Err(_)) => {
                return Err(BackendError::config("BACKEND_URL not set"));
            }
        };

        let config = Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoint_id: std::env::var("BACKEND_ENDPOINT_ID").ok(),
            api_key: std::env::var("BACKEND_API_KEY")
                .map_err(|_| BackendError::config("BACKEND_API_KEY not set"))?,
            timeout: Duration::from_secs(
                std::env::var("BACKEND_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BackendResult<()> {
        if self.kind == BackendKind::Managed && self.endpoint_id.as_deref().unwrap_or("").is_empty() {
            return Err(BackendError::config(
                "BACKEND_ENDPOINT_ID is required for managed endpoints",
            ));
        }
        if self.base_url.is_empty() {
            return Err(BackendError::config("backend base URL is empty"));
        }
        Ok(())
    }
}
