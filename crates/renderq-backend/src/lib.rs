//! Adapters over remote GPU inference backends.
//!
//! Two variants sit behind [`EndpointAdapter`]: an endpoint managed by a
//! serverless platform and a directly addressed HTTP endpoint. The variant is
//! chosen once, when the adapter is built.

pub mod adapter;
pub mod config;
pub mod direct;
pub mod error;
pub mod managed;

use std::sync::Arc;

use renderq_models::BackendKind;

pub use adapter::{flatten_progress, snapshot_from_native, EndpointAdapter, ProgressParts};
pub use config::EndpointConfig;
pub use direct::DirectEndpoint;
pub use error::{BackendError, BackendResult};
pub use managed::{HttpInferenceClient, InferenceClient, ManagedEndpoint};

/// Build the adapter selected by `config`.
pub fn build_endpoint(config: &EndpointConfig) -> BackendResult<Arc<dyn EndpointAdapter>> {
    config.validate()?;
    let endpoint: Arc<dyn EndpointAdapter> = match config.kind {
        BackendKind::Managed => Arc::new(ManagedEndpoint::from_config(config)?),
        BackendKind::Direct => Arc::new(DirectEndpoint::new(config)?),
    };
    Ok(endpoint)
}
