//! Backend payload builders.
//!
//! Each workflow knows how to phrase its request for the backend. The
//! templates themselves live outside this crate; the worker only needs a way
//! to look one up by algorithm name.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use renderq_models::{RenderJob, SHARED_METADATA_KEYS};

use crate::error::{WorkerError, WorkerResult};

/// Turns a queued job into the backend's `input` document.
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, job: &RenderJob) -> WorkerResult<Value>;
}

/// Forwards the job input unchanged, minus shared metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPayload;

impl PayloadBuilder for PassthroughPayload {
    fn build(&self, job: &RenderJob) -> WorkerResult<Value> {
        let mut input = job.input.clone();
        for key in SHARED_METADATA_KEYS {
            input.remove(*key);
        }
        Ok(Value::Object(input))
    }
}

/// Payload builders keyed by algorithm name.
#[derive(Default, Clone)]
pub struct PayloadRegistry {
    builders: HashMap<String, Arc<dyn PayloadBuilder>>,
    fallback: Option<Arc<dyn PayloadBuilder>>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that forwards every job's input as-is.
    pub fn passthrough() -> Self {
        Self::new().with_fallback(Arc::new(PassthroughPayload))
    }

    pub fn register(mut self, algorithm: impl Into<String>, builder: Arc<dyn PayloadBuilder>) -> Self {
        self.builders.insert(algorithm.into(), builder);
        self
    }

    /// Builder used for algorithms without a dedicated one.
    pub fn with_fallback(mut self, builder: Arc<dyn PayloadBuilder>) -> Self {
        self.fallback = Some(builder);
        self
    }

    pub fn build(&self, job: &RenderJob) -> WorkerResult<Value> {
        let builder = self
            .builders
            .get(&job.algorithm)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                WorkerError::payload(format!("no payload builder for algorithm '{}'", job.algorithm))
            })?;
        builder.build(job)
    }
}
