//! Shared data models for the renderq dispatch engine.
//!
//! This crate provides Serde-serializable types for:
//! - Render jobs and their queue records
//! - Backend handles and status snapshots
//! - Normalized artifacts and queue events

pub mod backend;
pub mod event;
pub mod job;
pub mod result;
pub mod snapshot;

// Re-export common types
pub use backend::{BackendHandle, BackendKind};
pub use event::QueueEvent;
pub use job::{
    JobId, JobPayloadError, JobProgress, JobRecord, JobState, RenderJob, LEGACY_ALGORITHM_KEY, SHARED_METADATA_KEYS,
};
pub use result::{ArtifactKind, NormalizedResult};
pub use snapshot::{BackendStatus, RawOutput, StatusSnapshot};
