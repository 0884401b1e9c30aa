//! Cloudflare R2 storage and artifact re-hosting.
//!
//! This crate provides:
//! - S3-compatible R2 client
//! - `ObjectStore` seam with an in-memory implementation
//! - Streaming re-host of backend artifacts with presigned URLs

pub mod client;
pub mod error;
pub mod store;
pub mod uploader;

pub use client::{R2Client, R2Config};
pub use error::{StorageError, StorageResult};
pub use store::{MemoryObjectStore, ObjectStore, StoredObject};
pub use uploader::{
    extension_for, object_key, resolve_content_type, ArtifactUploader, RehostOutcome,
    UploadConfig, UploadOptions, UploadedArtifact,
};
