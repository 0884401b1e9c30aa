//! Render job worker.
//!
//! This crate provides:
//! - Status polling with cancellation and progress publication
//! - Normalization of backend output into one artifact URL
//! - Job execution with re-hosting, failure reporting and a bounded pool
//! - The completion listener, path resolver and downloader used by the CLI

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod normalizer;
pub mod notify;
pub mod payload;
pub mod poller;
pub mod retry;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DownloadConfig, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use logging::{init_tracing, JobLogger};
pub use normalizer::{artifact_kind, normalize};
pub use notify::{FailureNotifier, HttpFailureNotifier, NoopNotifier};
pub use payload::{PassthroughPayload, PayloadBuilder, PayloadRegistry};
pub use poller::StatusPoller;
pub use runner::{JobOutcome, JobProcessor, WorkerRunner};
