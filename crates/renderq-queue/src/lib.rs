//! Redis-backed job queue for render jobs.
//!
//! This crate provides:
//! - Job enqueueing via Redis Streams
//! - Worker consumption with crash recovery and DLQ
//! - Job records (progress, cancellation flag, terminal outcome)
//! - Queue events via Redis Pub/Sub

pub mod error;
pub mod events;
pub mod memory;
pub mod queue;
pub mod store;

pub use error::{QueueError, QueueResult};
pub use events::{EventChannel, EventStream};
pub use memory::MemoryJobStore;
pub use queue::{JobQueue, QueueConfig};
pub use store::{parse_return_value, JobStore, RedisJobStore, JOB_RECORD_TTL_SECS};
