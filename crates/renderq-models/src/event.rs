//! Queue lifecycle events published to observers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobId, JobProgress};

/// Event broadcast on a queue's event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A job's backend status changed
    Progress { job_id: JobId, progress: JobProgress },
    /// A job finished with an artifact
    Completed { job_id: JobId, return_value: Value },
    /// A job failed or was cancelled
    Failed {
        job_id: JobId,
        reason: String,
        #[serde(default)]
        cancelled: bool,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            QueueEvent::Progress { job_id, .. } => job_id,
            QueueEvent::Completed { job_id, .. } => job_id,
            QueueEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueEvent::Progress { .. })
    }
}
