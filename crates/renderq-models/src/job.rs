//! Job definitions for queue processing.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use crate::backend::BackendHandle;
use crate::result::NormalizedResult;
use crate::snapshot::StatusSnapshot;

/// Payload keys shared by every workflow. They describe where the artifact
/// should land and who to tell about failures, and are never forwarded to a
/// backend.
pub const SHARED_METADATA_KEYS: &[&str] = &[
    "algorithm",
    LEGACY_ALGORITHM_KEY,
    "output_name",
    "input_file_path",
    "custom_output_path",
    "external_id",
];

/// Older job files name the workflow under this key.
pub const LEGACY_ALGORITHM_KEY: &str = "infinidream_algorithm";

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job state in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is waiting in queue
    #[default]
    Pending,
    /// A worker picked the job up
    Processing,
    /// Job completed and has a return value
    Completed,
    /// Job failed (including user cancellation)
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = JobPayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(JobPayloadError::InvalidField {
                field: "state",
                reason: format!("unknown job state '{}'", other),
            }),
        }
    }
}

/// Errors raised while turning a submitted JSON document into a job.
#[derive(Debug, Error)]
pub enum JobPayloadError {
    #[error("Job payload must be a JSON object")]
    NotAnObject,

    #[error("Job payload is missing '{0}'")]
    MissingField(&'static str),

    #[error("Invalid '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Invalid job payload: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// A render job as carried by the queue.
///
/// `input` is the opaque, backend-specific part of the payload; the shared
/// metadata fields sit next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RenderJob {
    /// Unique job ID
    pub job_id: JobId,
    /// Queue the job was submitted to
    #[validate(length(min = 1, message = "queue name must not be empty"))]
    pub queue: String,
    /// Workflow name used to pick a payload builder
    #[validate(length(min = 1, message = "algorithm must not be empty"))]
    pub algorithm: String,
    /// Backend-specific input fields
    pub input: Map<String, Value>,
    /// Preferred base name of the downloaded artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    /// Path of the job file the CLI submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file_path: Option<String>,
    /// Explicit download destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_output_path: Option<String>,
    /// Correlation id of an external record to notify on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl RenderJob {
    /// Create a new job for the given queue and workflow.
    pub fn new(queue: impl Into<String>, algorithm: impl Into<String>, input: Map<String, Value>) -> Self {
        Self {
            job_id: JobId::new(),
            queue: queue.into(),
            algorithm: algorithm.into(),
            input,
            output_name: None,
            input_file_path: None,
            custom_output_path: None,
            external_id: None,
            created_at: Utc::now(),
        }
    }

    /// Build a job from a submitted JSON document.
    ///
    /// The document carries the workflow name under `algorithm` (or the older
    /// `infinidream_algorithm`, used when `algorithm` is absent) plus any shared
    /// metadata; every other field becomes backend input.
    pub fn from_document(queue: impl Into<String>, document: Value) -> Result<Self, JobPayloadError> {
        let Value::Object(mut fields) = document else {
            return Err(JobPayloadError::NotAnObject);
        };

        let legacy = fields.remove(LEGACY_ALGORITHM_KEY);
        let algorithm = match fields.remove("algorithm").or(legacy) {
            Some(Value::String(s)) => s,
            Some(_) => {
                return Err(JobPayloadError::InvalidField {
                    field: "algorithm",
                    reason: "expected a string".to_string(),
                })
            }
            None => return Err(JobPayloadError::MissingField("algorithm")),
        };

        let mut job = Self::new(queue, algorithm, Map::new());
        job.output_name = take_string(&mut fields, "output_name")?;
        job.input_file_path = take_string(&mut fields, "input_file_path")?;
        job.custom_output_path = take_string(&mut fields, "custom_output_path")?;
        job.external_id = take_string(&mut fields, "external_id")?;
        job.input = fields;

        job.validate()?;
        Ok(job)
    }

    /// Set the path of the file this job was read from.
    pub fn with_input_file(mut self, path: impl Into<String>) -> Self {
        self.input_file_path = Some(path.into());
        self
    }

    /// Set an explicit download destination.
    pub fn with_custom_output(mut self, path: Option<String>) -> Self {
        if path.is_some() {
            self.custom_output_path = path;
        }
        self
    }

    /// Set the external record correlation id.
    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    /// Generate idempotency key for deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("render:{}:{}", self.queue, self.job_id)
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &'static str) -> Result<Option<String>, JobPayloadError> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(JobPayloadError::InvalidField {
            field: key,
            reason: "expected a string".to_string(),
        }),
    }
}

/// Progress published onto the job record for external observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobProgress {
    /// Job ID
    pub job_id: JobId,
    /// Backend-assigned id of the remote computation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_job_id: Option<String>,
    /// External record correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Latest backend snapshot
    pub snapshot: StatusSnapshot,
    /// When the snapshot was taken
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    pub fn new(job: &RenderJob, handle: Option<&BackendHandle>, snapshot: StatusSnapshot) -> Self {
        Self {
            job_id: job.job_id.clone(),
            backend_job_id: handle.map(|h| h.id.clone()),
            external_id: job.external_id.clone(),
            snapshot,
            updated_at: Utc::now(),
        }
    }
}

/// The queue's persisted view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    /// Submitted payload
    pub job: RenderJob,
    /// Lifecycle state
    #[serde(default)]
    pub state: JobState,
    /// Latest published progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    /// Terminal return value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    /// Terminal failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    /// Set out-of-band when the user asks to stop the job
    #[serde(default)]
    pub cancelled_by_user: bool,
    /// Remote job handle, once submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_handle: Option<BackendHandle>,
    /// Worker currently driving the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Last time the owner reported it was still working on the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a fresh record for a newly submitted job.
    pub fn new(job: RenderJob) -> Self {
        Self {
            job,
            state: JobState::Pending,
            progress: None,
            return_value: None,
            failed_reason: None,
            cancelled_by_user: false,
            backend_handle: None,
            owner: None,
            heartbeat_at: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.job_id
    }

    /// Worker holding a live lease on the job.
    ///
    /// A lease is live while the job is processing and its owner has sent a
    /// heartbeat within `ttl` of `now`.
    pub fn lease_holder(&self, now: DateTime<Utc>, ttl: Duration) -> Option<&str> {
        if self.state != JobState::Processing {
            return None;
        }
        let beat = self.heartbeat_at?;
        // A heartbeat from the future (clock skew) counts as fresh
        let fresh = now
            .signed_duration_since(beat)
            .to_std()
            .map_or(true, |age| age < ttl);
        if fresh {
            self.owner.as_deref()
        } else {
            None
        }
    }

    /// Artifact described by the return value, if the job completed.
    pub fn artifact(&self) -> Option<NormalizedResult> {
        self.return_value.as_ref().and_then(NormalizedResult::from_return_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_document_splits_metadata() {
        let job = RenderJob::from_document(
            "video",
            json!({
                "algorithm": "animatediff",
                "prompt": "fish",
                "frame_count": 64,
                "output_name": "fishes",
                "external_id": "dream-1",
            }),
        )
        .unwrap();

        assert_eq!(job.algorithm, "animatediff");
        assert_eq!(job.output_name.as_deref(), Some("fishes"));
        assert_eq!(job.external_id.as_deref(), Some("dream-1"));
        assert_eq!(job.input.get("prompt"), Some(&json!("fish")));
        assert_eq!(job.input.get("frame_count"), Some(&json!(64)));
        for key in SHARED_METADATA_KEYS {
            assert!(!job.input.contains_key(*key), "{} leaked into input", key);
        }
    }

    #[test]
    fn test_from_document_rejects_bad_payloads() {
        assert!(matches!(
            RenderJob::from_document("video", json!(["not", "an", "object"])),
            Err(JobPayloadError::NotAnObject)
        ));
        assert!(matches!(
            RenderJob::from_document("video", json!({"prompt": "fish"})),
            Err(JobPayloadError::MissingField("algorithm"))
        ));
        assert!(matches!(
            RenderJob::from_document("video", json!({"algorithm": 3})),
            Err(JobPayloadError::InvalidField { field: "algorithm", .. })
        ));
        assert!(matches!(
            RenderJob::from_document("video", json!({"algorithm": ""})),
            Err(JobPayloadError::Validation(_))
        ));
    }

    #[test]
    fn test_from_document_accepts_legacy_algorithm_key() {
        let job = RenderJob::from_document(
            "qwenimage",
            json!({"infinidream_algorithm": "qwen-image", "prompt": "fish", "seed": -1}),
        )
        .unwrap();
        assert_eq!(job.algorithm, "qwen-image");
        assert!(!job.input.contains_key(LEGACY_ALGORITHM_KEY));
        assert_eq!(job.input.get("seed"), Some(&json!(-1)));

        let both = RenderJob::from_document(
            "video",
            json!({"algorithm": "uprez", "infinidream_algorithm": "stale"}),
        )
        .unwrap();
        assert_eq!(both.algorithm, "uprez");
        assert!(both.input.is_empty());
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert_eq!("processing".parse::<JobState>().unwrap(), JobState::Processing);
    }

    #[test]
    fn test_lease_holder() {
        let now = Utc::now();
        let ttl = Duration::from_secs(120);
        let mut record = JobRecord::new(RenderJob::new("video", "animatediff", Map::new()));
        record.owner = Some("worker-a".to_string());
        record.heartbeat_at = Some(now - chrono::Duration::seconds(30));
        assert_eq!(record.lease_holder(now, ttl), None, "pending jobs have no lease");

        record.state = JobState::Processing;
        assert_eq!(record.lease_holder(now, ttl), Some("worker-a"));

        record.heartbeat_at = Some(now - chrono::Duration::seconds(600));
        assert_eq!(record.lease_holder(now, ttl), None);

        record.heartbeat_at = None;
        assert_eq!(record.lease_holder(now, ttl), None);
    }

    #[test]
    fn test_custom_output_only_overrides_when_set() {
        let job = RenderJob::new("video", "hunyuan", Map::new())
            .with_custom_output(Some("out/clip.mp4".to_string()))
            .with_custom_output(None);
        assert_eq!(job.custom_output_path.as_deref(), Some("out/clip.mp4"));
    }
}
