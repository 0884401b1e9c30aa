//! Backend status snapshots.
//!
//! A snapshot is one poll tick's parsed view of a remote job. Snapshots are
//! never mutated once built; each tick supersedes the previous one.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Remote job status shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendStatus {
    /// Waiting for GPU capacity
    #[default]
    Queued,
    /// Running on the backend
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Queued => "QUEUED",
            BackendStatus::InProgress => "IN_PROGRESS",
            BackendStatus::Completed => "COMPLETED",
            BackendStatus::Failed => "FAILED",
        }
    }

    /// Map a backend's native status string.
    ///
    /// Cancelled and timed-out remote jobs count as failures; anything
    /// unrecognised is treated as still running.
    pub fn from_native(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "COMPLETED" => BackendStatus::Completed,
            "FAILED" | "CANCELLED" | "TIMED_OUT" | "ERROR" => BackendStatus::Failed,
            "IN_QUEUE" | "QUEUED" => BackendStatus::Queued,
            _ => BackendStatus::InProgress,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendStatus::Completed | BackendStatus::Failed)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Union of the output fields backends are known to report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawOutput {
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, deserialize_with = "string_or_none", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "std::ops::Not::not")]
    pub requires_auth: bool,
    /// Fields outside the known union, kept for diagnostics
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawOutput {
    /// True when a video-specific field is present.
    pub fn has_video_fields(&self) -> bool {
        self.video.is_some() || self.video_url.is_some()
    }

    /// True when an image-specific field is present.
    pub fn has_image_fields(&self) -> bool {
        self.image.is_some() || self.image_url.is_some()
    }

    /// Parse an output value, returning `None` for non-object payloads.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// Accept a non-empty string, treat every other JSON shape as absent.
fn string_or_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

/// Read a flag from a bool, a number, or a "true"/"1"/"yes" string. Anything else is false.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    })
}

/// One poll tick's view of a remote job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StatusSnapshot {
    pub status: BackendStatus,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RawOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Side-channel preview payload some backends attach to progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Value>,
    /// Render time in seconds, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_duration: Option<f64>,
}

impl StatusSnapshot {
    /// Create a snapshot for the given status. `completed` follows the status.
    pub fn new(status: BackendStatus) -> Self {
        Self {
            status,
            completed: status == BackendStatus::Completed,
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: Option<f64>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_output(mut self, output: Option<RawOutput>) -> Self {
        self.output = output;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn with_render_duration(mut self, seconds: Option<f64>) -> Self {
        self.render_duration = seconds;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == BackendStatus::Failed
    }

    /// True when both snapshots report the same thing.
    ///
    /// `render_duration` is ignored: a wall-clock derived value changes on
    /// every tick without anything having happened.
    pub fn same_observation(&self, other: &StatusSnapshot) -> bool {
        self.status == other.status
            && self.completed == other.completed
            && self.progress == other.progress
            && self.output == other.output
            && self.error == other.error
            && self.preview == other.preview
    }

    /// Short human-readable summary used in log lines.
    pub fn summary(&self) -> String {
        match (self.progress, &self.error) {
            (_, Some(error)) => format!("{} ({})", self.status, error),
            (Some(progress), None) => format!("{} {:.1}%", self.status, progress * 100.0),
            (None, None) => self.status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_native_status_mapping() {
        assert_eq!(BackendStatus::from_native("COMPLETED"), BackendStatus::Completed);
        assert_eq!(BackendStatus::from_native("failed"), BackendStatus::Failed);
        assert_eq!(BackendStatus::from_native("CANCELLED"), BackendStatus::Failed);
        assert_eq!(BackendStatus::from_native("IN_QUEUE"), BackendStatus::Queued);
        assert_eq!(BackendStatus::from_native("IN_PROGRESS"), BackendStatus::InProgress);
        assert_eq!(BackendStatus::from_native("RUNNING"), BackendStatus::InProgress);
    }

    #[test]
    fn test_completed_follows_status() {
        assert!(StatusSnapshot::new(BackendStatus::Completed).completed);
        assert!(!StatusSnapshot::new(BackendStatus::InProgress).completed);
        assert!(!StatusSnapshot::new(BackendStatus::Failed).completed);
    }

    #[test]
    fn test_same_observation_ignores_duration() {
        let a = StatusSnapshot::new(BackendStatus::InProgress)
            .with_progress(Some(0.4))
            .with_render_duration(Some(1.0));
        let b = a.clone().with_render_duration(Some(3.0));
        let c = a.clone().with_progress(Some(0.5));

        assert!(a.same_observation(&b));
        assert!(!a.same_observation(&c));
    }

    #[test]
    fn test_raw_output_ignores_non_string_urls() {
        let output = RawOutput::from_value(&json!({
            "result": {"nested": true},
            "video_url": "https://x/y.mp4",
            "image": "",
            "seed": 42,
        }))
        .unwrap();

        assert_eq!(output.result, None);
        assert_eq!(output.video_url.as_deref(), Some("https://x/y.mp4"));
        assert_eq!(output.image, None);
        assert_eq!(output.extra.get("seed"), Some(&json!(42)));
        assert!(RawOutput::from_value(&json!("https://x/y.mp4")).is_none());
    }

    #[test]
    fn test_requires_auth_tolerates_odd_shapes() {
        let output = RawOutput::from_value(&json!({
            "video_url": "https://x/y.mp4",
            "requires_auth": null,
        }))
        .unwrap();
        assert!(!output.requires_auth);
        assert_eq!(output.video_url.as_deref(), Some("https://x/y.mp4"));

        for flag in [json!(true), json!("true"), json!(1), json!("1")] {
            let output = RawOutput::from_value(&json!({"video": "v.mp4", "requires_auth": flag})).unwrap();
            assert!(output.requires_auth, "{flag} should read as set");
        }
        for flag in [json!(false), json!("no"), json!(0), json!({"x": 1})] {
            let output = RawOutput::from_value(&json!({"video": "v.mp4", "requires_auth": flag})).unwrap();
            assert!(!output.requires_auth, "{flag} should read as unset");
        }
    }
}
