//! The uniform backend interface and the native-status helpers shared by
//! both variants.

use async_trait::async_trait;
use serde_json::Value;

use renderq_models::{BackendHandle, BackendKind, BackendStatus, RawOutput, StatusSnapshot};

use crate::error::BackendResult;

/// One remote GPU backend.
///
/// `run` errors mean the job never started. `status` errors are transport
/// trouble for a single tick; callers decide whether to keep polling.
#[async_trait]
pub trait EndpointAdapter: Send + Sync {
    /// Variant tag stamped onto every handle this adapter creates.
    fn kind(&self) -> BackendKind;

    /// Submit a job.
    async fn run(&self, input: Value) -> BackendResult<BackendHandle>;

    /// Fetch the current state of a submitted job.
    async fn status(&self, handle: &BackendHandle) -> BackendResult<StatusSnapshot>;

    /// Ask the backend to stop a job. Best-effort.
    async fn cancel(&self, handle: &BackendHandle) -> BackendResult<()>;
}

/// Progress value split into its parts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressParts {
    pub progress: Option<f64>,
    pub preview: Option<Value>,
    /// Seconds
    pub render_time: Option<f64>,
}

/// Split a native progress value.
///
/// Most backends report a bare number. Some report an object carrying the
/// number next to a preview frame and a render-time metric in milliseconds.
pub fn flatten_progress(value: Option<&Value>) -> ProgressParts {
    match value {
        Some(Value::Number(n)) => ProgressParts {
            progress: n.as_f64(),
            ..Default::default()
        },
        Some(Value::String(s)) => {
            let s = s.trim();
            let progress = match s.strip_suffix('%') {
                Some(percent) => percent.trim().parse::<f64>().ok().map(|p| p / 100.0),
                None => s.parse().ok(),
            };
            ProgressParts {
                progress,
                ..Default::default()
            }
        }
        Some(Value::Object(map)) => {
            let preview = map
                .get("preview_frame")
                .or_else(|| map.get("preview"))
                .filter(|v| !v.is_null())
                .cloned();
            let render_time = map
                .get("render_time_ms")
                .and_then(Value::as_f64)
                .map(|ms| ms / 1000.0)
                .or_else(|| map.get("render_time").and_then(Value::as_f64));
            let progress = flatten_progress(map.get("progress")).progress;
            ProgressParts {
                progress,
                preview,
                render_time,
            }
        }
        _ => ProgressParts::default(),
    }
}

/// Parse a native output value. A bare string is taken as the result URL.
pub fn raw_output(value: Option<&Value>) -> Option<RawOutput> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(RawOutput {
            result: Some(s.clone()),
            ..Default::default()
        }),
        Some(value @ Value::Object(_)) => RawOutput::from_value(value),
        _ => None,
    }
}

/// Render a native error value as text.
pub fn error_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Backend-reported generation time in seconds.
///
/// Checked in order: `output.generation_time` (seconds), a render time peeled
/// out of the progress object, then top-level `executionTime` (milliseconds).
pub fn reported_generation_time(native: &Value, progress: &ProgressParts) -> Option<f64> {
    native
        .get("output")
        .and_then(|o| o.get("generation_time"))
        .and_then(Value::as_f64)
        .or(progress.render_time)
        .or_else(|| {
            native
                .get("executionTime")
                .or_else(|| native.get("execution_time"))
                .and_then(Value::as_f64)
                .map(|ms| ms / 1000.0)
        })
}

/// Build a snapshot from a backend's native status document.
///
/// Render duration prefers the backend's own figure; terminal snapshots
/// without one fall back to wall-clock time since submission.
pub fn snapshot_from_native(native: &Value, handle: &BackendHandle) -> StatusSnapshot {
    let status = native
        .get("status")
        .and_then(Value::as_str)
        .map(BackendStatus::from_native)
        .unwrap_or(BackendStatus::InProgress);

    let parts = flatten_progress(native.get("progress"));
    let reported = reported_generation_time(native, &parts);
    let render_duration = match reported {
        Some(seconds) => Some(seconds),
        None if status.is_terminal() => Some(handle.elapsed_secs()),
        None => None,
    };

    let mut snapshot = StatusSnapshot::new(status)
        .with_progress(parts.progress)
        .with_output(raw_output(native.get("output")))
        .with_error(error_text(native.get("error")))
        .with_render_duration(render_duration);
    snapshot.preview = parts.preview;
    snapshot
}
