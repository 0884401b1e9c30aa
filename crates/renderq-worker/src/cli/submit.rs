//! Turning a job document into a queued job.

use std::path::Path;

use serde_json::{json, Value};

use renderq_models::{JobId, RenderJob};

use crate::error::{WorkerError, WorkerResult};

/// Parse a job document.
///
/// `source` is the file the document was read from, if any; stdin documents
/// have none and fall back to `output_name` or a generated download path.
pub fn parse_job(
    raw: &str,
    queue: &str,
    source: Option<&Path>,
    custom_output: Option<&Path>,
) -> WorkerResult<RenderJob> {
    let document: Value = serde_json::from_str(raw)?;
    let mut job = RenderJob::from_document(queue, document).map_err(|e| WorkerError::payload(e.to_string()))?;
    if let Some(source) = source {
        job = job.with_input_file(source.display().to_string());
    }
    Ok(job.with_custom_output(custom_output.map(|p| p.display().to_string())))
}

/// Line printed for a job that was queued without waiting.
pub fn receipt(job_id: &JobId) -> Value {
    json!({ "jobId": job_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderq_models::LEGACY_ALGORITHM_KEY;

    #[test]
    fn test_parse_from_file() {
        let job = parse_job(
            r#"{"algorithm": "animatediff", "prompt": "fish"}"#,
            "video",
            Some(Path::new("/jobs/fish.json")),
            None,
        )
        .unwrap();

        assert_eq!(job.queue, "video");
        assert_eq!(job.algorithm, "animatediff");
        assert_eq!(job.input_file_path.as_deref(), Some("/jobs/fish.json"));
        assert_eq!(job.custom_output_path, None);
    }

    #[test]
    fn test_parse_from_stdin() {
        let raw = format!(r#"{{"{}": "deforum", "custom_output_path": "/tmp/keep.mp4"}}"#, LEGACY_ALGORITHM_KEY);
        let job = parse_job(&raw, "video", None, Some(Path::new("/out/a.mp4"))).unwrap();

        assert_eq!(job.algorithm, "deforum");
        assert_eq!(job.input_file_path, None);
        assert_eq!(job.custom_output_path.as_deref(), Some("/out/a.mp4"));
        assert!(job.input.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_documents() {
        assert!(matches!(parse_job("not json", "video", None, None), Err(WorkerError::Json(_))));
        assert!(matches!(
            parse_job(r#"{"prompt": "fish"}"#, "video", None, None),
            Err(WorkerError::Payload(ref m)) if m.contains("algorithm")
        ));
    }

    #[test]
    fn test_receipt_shape() {
        let id = JobId::from_string("job-7");
        assert_eq!(receipt(&id).to_string(), r#"{"jobId":"job-7"}"#);
    }
}
