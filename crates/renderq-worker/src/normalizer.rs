//! Backend output normalization.
//!
//! Backends report artifacts under overlapping field names. This reduces a
//! final snapshot's output to one artifact URL plus whether it must be copied
//! into owned storage.

use renderq_models::{ArtifactKind, NormalizedResult, RawOutput, StatusSnapshot};

use crate::error::{WorkerError, WorkerResult};

/// Decide the artifact kind.
///
/// Image only when image-specific fields are present and video-specific ones
/// are not; an ambiguous `result` or `download_url` is a video.
pub fn artifact_kind(output: &RawOutput) -> ArtifactKind {
    if output.has_image_fields() && !output.has_video_fields() {
        ArtifactKind::Image
    } else {
        ArtifactKind::Video
    }
}

/// Best URL for `kind`, with the field it came from.
fn select_url(output: &RawOutput, kind: ArtifactKind) -> Option<(&'static str, &str)> {
    let specific = match kind {
        ArtifactKind::Video => [("video_url", &output.video_url), ("video", &output.video)],
        ArtifactKind::Image => [("image_url", &output.image_url), ("image", &output.image)],
    };

    [("result", &output.result), ("download_url", &output.download_url)]
        .into_iter()
        .chain(specific)
        .find_map(|(field, value)| value.as_deref().map(|url| (field, url)))
}

/// Normalize a completed snapshot.
pub fn normalize(snapshot: &StatusSnapshot) -> WorkerResult<NormalizedResult> {
    let output = snapshot
        .output
        .as_ref()
        .ok_or_else(|| WorkerError::missing_artifact("backend returned no output"))?;

    let detail = || {
        output
            .message
            .as_deref()
            .map(|m| format!(" (message: {})", m))
            .unwrap_or_default()
    };

    if output.requires_auth {
        return Err(WorkerError::missing_artifact(format!(
            "output requires authentication{}",
            detail()
        )));
    }

    let kind = artifact_kind(output);
    let (field, url) = select_url(output, kind).ok_or_else(|| {
        WorkerError::missing_artifact(format!("no {} URL in output{}", kind, detail()))
    })?;

    // A download_url is already durable for the caller; everything else is
    // backend-hosted and transient.
    let durable = output.download_url.is_some();
    tracing::debug!(field, durable, "Selected {} artifact URL", kind);

    Ok(NormalizedResult {
        kind,
        source_url: url.to_string(),
        requires_reupload: !durable,
        r2_url: if durable { output.download_url.clone() } else { None },
        render_duration: snapshot.render_duration,
    })
}
