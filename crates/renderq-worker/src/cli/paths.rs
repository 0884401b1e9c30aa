//! Local destination for a downloaded artifact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use renderq_models::{ArtifactKind, RenderJob};

/// Replace everything outside `[A-Za-z0-9._-]` with `_`.
///
/// Leading dots are dropped so the result is never hidden or a parent
/// reference. Falls back to `output` when nothing usable remains.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "output".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `{base}{ext}`, without doubling an extension the base already has.
fn with_extension(base: &str, ext: &str) -> String {
    let stem = base.strip_suffix(ext).filter(|s| !s.is_empty()).unwrap_or(base);
    format!("{}{}", stem, ext)
}

/// Where the artifact of `job` should be written.
///
/// 1. The caller's custom path, as given.
/// 2. Next to the job file, named after `output_name` or the job file's stem.
/// 3. `output_name` in `cwd` when there is no job file.
/// 4. `{job_id}_{timestamp_millis}{ext}` in `cwd`.
pub fn resolve_output_path(job: &RenderJob, kind: ArtifactKind, cwd: &Path, now: DateTime<Utc>) -> PathBuf {
    if let Some(custom) = job.custom_output_path.as_deref().filter(|p| !p.trim().is_empty()) {
        return PathBuf::from(custom);
    }

    let ext = kind.default_extension();

    if let Some(input) = job.input_file_path.as_deref() {
        let input = Path::new(input);
        let base = job
            .output_name
            .clone()
            .or_else(|| input.file_stem().map(|s| s.to_string_lossy().into_owned()));
        if let Some(base) = base {
            let name = with_extension(&sanitize_filename(&base), ext);
            return match input.parent() {
                Some(dir) => dir.join(name),
                None => PathBuf::from(name),
            };
        }
    }

    if let Some(name) = job.output_name.as_deref() {
        return cwd.join(with_extension(&sanitize_filename(name), ext));
    }

    cwd.join(format!(
        "{}_{}{}",
        sanitize_filename(job.job_id.as_str()),
        now.timestamp_millis(),
        ext
    ))
}
