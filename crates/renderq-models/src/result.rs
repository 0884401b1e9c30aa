//! Normalized render results.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Media type of a render artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    #[default]
    Video,
    Image,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "video",
            ArtifactKind::Image => "image",
        }
    }

    /// File extension used when nothing better is known, including the dot.
    pub fn default_extension(&self) -> &'static str {
        match self {
            ArtifactKind::Video => ".mp4",
            ArtifactKind::Image => ".png",
        }
    }

    /// Content type used when nothing better is known.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "video/mp4",
            ArtifactKind::Image => "image/png",
        }
    }

    /// Guess the kind from a URL or path by its extension.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let ext = path.rsplit_once('.')?.1.to_lowercase();
        match ext.as_str() {
            "mp4" | "webm" | "mov" | "mkv" | "gif" => Some(ArtifactKind::Video),
            "png" | "jpg" | "jpeg" | "webp" => Some(ArtifactKind::Image),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend result reduced to a single artifact location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NormalizedResult {
    pub kind: ArtifactKind,
    /// Where the backend left the artifact
    pub source_url: String,
    /// True when the source is backend-local and must be copied to durable storage
    #[serde(default)]
    pub requires_reupload: bool,
    /// Durable URL, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r2_url: Option<String>,
    /// Render time in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_duration: Option<f64>,
}

impl NormalizedResult {
    pub fn new(kind: ArtifactKind, source_url: impl Into<String>) -> Self {
        Self {
            kind,
            source_url: source_url.into(),
            requires_reupload: true,
            r2_url: None,
            render_duration: None,
        }
    }

    /// URL a consumer should download from.
    pub fn durable_url(&self) -> &str {
        self.r2_url.as_deref().unwrap_or(&self.source_url)
    }

    /// Parse a stored return value.
    ///
    /// Completed jobs written by older workers may carry a bare URL string or
    /// an object with only `r2_url`, so both are accepted.
    pub fn from_return_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(Self::from_durable_url(s)),
            Value::Object(map) => {
                if let Ok(result) = serde_json::from_value::<Self>(value.clone()) {
                    return Some(result);
                }
                map.get("r2_url")
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(Self::from_durable_url)
            }
            _ => None,
        }
    }

    fn from_durable_url(url: &str) -> Self {
        let kind = ArtifactKind::from_path(url).unwrap_or_default();
        Self {
            kind,
            source_url: url.to_string(),
            requires_reupload: false,
            r2_url: Some(url.to_string()),
            render_duration: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_from_path() {
        assert_eq!(ArtifactKind::from_path("https://cdn/x/out.PNG?sig=1"), Some(ArtifactKind::Image));
        assert_eq!(ArtifactKind::from_path("/tmp/out.mp4"), Some(ArtifactKind::Video));
        assert_eq!(ArtifactKind::from_path("https://cdn/x/blob"), None);
    }

    #[test]
    fn test_return_value_bare_string() {
        let result = NormalizedResult::from_return_value(&json!("https://r2/images/a.png")).unwrap();
        assert_eq!(result.kind, ArtifactKind::Image);
        assert_eq!(result.durable_url(), "https://r2/images/a.png");
        assert!(!result.requires_reupload);
    }

    #[test]
    fn test_return_value_object_forms() {
        let full = json!({
            "kind": "video",
            "source_url": "https://backend/out.mp4",
            "requires_reupload": true,
            "r2_url": "https://r2/videos/a.mp4",
            "render_duration": 12.5,
        });
        let result = NormalizedResult::from_return_value(&full).unwrap();
        assert_eq!(result.durable_url(), "https://r2/videos/a.mp4");
        assert_eq!(result.render_duration, Some(12.5));

        let legacy = json!({"r2_url": "https://r2/videos/b.mp4"});
        let result = NormalizedResult::from_return_value(&legacy).unwrap();
        assert_eq!(result.durable_url(), "https://r2/videos/b.mp4");
        assert_eq!(result.kind, ArtifactKind::Video);

        assert!(NormalizedResult::from_return_value(&json!({"status": "ok"})).is_none());
        assert!(NormalizedResult::from_return_value(&json!(42)).is_none());
    }
}
