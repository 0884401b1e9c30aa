//! Remote backend identity types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which endpoint protocol created a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Endpoint driven through the serverless inference SDK surface
    Managed,
    /// Endpoint addressed directly over bearer-token REST
    Direct,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Managed => "managed",
            BackendKind::Direct => "direct",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "managed" | "sdk" => Ok(BackendKind::Managed),
            "direct" | "http" => Ok(BackendKind::Direct),
            other => Err(format!("unknown backend kind '{}'", other)),
        }
    }
}

/// Opaque remote job identifier plus the variant that issued it.
///
/// Created at submission time and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BackendHandle {
    /// Backend-assigned job id
    pub id: String,
    /// Endpoint variant that created the handle
    pub kind: BackendKind,
    /// When the remote job was submitted
    pub submitted_at: DateTime<Utc>,
}

impl BackendHandle {
    pub fn new(id: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            id: id.into(),
            kind,
            submitted_at: Utc::now(),
        }
    }

    /// Seconds elapsed since submission.
    pub fn elapsed_secs(&self) -> f64 {
        let elapsed = Utc::now() - self.submitted_at;
        elapsed.num_milliseconds().max(0) as f64 / 1000.0
    }
}
