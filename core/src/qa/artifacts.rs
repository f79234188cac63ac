//! Artifact records and issue links attached to a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Trace,
    Video,
    Screenshot,
    Report,
    Csv,
    Log,
    Diff,
}

impl ArtifactKind {
    /// Guess the kind of an evidence file from its extension.
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        let ext = lower.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "zip" => Some(ArtifactKind::Trace),
            "webm" => Some(ArtifactKind::Video),
            "png" | "jpg" | "jpeg" => Some(ArtifactKind::Screenshot),
            "json" => Some(ArtifactKind::Report),
            "csv" => Some(ArtifactKind::Csv),
            "txt" | "log" => Some(ArtifactKind::Log),
            "diff" | "patch" => Some(ArtifactKind::Diff),
            _ => None,
        }
    }
}

/// Append-only artifact registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    pub run_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn new(run_id: &str, kind: ArtifactKind, path: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            kind,
            path: path.into(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A filed external issue for one bug of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueRef {
    pub run_id: String,
    pub bug_id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}
