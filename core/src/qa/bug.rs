//! Bug records produced by triage.
//!
//! Both triage paths (external analysis and the report walker) emit
//! loosely shaped [`RawBug`]s. [`BugRecord::from_raw`] normalizes them
//! into the persisted form: fixed severity taxonomy, flattened text
//! fields, a default confidence, and a content-derived `bug_id`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};

use super::artifacts::ArtifactKind;
use super::run::SuiteKind;

/// Confidence assigned when the source omits one.
pub const DEFAULT_CONFIDENCE: u8 = 70;

/// Length of the hex prefix used as `bug_id`.
const BUG_ID_LEN: usize = 12;

/// Four-level severity taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocker,
    Critical,
    Major,
    Minor,
}

impl Severity {
    /// Map a free-form severity label into the taxonomy.
    ///
    /// Unknown or missing labels land on `Major`.
    pub fn normalize(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "blocker" => Severity::Blocker,
            "critical" | "high" => Severity::Critical,
            "minor" | "low" | "trivial" => Severity::Minor,
            _ => Severity::Major,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Blocker => "blocker",
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trim and collapse internal whitespace; empty titles get a suite placeholder.
pub fn normalize_title(title: &str, suite: SuiteKind) -> String {
    let collapsed = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        format!("UI test failure ({suite})")
    } else {
        collapsed
    }
}

/// Stable id over `(suite, normalized title)`.
///
/// Identical failures in different runs share an id, which lets
/// downstream consumers dedupe across runs.
pub fn bug_id(suite: SuiteKind, title: &str) -> String {
    let normalized = normalize_title(title, suite);
    let digest = Sha1::digest(format!("{suite}:{normalized}").as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(BUG_ID_LEN);
    hex
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrList {
    Text(String),
    List(Vec<String>),
}

fn text_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<TextOrList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(TextOrList::Text(text)) => vec![text],
        Some(TextOrList::List(items)) => items,
    })
}

/// Un-normalized bug as emitted by a triage source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawBug {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub suite: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default, deserialize_with = "text_or_list")]
    pub repro_steps: Vec<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default, deserialize_with = "text_or_list")]
    pub evidence_paths: Vec<String>,
    #[serde(default)]
    pub suggested_fix: Option<String>,
    #[serde(default)]
    pub component_guess: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Normalized, persisted bug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BugRecord {
    pub bug_id: String,
    pub run_id: String,
    pub suite: SuiteKind,
    #[serde(default)]
    pub workflow: String,
    pub severity: Severity,
    pub title: String,
    pub expected: String,
    pub actual: String,
    /// Ordered steps, newline-joined.
    pub repro_steps: String,
    /// Trace archives and unclassified evidence, newline-joined.
    #[serde(default)]
    pub trace_path: String,
    #[serde(default)]
    pub screenshot_path: String,
    #[serde(default)]
    pub video_path: String,
    #[serde(default)]
    pub root_cause_guess: String,
    #[serde(default)]
    pub code_location_guess: String,
    pub confidence: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BugRecord {
    /// Normalize a raw bug found in `suite` of run `run_id`.
    ///
    /// A suite named by the source wins over `suite` when it parses.
    pub fn from_raw(raw: RawBug, run_id: &str, suite: SuiteKind, now: DateTime<Utc>) -> Self {
        let suite = raw
            .suite
            .as_deref()
            .and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
                "smoke" => Some(SuiteKind::Smoke),
                "regression" => Some(SuiteKind::Regression),
                _ => None,
            })
            .unwrap_or(suite);
        let title = normalize_title(&raw.title, suite);

        let mut traces = Vec::new();
        let mut screenshots = Vec::new();
        let mut videos = Vec::new();
        for path in raw.evidence_paths.into_iter().filter(|p| !p.trim().is_empty()) {
            // Anything that is not a screenshot or a video rides with the traces.
            match ArtifactKind::from_path(&path) {
                Some(ArtifactKind::Screenshot) => screenshots.push(path),
                Some(ArtifactKind::Video) => videos.push(path),
                _ => traces.push(path),
            }
        }

        let confidence = raw
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.round().clamp(0.0, 100.0) as u8)
            .unwrap_or(DEFAULT_CONFIDENCE);

        Self {
            bug_id: bug_id(suite, &title),
            run_id: run_id.to_string(),
            suite,
            workflow: raw.workflow.unwrap_or_default(),
            severity: Severity::normalize(raw.severity.as_deref().unwrap_or_default()),
            title,
            expected: raw.expected.unwrap_or_default(),
            actual: raw.actual.unwrap_or_default(),
            repro_steps: raw.repro_steps.join("\n"),
            trace_path: traces.join("\n"),
            screenshot_path: screenshots.join("\n"),
            video_path: videos.join("\n"),
            root_cause_guess: raw.suggested_fix.unwrap_or_default(),
            code_location_guess: raw.component_guess.unwrap_or_default(),
            confidence,
            issue_url: None,
            created_at: now,
        }
    }

    /// All evidence paths across the three columns.
    pub fn evidence_paths(&self) -> impl Iterator<Item = &str> {
        [&self.trace_path, &self.screenshot_path, &self.video_path]
            .into_iter()
            .flat_map(|column| column.lines())
            .filter(|line| !line.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bug_id_is_stable_and_short() {
        let a = bug_id(SuiteKind::Smoke, "Login - shows error on bad password");
        let b = bug_id(SuiteKind::Smoke, "Login - shows error on bad password");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn bug_id_matches_sha1_prefix() {
        // sha1("smoke:abc")
        let expected = format!("{:x}", Sha1::digest(b"smoke:abc"));
        assert_eq!(bug_id(SuiteKind::Smoke, "abc"), &expected[..12]);
    }

    #[test]
    fn bug_id_ignores_whitespace_noise() {
        assert_eq!(
            bug_id(SuiteKind::Regression, "  Cart   total  wrong "),
            bug_id(SuiteKind::Regression, "Cart total wrong")
        );
    }

    #[test]
    fn bug_id_depends_on_suite_and_title() {
        let base = bug_id(SuiteKind::Smoke, "Checkout fails");
        assert_ne!(base, bug_id(SuiteKind::Regression, "Checkout fails"));
        assert_ne!(base, bug_id(SuiteKind::Smoke, "Checkout fails twice"));
    }

    #[test]
    fn empty_title_gets_placeholder() {
        assert_eq!(
            normalize_title("   ", SuiteKind::Smoke),
            "UI test failure (smoke)"
        );
    }

    #[test]
    fn severity_aliases_collapse_into_taxonomy() {
        assert_eq!(Severity::normalize("BLOCKER"), Severity::Blocker);
        assert_eq!(Severity::normalize("high"), Severity::Critical);
        assert_eq!(Severity::normalize("critical"), Severity::Critical);
        assert_eq!(Severity::normalize("medium"), Severity::Major);
        assert_eq!(Severity::normalize("low"), Severity::Minor);
        assert_eq!(Severity::normalize("catastrophic"), Severity::Major);
        assert_eq!(Severity::normalize(""), Severity::Major);
    }

    #[test]
    fn from_raw_flattens_lists_and_defaults_confidence() {
        let raw: RawBug = serde_json::from_value(serde_json::json!({
            "title": "Search returns nothing",
            "severity": "high",
            "repro_steps": ["open /", "type query", "press enter"],
            "expected": "results",
            "actual": "empty list",
            "evidence_paths": ["a/trace.zip", "a/shot.PNG", "a/video.webm", "a/b.png"],
            "suggested_fix": "check the search endpoint",
            "component_guess": "src/search.tsx"
        }))
        .unwrap_or_else(|e| panic!("{e}"));

        let bug = BugRecord::from_raw(raw, "run-1", SuiteKind::Smoke, Utc::now());
        assert_eq!(bug.severity, Severity::Critical);
        assert_eq!(bug.repro_steps, "open /\ntype query\npress enter");
        assert_eq!(bug.trace_path, "a/trace.zip");
        assert_eq!(bug.screenshot_path, "a/shot.PNG\na/b.png");
        assert_eq!(bug.video_path, "a/video.webm");
        assert_eq!(bug.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(bug.root_cause_guess, "check the search endpoint");
        assert_eq!(bug.code_location_guess, "src/search.tsx");
        assert_eq!(bug.bug_id, bug_id(SuiteKind::Smoke, "Search returns nothing"));
        assert_eq!(bug.evidence_paths().count(), 4);
    }

    #[test]
    fn unrecognized_evidence_goes_with_traces() {
        let raw = RawBug {
            title: "x".to_string(),
            evidence_paths: vec![
                "out/console.txt".to_string(),
                "out/trace.zip".to_string(),
                "out/step.jpeg".to_string(),
            ],
            ..Default::default()
        };
        let bug = BugRecord::from_raw(raw, "run-1", SuiteKind::Smoke, Utc::now());
        assert_eq!(bug.trace_path, "out/console.txt\nout/trace.zip");
        assert_eq!(bug.screenshot_path, "out/step.jpeg");
        assert_eq!(bug.video_path, "");
    }

    #[test]
    fn from_raw_accepts_text_fields_and_nulls() {
        let raw: RawBug = serde_json::from_value(serde_json::json!({
            "title": "x",
            "repro_steps": "single step",
            "evidence_paths": null,
            "confidence": 140.0,
            "suite": "Regression"
        }))
        .unwrap_or_else(|e| panic!("{e}"));

        let bug = BugRecord::from_raw(raw, "run-1", SuiteKind::Smoke, Utc::now());
        assert_eq!(bug.suite, SuiteKind::Regression);
        assert_eq!(bug.repro_steps, "single step");
        assert_eq!(bug.evidence_paths().count(), 0);
        assert_eq!(bug.confidence, 100);
    }
}
