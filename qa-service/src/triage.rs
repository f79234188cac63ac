//! Triage Engine: turn a failed suite's output into bug records.
//!
//! The primary path asks the analysis collaborator to read the suite's
//! structured report. Any failure there, or an empty answer, degrades to
//! the deterministic report walker; triage never fails a run.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uiqa_core::qa::{BugRecord, RawBug, SuiteKind};

use crate::analysis::AnalysisCollaborator;
use crate::runner::SuiteResult;

const MAX_TITLE_CHARS: usize = 200;
const MAX_ACTUAL_CHARS: usize = 500;
const FALLBACK_EXPECTED: &str = "Test should pass";
const FALLBACK_FIX: &str = "Review the test failure and fix the underlying issue";

/// Which path produced the bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageSource {
    Analysis,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct TriageOutcome {
    pub bugs: Vec<BugRecord>,
    pub source: TriageSource,
    /// Why the primary path was abandoned, if it was.
    pub fallback_reason: Option<String>,
}

pub struct TriageEngine {
    analysis: Arc<dyn AnalysisCollaborator>,
}

impl TriageEngine {
    pub fn new(analysis: Arc<dyn AnalysisCollaborator>) -> Self {
        Self { analysis }
    }

    pub async fn triage(
        &self,
        run_id: &str,
        repo_root: &Path,
        result: &SuiteResult,
    ) -> TriageOutcome {
        let now = Utc::now();
        let primary = self
            .analysis
            .triage_failures(repo_root, &result.results_path)
            .await;

        let (raw, source, fallback_reason) = match primary {
            Ok(response) if !response.bugs.is_empty() => {
                (response.bugs, TriageSource::Analysis, None)
            }
            Ok(_) => (
                extract_bugs_from_report(&result.results_path, result.suite),
                TriageSource::Fallback,
                Some("analysis returned no bugs".to_string()),
            ),
            Err(e) => {
                tracing::warn!(run_id, suite = %result.suite, "analysis triage failed: {e}");
                (
                    extract_bugs_from_report(&result.results_path, result.suite),
                    TriageSource::Fallback,
                    Some(e.to_string()),
                )
            }
        };

        let bugs = raw
            .into_iter()
            .map(|bug| BugRecord::from_raw(bug, run_id, result.suite, now))
            .collect();
        TriageOutcome {
            bugs,
            source,
            fallback_reason,
        }
    }
}

/// Fallback extractor over a report file. Unreadable or malformed reports
/// yield no bugs.
pub fn extract_bugs_from_report(path: &Path, suite: SuiteKind) -> Vec<RawBug> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path.display(), "report unreadable: {e}");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(report) => extract_bugs(&report, suite),
        Err(e) => {
            tracing::warn!(path = %path.display(), "report is not JSON: {e}");
            Vec::new()
        }
    }
}

/// Walk `suites → specs → tests → results`, recursing into nested suites,
/// and emit one bug per failed or timed-out result.
pub fn extract_bugs(report: &Value, suite: SuiteKind) -> Vec<RawBug> {
    let mut bugs = Vec::new();
    for node in array(report, "suites") {
        walk_suite(node, suite, &mut bugs);
    }
    bugs
}

fn walk_suite(node: &Value, suite: SuiteKind, bugs: &mut Vec<RawBug>) {
    for spec in array(node, "specs") {
        for test in array(spec, "tests") {
            for result in array(test, "results") {
                let status = str_field(result, "status").unwrap_or("failed");
                if matches!(status, "failed" | "timedOut") {
                    bugs.push(bug_from_result(spec, test, result, status, suite));
                }
            }
        }
    }
    for child in array(node, "suites") {
        walk_suite(child, suite, bugs);
    }
}

fn bug_from_result(
    spec: &Value,
    test: &Value,
    result: &Value,
    status: &str,
    suite: SuiteKind,
) -> RawBug {
    let spec_title = str_field(spec, "title").unwrap_or("Unknown test");
    let title = match str_field(test, "title").filter(|t| !t.is_empty()) {
        Some(test_title) => format!("{spec_title} - {test_title}"),
        None => spec_title.to_string(),
    };
    let title = truncate(&title, MAX_TITLE_CHARS);

    let message = result
        .get("error")
        .and_then(|e| str_field(e, "message"))
        .filter(|m| !m.is_empty())
        .or_else(|| {
            array(result, "errors")
                .first()
                .and_then(|e| str_field(e, "message"))
                .filter(|m| !m.is_empty())
        });
    let actual = match message {
        Some(message) => truncate(message, MAX_ACTUAL_CHARS),
        None => format!("Test {status}"),
    };

    let file = str_field(spec, "file").unwrap_or_default();
    let mut repro_steps = vec![format!("Run test: {title}")];
    if !file.is_empty() {
        let location = match spec.get("line").and_then(Value::as_u64) {
            Some(line) => format!("{file}:{line}"),
            None => file.to_string(),
        };
        repro_steps.push(format!("Spec: {location}"));
    }

    RawBug {
        title,
        severity: Some("major".to_string()),
        suite: Some(suite.to_string()),
        repro_steps,
        expected: Some(FALLBACK_EXPECTED.to_string()),
        actual: Some(actual),
        evidence_paths: array(result, "attachments")
            .iter()
            .filter_map(|a| str_field(a, "path"))
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        suggested_fix: Some(FALLBACK_FIX.to_string()),
        component_guess: Some(file.to_string()),
        ..RawBug::default()
    }
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        AnalysisError, AnalysisRequest, GeneratedTests, GenerationRequest, RepoAnalysis,
        TriageResponse,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use uiqa_core::qa::Severity;

    fn result(status: &str, title: &str) -> Value {
        json!({"title": title, "file": "auth.spec.ts", "line": 12, "tests": [
            {"title": "chromium", "results": [{"status": status,
                "error": {"message": "expected 'Invalid password' to be visible"},
                "attachments": [{"path": "test-results/a/trace.zip"}, {"path": "test-results/a/shot.png"}]}]}
        ]})
    }

    fn report() -> Value {
        json!({"suites": [
            {"title": "auth.spec.ts", "specs": [result("failed", "Login"), result("passed", "Logout")],
             "suites": [{"title": "nested", "specs": [result("timedOut", "Signup"), result("skipped", "Reset")]}]},
            {"title": "cart.spec.ts", "specs": [result("passed", "Add item")]}
        ]})
    }

    #[test]
    fn emits_one_bug_per_failed_or_timed_out_result() {
        let bugs = extract_bugs(&report(), SuiteKind::Smoke);
        let titles: Vec<_> = bugs.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["Login - chromium", "Signup - chromium"]);
    }

    #[test]
    fn fallback_fields() {
        let bug = &extract_bugs(&report(), SuiteKind::Regression)[0];
        assert_eq!(bug.severity.as_deref(), Some("major"));
        assert_eq!(bug.expected.as_deref(), Some("Test should pass"));
        assert_eq!(
            bug.actual.as_deref(),
            Some("expected 'Invalid password' to be visible")
        );
        assert_eq!(bug.component_guess.as_deref(), Some("auth.spec.ts"));
        assert_eq!(bug.evidence_paths.len(), 2);
        assert_eq!(bug.repro_steps[1], "Spec: auth.spec.ts:12");
    }

    #[test]
    fn errors_list_and_status_fallbacks() {
        let report = json!({"suites": [{"specs": [
            {"title": "A", "tests": [{"results": [{"status": "failed", "errors": [{"message": "boom"}]}]}]},
            {"title": "B", "tests": [{"results": [{"status": "timedOut"}]}]}
        ]}]});
        let bugs = extract_bugs(&report, SuiteKind::Smoke);
        assert_eq!(bugs[0].actual.as_deref(), Some("boom"));
        assert_eq!(bugs[1].actual.as_deref(), Some("Test timedOut"));
        assert_eq!(bugs[1].title, "B");
    }

    #[test]
    fn long_text_is_truncated() {
        let long = "x".repeat(800);
        let report = json!({"suites": [{"specs": [{"title": long, "tests": [
            {"results": [{"status": "failed", "error": {"message": long}}]}]}]}]});
        let bug = &extract_bugs(&report, SuiteKind::Smoke)[0];
        assert_eq!(bug.title.chars().count(), 200);
        assert_eq!(bug.actual.as_deref().map(str::len), Some(500));
    }

    #[test]
    fn missing_report_yields_nothing() {
        assert!(extract_bugs_from_report(Path::new("/nonexistent/report.json"), SuiteKind::Smoke).is_empty());
    }

    struct ScriptedTriage(Result<Vec<RawBug>, ()>);

    #[async_trait]
    impl AnalysisCollaborator for ScriptedTriage {
        async fn analyze_repo(&self, _: &AnalysisRequest<'_>) -> Result<RepoAnalysis, AnalysisError> {
            Ok(RepoAnalysis::default())
        }
        async fn generate_tests(
            &self,
            _: &GenerationRequest<'_>,
        ) -> Result<GeneratedTests, AnalysisError> {
            Ok(GeneratedTests::default())
        }
        async fn triage_failures(&self, _: &Path, _: &Path) -> Result<TriageResponse, AnalysisError> {
            match &self.0 {
                Ok(bugs) => Ok(TriageResponse { bugs: bugs.clone() }),
                Err(()) => Err(AnalysisError::TimedOut {
                    operation: "triage_failures",
                    timeout_secs: 900,
                }),
            }
        }
    }

    fn failed_suite(dir: &Path) -> SuiteResult {
        let results_path = dir.join("playwright.smoke.results.json");
        std::fs::write(&results_path, report().to_string()).unwrap();
        SuiteResult {
            suite: SuiteKind::Smoke,
            ok: false,
            results_path,
            stdout_path: dir.join("out"),
            stderr_path: dir.join("err"),
            exit_code: 1,
        }
    }

    #[tokio::test]
    async fn analysis_failure_falls_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = TriageEngine::new(Arc::new(ScriptedTriage(Err(()))));
        let outcome = engine.triage("run-1", tmp.path(), &failed_suite(tmp.path())).await;
        assert_eq!(outcome.source, TriageSource::Fallback);
        assert!(outcome.fallback_reason.unwrap().contains("timed out"));
        assert_eq!(outcome.bugs.len(), 2);
        assert!(outcome.bugs.iter().all(|b| b.severity == Severity::Major));
    }

    #[tokio::test]
    async fn empty_analysis_answer_falls_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = TriageEngine::new(Arc::new(ScriptedTriage(Ok(Vec::new()))));
        let outcome = engine.triage("run-1", tmp.path(), &failed_suite(tmp.path())).await;
        assert_eq!(outcome.source, TriageSource::Fallback);
        assert_eq!(outcome.bugs.len(), 2);
    }

    #[tokio::test]
    async fn analysis_bugs_are_normalized() {
        let tmp = tempfile::TempDir::new().unwrap();
        let raw = RawBug {
            title: "  Checkout   button unresponsive ".to_string(),
            severity: Some("High".to_string()),
            ..RawBug::default()
        };
        let engine = TriageEngine::new(Arc::new(ScriptedTriage(Ok(vec![raw]))));
        let outcome = engine.triage("run-1", tmp.path(), &failed_suite(tmp.path())).await;
        assert_eq!(outcome.source, TriageSource::Analysis);
        let bug = &outcome.bugs[0];
        assert_eq!(bug.title, "Checkout button unresponsive");
        assert_eq!(bug.severity, Severity::Critical);
        assert_eq!(bug.confidence, 70);
        assert_eq!(bug.run_id, "run-1");
    }

    #[tokio::test]
    async fn fallback_ids_are_deterministic() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = TriageEngine::new(Arc::new(ScriptedTriage(Err(()))));
        let suite = failed_suite(tmp.path());
        let first = engine.triage("run-1", tmp.path(), &suite).await;
        let second = engine.triage("run-2", tmp.path(), &suite).await;
        let ids = |o: &TriageOutcome| o.bugs.iter().map(|b| b.bug_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_ne!(first.bugs[0].bug_id, first.bugs[1].bug_id);
    }
}
