//! Run record and its lifecycle state machine.
//!
//! A run moves `queued → running → {succeeded, failed}`. `cancelled` is
//! reachable only from `queued` and only from outside the orchestrator.
//! `finished_at` is set exactly when the status becomes terminal.

use std::fmt;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Persisted and enqueued, waiting for a consumer.
    Queued,
    /// Claimed by a consumer; the orchestrator owns the record.
    Running,
    Succeeded,
    Failed,
    /// Withdrawn before any consumer claimed it.
    Cancelled,
}

impl RunStatus {
    /// Whether this is a terminal state (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named group of browser tests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SuiteKind {
    Smoke,
    Regression,
}

impl SuiteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SuiteKind::Smoke => "smoke",
            SuiteKind::Regression => "regression",
        }
    }

    /// Capitalized form used in issue titles.
    pub fn title(self) -> &'static str {
        match self {
            SuiteKind::Smoke => "Smoke",
            SuiteKind::Regression => "Regression",
        }
    }
}

impl fmt::Display for SuiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which suites a run executes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuiteSelection {
    Smoke,
    Regression,
    #[default]
    Both,
}

impl SuiteSelection {
    /// Suites in execution order.
    pub fn suites(self) -> Vec<SuiteKind> {
        match self {
            SuiteSelection::Smoke => vec![SuiteKind::Smoke],
            SuiteSelection::Regression => vec![SuiteKind::Regression],
            SuiteSelection::Both => vec![SuiteKind::Smoke, SuiteKind::Regression],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid run transition: {from} -> {to}")]
    Invalid { from: RunStatus, to: RunStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error("repo_url must not be empty")]
    EmptyRepoUrl,

    #[error("branch must not be empty")]
    EmptyBranch,

    #[error("{field} must not start with '-', got {value:?}")]
    OptionLike { field: &'static str, value: String },

    #[error("{field} must be a relative path inside the repository, got {value:?}")]
    OutsideRepository { field: &'static str, value: String },
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_dir() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

/// Caller-supplied parameters for a new run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSubmission {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Application directory, relative to the repository root.
    #[serde(default = "default_dir")]
    pub app_dir: String,
    /// UI directory, relative to the repository root.
    #[serde(default = "default_dir")]
    pub ui_dir: String,
    #[serde(default)]
    pub suite: SuiteSelection,
    #[serde(default = "default_true")]
    pub create_issues: bool,
    #[serde(default)]
    pub commit_results: bool,
}

impl RunSubmission {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: default_branch(),
            app_dir: default_dir(),
            ui_dir: default_dir(),
            suite: SuiteSelection::default(),
            create_issues: true,
            commit_results: false,
        }
    }

    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.repo_url.trim().is_empty() {
            return Err(SubmissionError::EmptyRepoUrl);
        }
        if self.branch.trim().is_empty() {
            return Err(SubmissionError::EmptyBranch);
        }
        // Both end up as git arguments.
        for (field, value) in [("repo_url", &self.repo_url), ("branch", &self.branch)] {
            if value.trim_start().starts_with('-') {
                return Err(SubmissionError::OptionLike {
                    field,
                    value: value.clone(),
                });
            }
        }
        check_relative("app_dir", &self.app_dir)?;
        check_relative("ui_dir", &self.ui_dir)?;
        Ok(())
    }
}

fn check_relative(field: &'static str, value: &str) -> Result<(), SubmissionError> {
    let escapes = Path::new(value)
        .components()
        .any(|c| matches!(c, Component::RootDir | Component::Prefix(_) | Component::ParentDir));
    if escapes {
        return Err(SubmissionError::OutsideRepository {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Outcome of one suite execution as recorded in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuiteOutcome {
    pub suite: SuiteKind,
    pub ok: bool,
    pub exit_code: i32,
}

/// Terminal summary of a succeeded run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub suites: Vec<SuiteOutcome>,
    pub bugs: usize,
    #[serde(default)]
    pub issues_created: usize,
}

/// Persisted run record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub schema_version: String,
    pub id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub repo_url: String,
    pub branch: String,
    pub app_dir: String,
    pub ui_dir: String,
    pub suite: SuiteSelection,
    pub create_issues: bool,
    pub commit_results: bool,
    /// Head commit of the clone, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub const SCHEMA_VERSION: &'static str = "uiqa_run@1.0";

    /// Create a queued run with a fresh id.
    pub fn new(submission: RunSubmission) -> Result<Self, SubmissionError> {
        submission.validate()?;
        Ok(Self {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            repo_url: submission.repo_url.trim().to_string(),
            branch: submission.branch.trim().to_string(),
            app_dir: submission.app_dir,
            ui_dir: submission.ui_dir,
            suite: submission.suite,
            create_issues: submission.create_issues,
            commit_results: submission.commit_results,
            commit_sha: None,
            summary: None,
            error: None,
        })
    }

    /// `queued → running`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Queued, RunStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// `running → succeeded`.
    pub fn succeed(
        &mut self,
        summary: RunSummary,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running, RunStatus::Succeeded)?;
        self.summary = Some(summary);
        self.finished_at = Some(now);
        Ok(())
    }

    /// `running → failed`.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running, RunStatus::Failed)?;
        self.error = Some(error);
        self.finished_at = Some(now);
        Ok(())
    }

    /// `queued → cancelled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Queued, RunStatus::Cancelled)?;
        self.finished_at = Some(now);
        Ok(())
    }

    fn transition(&mut self, from: RunStatus, to: RunStatus) -> Result<(), TransitionError> {
        if self.status != from {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn queued() -> RunRecord {
        RunRecord::new(RunSubmission::new("https://github.com/acme/shop"))
            .unwrap_or_else(|e| panic!("valid submission: {e}"))
    }

    fn assert_finished_iff_terminal(run: &RunRecord) {
        assert_eq!(
            run.finished_at.is_some(),
            run.status.is_terminal(),
            "finished_at must track terminal status for {}",
            run.status
        );
    }

    #[test]
    fn new_run_is_queued_without_timestamps() {
        let run = queued();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.branch, "main");
        assert_eq!(run.suite, SuiteSelection::Both);
        assert!(run.create_issues);
        assert!(!run.commit_results);
        assert!(run.started_at.is_none());
        assert_finished_iff_terminal(&run);
    }

    #[test]
    fn success_path_sets_timestamps() {
        let mut run = queued();
        let now = Utc::now();
        run.start(now).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(run.started_at, Some(now));
        assert_finished_iff_terminal(&run);

        run.succeed(RunSummary::default(), now)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.summary, Some(RunSummary::default()));
        assert_finished_iff_terminal(&run);
    }

    #[test]
    fn failure_records_error() {
        let mut run = queued();
        run.start(Utc::now()).unwrap_or_else(|e| panic!("{e}"));
        run.fail("boom".to_string(), Utc::now())
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert_finished_iff_terminal(&run);
    }

    #[test]
    fn terminal_runs_reject_every_transition() {
        let mut run = queued();
        run.start(Utc::now()).unwrap_or_else(|e| panic!("{e}"));
        run.succeed(RunSummary::default(), Utc::now())
            .unwrap_or_else(|e| panic!("{e}"));

        assert!(run.start(Utc::now()).is_err());
        assert!(run.fail("late".to_string(), Utc::now()).is_err());
        assert!(run.cancel(Utc::now()).is_err());
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.error.is_none());
    }

    #[test]
    fn queued_cannot_skip_running() {
        let mut run = queued();
        let err = run
            .succeed(RunSummary::default(), Utc::now())
            .expect_err("queued -> succeeded must be rejected");
        assert_eq!(
            err,
            TransitionError::Invalid {
                from: RunStatus::Queued,
                to: RunStatus::Succeeded
            }
        );
        assert!(run.fail("x".to_string(), Utc::now()).is_err());
        assert_finished_iff_terminal(&run);
    }

    #[test]
    fn cancel_only_from_queued() {
        let mut run = queued();
        run.cancel(Utc::now()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_finished_iff_terminal(&run);

        let mut running = queued();
        running.start(Utc::now()).unwrap_or_else(|e| panic!("{e}"));
        assert!(running.cancel(Utc::now()).is_err());
    }

    #[test]
    fn submission_rejects_paths_outside_repo() {
        let mut sub = RunSubmission::new("https://github.com/acme/shop");
        sub.ui_dir = "../elsewhere".to_string();
        assert_eq!(
            sub.validate(),
            Err(SubmissionError::OutsideRepository {
                field: "ui_dir",
                value: "../elsewhere".to_string()
            })
        );

        sub.ui_dir = "/etc".to_string();
        assert!(sub.validate().is_err());

        sub.ui_dir = "apps/web".to_string();
        assert_eq!(sub.validate(), Ok(()));
    }

    #[test]
    fn submission_requires_repo_and_branch() {
        assert_eq!(
            RunSubmission::new("  ").validate(),
            Err(SubmissionError::EmptyRepoUrl)
        );
        let mut sub = RunSubmission::new("https://example.com/r.git");
        sub.branch = String::new();
        assert_eq!(sub.validate(), Err(SubmissionError::EmptyBranch));
    }

    #[test]
    fn submission_rejects_option_like_git_arguments() {
        let sub = RunSubmission::new("--upload-pack=touch /tmp/pwned");
        assert_eq!(
            sub.validate(),
            Err(SubmissionError::OptionLike {
                field: "repo_url",
                value: "--upload-pack=touch /tmp/pwned".to_string(),
            })
        );
        let mut sub = RunSubmission::new("https://example.com/r.git");
        sub.branch = "-b".to_string();
        assert!(matches!(
            sub.validate(),
            Err(SubmissionError::OptionLike { field: "branch", .. })
        ));
    }

    #[test]
    fn submission_defaults_from_minimal_json() {
        let sub: RunSubmission =
            serde_json::from_str(r#"{"repo_url":"https://github.com/acme/shop","suite":"smoke"}"#)
                .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(sub.branch, "main");
        assert_eq!(sub.app_dir, ".");
        assert_eq!(sub.suite, SuiteSelection::Smoke);
        assert!(sub.create_issues);
        assert!(!sub.commit_results);
    }

    #[test]
    fn selection_expands_in_execution_order() {
        assert_eq!(
            SuiteSelection::Both.suites(),
            vec![SuiteKind::Smoke, SuiteKind::Regression]
        );
        assert_eq!(SuiteSelection::Regression.suites(), vec![SuiteKind::Regression]);
    }
}
