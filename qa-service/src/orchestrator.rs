//! Run Orchestrator: drives one run from `queued` to a terminal state.
//!
//! Steps run sequentially; each reports `started`/`finished` on the event
//! sink. Any error or panic inside a step ends the run as `failed`; a run
//! is never left `running` by this module.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use uiqa_core::events::{EventSink, LogLevel, RunEvent};
use uiqa_core::qa::{
    ArtifactKind, ArtifactRecord, BugRecord, RunRecord, RunStatus, RunSummary, SuiteOutcome,
};

use crate::analysis::{
    AnalysisCollaborator, AnalysisRequest, ClaudeCodeAdapter, GenerationRequest, read_contract,
};
use crate::config::ServiceConfig;
use crate::export;
use crate::fetch::{FetchError, GitFetcher, RepoFetcher};
use crate::issues::{GitHubIssueTracker, IssueTracker};
use crate::persistence::{PersistenceError, RunStore};
use crate::process::tail_excerpt;
use crate::runner::{PlaywrightRunner, RunnerError, SuiteExecutor, SuiteRequest, SuiteResult};
use crate::triage::{TriageEngine, TriageSource};

pub const STEP_CLONE: &str = "clone_repo";
pub const STEP_ANALYZE: &str = "analyze_repo";
pub const STEP_GENERATE: &str = "generate_tests_docs";
pub const STEP_TRIAGE: &str = "triage";
pub const STEP_PERSIST: &str = "persist";
pub const STEP_ISSUES: &str = "github_issues";
pub const STEP_DONE: &str = "done";
/// Step tag on the error-level log of a failed run.
pub const STEP_ERROR: &str = "error";

const STDERR_EXCERPT_CHARS: usize = 2000;

/// Why a run failed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// An external command exited non-zero.
    #[error("Command failed: {command} (exit {exit_code})")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{what} timed out after {timeout_secs}s")]
    TimedOut { what: String, timeout_secs: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RunError {
    /// Text recorded as the run's `error`.
    pub fn describe(&self) -> String {
        match self {
            RunError::Command { stderr, .. } if !stderr.trim().is_empty() => {
                format!("{self}\n\n{}", tail_excerpt(stderr, STDERR_EXCERPT_CHARS))
            }
            RunError::Command { .. } | RunError::TimedOut { .. } => self.to_string(),
            RunError::Internal(e) => format!("{e}\n\nDiagnostics:\n{e:?}"),
        }
    }
}

impl From<FetchError> for RunError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => RunError::Command {
                command,
                exit_code,
                stderr,
            },
            FetchError::TimedOut {
                command,
                timeout_secs,
            } => RunError::TimedOut {
                what: command,
                timeout_secs,
            },
            other => RunError::Internal(anyhow::Error::new(other).context("Repository clone failed")),
        }
    }
}

impl From<RunnerError> for RunError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::InstallFailed {
                command,
                exit_code,
                stderr_path,
                ..
            } => RunError::Command {
                command,
                exit_code,
                stderr: std::fs::read_to_string(&stderr_path).unwrap_or_default(),
            },
            RunnerError::InstallTimedOut {
                command,
                timeout_secs,
                ..
            } => RunError::TimedOut {
                what: format!("Dependency install `{command}`"),
                timeout_secs,
            },
            RunnerError::NotReady {
                base_url,
                timeout_secs,
                ..
            } => RunError::TimedOut {
                what: format!("Readiness probe for {base_url}"),
                timeout_secs,
            },
            other => RunError::Internal(anyhow::Error::new(other).context("Suite execution failed")),
        }
    }
}

impl From<PersistenceError> for RunError {
    fn from(e: PersistenceError) -> Self {
        RunError::Internal(anyhow::Error::new(e))
    }
}

/// External collaborators, injectable for tests.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn RepoFetcher>,
    pub analysis: Arc<dyn AnalysisCollaborator>,
    pub executor: Arc<dyn SuiteExecutor>,
    pub issues: Arc<dyn IssueTracker>,
}

impl Collaborators {
    /// Production wiring from configuration.
    pub fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            fetcher: Arc::new(GitFetcher::new(&config.clone)),
            analysis: Arc::new(ClaudeCodeAdapter::new(config.analysis.clone())),
            executor: Arc::new(
                PlaywrightRunner::new(config.runner.clone()).context("build suite runner")?,
            ),
            issues: Arc::new(
                GitHubIssueTracker::new(&config.github).context("build issue tracker")?,
            ),
        })
    }
}

/// Per-run filesystem locations.
struct RunPaths {
    scratch: PathBuf,
    repo: PathBuf,
    artifacts: PathBuf,
}

pub struct RunOrchestrator {
    store: Arc<RunStore>,
    events: Arc<dyn EventSink>,
    collaborators: Collaborators,
    triage: TriageEngine,
    artifacts_root: PathBuf,
    work_root: PathBuf,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<RunStore>,
        events: Arc<dyn EventSink>,
        collaborators: Collaborators,
        artifacts_root: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        let triage = TriageEngine::new(Arc::clone(&collaborators.analysis));
        Self {
            store,
            events,
            collaborators,
            triage,
            artifacts_root: artifacts_root.into(),
            work_root: work_root.into(),
        }
    }

    /// Production wiring: configured collaborators and directories.
    pub fn from_config(
        config: &ServiceConfig,
        store: Arc<RunStore>,
        events: Arc<dyn EventSink>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(
            store,
            events,
            Collaborators::from_config(config)?,
            config.artifacts_dir.clone(),
            config.work_dir.clone(),
        ))
    }

    fn paths(&self, run_id: &str) -> RunPaths {
        let scratch = self.work_root.join(format!("uiqa-work-{run_id}"));
        RunPaths {
            repo: scratch.join("repo"),
            scratch,
            artifacts: self.artifacts_root.join(run_id),
        }
    }

    fn started(&self, run_id: &str, step: &str) {
        self.events.publish(run_id, RunEvent::started(step));
    }

    fn finished(&self, run_id: &str, step: &str, extra: Option<serde_json::Value>) {
        self.events.publish(run_id, RunEvent::finished(step, extra));
    }

    fn log(&self, run_id: &str, level: LogLevel, step: &str, message: impl Into<String>) {
        self.events
            .publish(run_id, RunEvent::log(level, Some(step), message));
    }

    /// Process one run to a terminal state.
    ///
    /// Terminal runs are left untouched. A run already `running` was
    /// abandoned by an earlier consumer and is failed, not re-entered.
    /// Callers must ensure at most one concurrent `process` per run id.
    pub async fn process(&self, run_id: &str) -> Result<RunStatus, PersistenceError> {
        let mut run = self.store.read_run(run_id)?;
        let paths = self.paths(run_id);

        match run.status {
            status if status.is_terminal() => {
                tracing::debug!(run_id, %status, "run already terminal");
                return Ok(status);
            }
            RunStatus::Running => {
                tracing::warn!(run_id, "found abandoned running run");
                let error = "Run was interrupted before completion (consumer restarted)";
                run.fail(error.to_string(), Utc::now())?;
                return self.finish(run, Some(error.to_string()), &paths);
            }
            _ => {}
        }

        run.start(Utc::now())?;
        self.store.write_run(&run)?;
        tracing::info!(run_id, repo = %run.repo_url, branch = %run.branch, "run started");

        let outcome = AssertUnwindSafe(self.execute(&mut run, &paths))
            .catch_unwind()
            .await;
        let (result, error) = match outcome {
            Ok(Ok(summary)) => (run.succeed(summary, Utc::now()), None),
            Ok(Err(e)) => {
                let description = e.describe();
                (run.fail(description.clone(), Utc::now()), Some(description))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let description = format!("Internal error: step panicked: {message}");
                (run.fail(description.clone(), Utc::now()), Some(description))
            }
        };
        result?;
        self.finish(run, error, &paths)
    }

    /// Persist the terminal record, emit terminal events, drop the scratch.
    fn finish(
        &self,
        run: RunRecord,
        error: Option<String>,
        paths: &RunPaths,
    ) -> Result<RunStatus, PersistenceError> {
        let write = match self.store.write_run(&run) {
            // Another consumer already settled this run; its outcome stands.
            Err(PersistenceError::Transition(e)) => {
                remove_scratch(&paths.scratch);
                let stored = self.store.read_run(&run.id)?;
                tracing::warn!(
                    run_id = %run.id,
                    stored = %stored.status,
                    "run already finished elsewhere, discarding this outcome: {e}"
                );
                return Ok(stored.status);
            }
            write => write,
        };
        if let Some(error) = &error {
            tracing::error!(run_id = %run.id, "run failed: {error}");
            self.log(&run.id, LogLevel::Error, STEP_ERROR, error.clone());
        } else {
            tracing::info!(run_id = %run.id, "run succeeded");
        }
        self.finished(
            &run.id,
            STEP_DONE,
            Some(json!({ "status": run.status.as_str() })),
        );
        remove_scratch(&paths.scratch);
        write?;
        Ok(run.status)
    }

    async fn execute(
        &self,
        run: &mut RunRecord,
        paths: &RunPaths,
    ) -> Result<RunSummary, RunError> {
        let run_id = run.id.clone();
        let run_id = run_id.as_str();

        remove_scratch(&paths.scratch);
        std::fs::create_dir_all(&paths.scratch).context("create scratch directory")?;
        std::fs::create_dir_all(&paths.artifacts).context("create artifacts directory")?;

        // ── clone ────────────────────────────────────────────────────────
        self.started(run_id, STEP_CLONE);
        self.log(
            run_id,
            LogLevel::Info,
            STEP_CLONE,
            format!("Cloning {} (branch {})...", run.repo_url, run.branch),
        );
        let fetched = self
            .collaborators
            .fetcher
            .fetch(&run.repo_url, &run.branch, &paths.repo)
            .await?;
        if let Some(sha) = fetched.commit_sha {
            run.commit_sha = Some(sha);
            self.store.write_run(run)?;
        }
        self.finished(run_id, STEP_CLONE, None);

        // ── analyze ──────────────────────────────────────────────────────
        self.started(run_id, STEP_ANALYZE);
        let request = AnalysisRequest {
            repo_root: &paths.repo,
            app_dir: &run.app_dir,
            ui_dir: &run.ui_dir,
            contract: read_contract(&paths.repo),
        };
        let analysis = self
            .collaborators
            .analysis
            .analyze_repo(&request)
            .await
            .context("Repository analysis failed")?;
        self.log(
            run_id,
            LogLevel::Info,
            STEP_ANALYZE,
            format!(
                "Detected start: {}; {} workflow(s)",
                serde_json::to_string(&analysis.start).unwrap_or_default(),
                analysis.workflows.len()
            ),
        );
        self.finished(run_id, STEP_ANALYZE, None);

        // ── generate tests ───────────────────────────────────────────────
        self.started(run_id, STEP_GENERATE);
        let generated = self
            .collaborators
            .analysis
            .generate_tests(&GenerationRequest {
                repo_root: &paths.repo,
                ui_dir: &run.ui_dir,
                workflows: &analysis.workflows,
                selector_strategy: analysis.selector_strategy(),
            })
            .await
            .context("Test generation failed")?;
        self.log(
            run_id,
            LogLevel::Info,
            STEP_GENERATE,
            format!("Generated files: {}", generated.created.files.len()),
        );
        self.finished(run_id, STEP_GENERATE, None);

        // ── suites ───────────────────────────────────────────────────────
        let suite_request = SuiteRequest {
            run_id: run_id.to_string(),
            repo_root: paths.repo.clone(),
            ui_dir: run.ui_dir.clone(),
            artifacts_dir: paths.artifacts.clone(),
        };
        let mut results: Vec<SuiteResult> = Vec::new();
        for suite in run.suite.suites() {
            let step = format!("run_{suite}");
            self.started(run_id, &step);
            let result = self
                .collaborators
                .executor
                .run_suite(&suite_request, suite)
                .await?;
            tracing::info!(run_id, %suite, ok = result.ok, exit_code = result.exit_code, "suite finished");
            self.finished(
                run_id,
                &step,
                Some(json!({ "ok": result.ok, "exit_code": result.exit_code })),
            );
            results.push(result);
        }

        // ── triage ───────────────────────────────────────────────────────
        self.started(run_id, STEP_TRIAGE);
        let mut bugs: Vec<BugRecord> = Vec::new();
        for result in results.iter().filter(|r| !r.ok) {
            let outcome = self.triage.triage(run_id, &paths.repo, result).await;
            if let Some(reason) = &outcome.fallback_reason {
                self.log(
                    run_id,
                    LogLevel::Warning,
                    STEP_TRIAGE,
                    format!("Analysis triage unavailable for {}: {reason}", result.suite),
                );
            }
            if outcome.source == TriageSource::Fallback {
                self.log(
                    run_id,
                    LogLevel::Info,
                    STEP_TRIAGE,
                    format!("Using fallback bug extraction for {}", result.suite),
                );
            }
            bugs.extend(outcome.bugs);
        }
        self.log(
            run_id,
            LogLevel::Info,
            STEP_TRIAGE,
            format!("Triage produced {} bugs.", bugs.len()),
        );
        self.finished(run_id, STEP_TRIAGE, Some(json!({ "bugs": bugs.len() })));

        // ── persist ──────────────────────────────────────────────────────
        self.started(run_id, STEP_PERSIST);
        let artifacts = self.persist(run_id, &bugs, &results, &paths.artifacts)?;
        self.finished(run_id, STEP_PERSIST, Some(json!({ "artifacts": artifacts })));

        // ── issues ───────────────────────────────────────────────────────
        let mut issues_created = 0;
        if run.create_issues && !bugs.is_empty() {
            self.started(run_id, STEP_ISSUES);
            issues_created = self.file_issues(run_id, &run.repo_url, &bugs).await;
            self.finished(
                run_id,
                STEP_ISSUES,
                Some(json!({ "issues_created": issues_created })),
            );
        }

        Ok(RunSummary {
            suites: results
                .iter()
                .map(|r| SuiteOutcome {
                    suite: r.suite,
                    ok: r.ok,
                    exit_code: r.exit_code,
                })
                .collect(),
            bugs: bugs.len(),
            issues_created,
        })
    }

    /// Write bugs, the CSV export, and artifact records. Returns how many
    /// artifacts were registered.
    fn persist(
        &self,
        run_id: &str,
        bugs: &[BugRecord],
        results: &[SuiteResult],
        artifacts_dir: &Path,
    ) -> Result<usize, RunError> {
        self.store.write_bugs(run_id, bugs)?;

        let csv_path = artifacts_dir.join(export::CSV_FILENAME);
        export::write_bugs_csv(&csv_path, bugs).context("write bug export")?;
        let mut records = vec![
            ArtifactRecord::new(run_id, ArtifactKind::Csv, csv_path.to_string_lossy())
                .with_metadata(json!({ "bugs": bugs.len() })),
        ];

        for result in results {
            let suite = json!({ "suite": result.suite });
            if result.results_path.is_file() {
                records.push(
                    ArtifactRecord::new(
                        run_id,
                        ArtifactKind::Report,
                        result.results_path.to_string_lossy(),
                    )
                    .with_metadata(suite.clone()),
                );
            }
            for log in [&result.stdout_path, &result.stderr_path] {
                if log.is_file() {
                    records.push(
                        ArtifactRecord::new(run_id, ArtifactKind::Log, log.to_string_lossy())
                            .with_metadata(suite.clone()),
                    );
                }
            }
        }

        for record in &records {
            self.store.append_artifact(record)?;
        }
        Ok(records.len())
    }

    /// Best-effort issue filing; one bug's failure never blocks the others.
    async fn file_issues(&self, run_id: &str, repo_url: &str, bugs: &[BugRecord]) -> usize {
        let mut created = 0;
        for bug in bugs {
            match self.collaborators.issues.file_issue(repo_url, bug).await {
                Ok(result) if !result.url.is_empty() => {
                    match self.store.record_issue(run_id, &bug.bug_id, &result.url) {
                        Ok(_) => created += 1,
                        Err(e) => self.log(
                            run_id,
                            LogLevel::Warning,
                            STEP_ISSUES,
                            format!("Failed to record issue for {}: {e}", bug.bug_id),
                        ),
                    }
                }
                Ok(_) => {
                    tracing::debug!(run_id, bug_id = %bug.bug_id, "issue not filed");
                }
                Err(e) => self.log(
                    run_id,
                    LogLevel::Warning,
                    STEP_ISSUES,
                    format!("Issue filing failed for {}: {e}", bug.bug_id),
                ),
            }
        }
        created
    }
}

fn remove_scratch(scratch: &Path) {
    if !scratch.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(scratch) {
        tracing::warn!(path = %scratch.display(), "failed to remove scratch directory: {e}");
    }
}
