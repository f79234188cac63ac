//! File-backed run store and run queue.
//!
//! ## Layout
//!
//! ```text
//! <data_dir>/runs/{run_id}/
//!   run.json         RunRecord
//!   bugs.json        [BugRecord]
//!   artifacts.json   [ArtifactRecord]   (append-only)
//!   issues.json      [IssueRef]         (append-only)
//! <data_dir>/queue/{run_id}             pending marker
//! <data_dir>/queue/claimed/{run_id}.{pid}  claimed by consumer process pid
//! ```
//!
//! Every JSON file is replaced atomically via a temp sibling + rename, so
//! a reader never observes a half-written record. Claiming renames the
//! pending marker; exactly one claimant wins a given run. A claim is stale
//! only once its owning process is gone.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uiqa_core::qa::{
    ArtifactRecord, BugRecord, IssueRef, RunRecord, RunStatus, RunSubmission, SubmissionError,
    TransitionError,
};

use crate::process;

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("run not found: {run_id}")]
    NotFound { run_id: String },

    #[error("invalid run id: {run_id:?}")]
    InvalidRunId { run_id: String },

    #[error("invalid submission: {0}")]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("run {run_id} was already claimed by a consumer")]
    AlreadyClaimed { run_id: String },
}

/// Persistent store for runs, bugs, artifacts, issue links and the queue.
pub struct RunStore {
    base_dir: PathBuf,
    /// Process recorded on the claims this store takes.
    owner: u32,
}

/// A claim marker under `queue/claimed/`.
struct ClaimMarker {
    run_id: String,
    /// `None` for a marker without a parsable owner.
    owner: Option<u32>,
    path: PathBuf,
}

impl ClaimMarker {
    fn parse(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (run_id, owner) = match name.rsplit_once('.') {
            Some((run_id, pid)) => (run_id, pid.parse().ok()),
            None => (name, None),
        };
        Some(Self {
            run_id: run_id.to_string(),
            owner,
            path,
        })
    }

    fn is_abandoned(&self) -> bool {
        self.owner.is_none_or(|pid| !process::is_alive(pid))
    }
}

impl RunStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("runs"))?;
        std::fs::create_dir_all(base_dir.join("queue").join("claimed"))?;
        Ok(Self {
            base_dir,
            owner: std::process::id(),
        })
    }

    /// Take claims on behalf of process `owner` instead of this one.
    pub fn with_owner(mut self, owner: u32) -> Self {
        self.owner = owner;
        self
    }

    /// Base directory accessor.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn queue_dir(&self) -> PathBuf {
        self.base_dir.join("queue")
    }

    fn claimed_dir(&self) -> PathBuf {
        self.queue_dir().join("claimed")
    }

    /// Directory for a specific run. Rejects ids that could escape the store.
    fn run_dir(&self, run_id: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistenceError::InvalidRunId {
                run_id: run_id.to_string(),
            });
        }
        Ok(self.base_dir.join("runs").join(run_id))
    }

    /// Directory of an existing run.
    fn existing_run_dir(&self, run_id: &str) -> Result<PathBuf, PersistenceError> {
        let dir = self.run_dir(run_id)?;
        if !dir.join("run.json").exists() {
            return Err(PersistenceError::NotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(dir)
    }

    /// Atomically write `data` to `path` via a `.tmp` sibling.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
        let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(value)?;
        self.atomic_write(path, json.as_bytes())
    }

    fn read_list<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, PersistenceError> {
        match std::fs::read_to_string(path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Run records ──────────────────────────────────────────────────────

    /// Persist a new queued run and enqueue it.
    pub fn submit(&self, submission: RunSubmission) -> Result<RunRecord, PersistenceError> {
        let run = RunRecord::new(submission)?;
        let dir = self.run_dir(&run.id)?;
        std::fs::create_dir_all(&dir)?;
        self.write_json(&dir.join("run.json"), &run)?;
        // Record first, marker second: a consumer never sees a marker
        // without a readable run.
        std::fs::write(self.queue_dir().join(&run.id), run.created_at.to_rfc3339())?;
        tracing::info!(run_id = %run.id, repo = %run.repo_url, "run queued");
        Ok(run)
    }

    pub fn read_run(&self, run_id: &str) -> Result<RunRecord, PersistenceError> {
        let path = self.run_dir(run_id)?.join("run.json");
        match std::fs::read_to_string(&path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PersistenceError::NotFound {
                run_id: run_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a run record. A record that already reached a terminal
    /// state is never replaced by a different one.
    pub fn write_run(&self, run: &RunRecord) -> Result<(), PersistenceError> {
        let stored = self.read_run(&run.id)?;
        if stored.status.is_terminal() && stored != *run {
            return Err(TransitionError::Invalid {
                from: stored.status,
                to: run.status,
            }
            .into());
        }
        let dir = self.run_dir(&run.id)?;
        self.write_json(&dir.join("run.json"), run)
    }

    /// Runs, newest first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, PersistenceError> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(self.base_dir.join("runs"))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().to_string();
            match self.read_run(&run_id) {
                Ok(run) => runs.push(run),
                Err(PersistenceError::NotFound { .. }) => continue,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, "skipping unreadable run: {e}");
                }
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    // ── Bugs, artifacts, issues ──────────────────────────────────────────

    /// Replace the bug list of an existing run.
    pub fn write_bugs(&self, run_id: &str, bugs: &[BugRecord]) -> Result<(), PersistenceError> {
        let dir = self.existing_run_dir(run_id)?;
        self.write_json(&dir.join("bugs.json"), bugs)
    }

    pub fn read_bugs(&self, run_id: &str) -> Result<Vec<BugRecord>, PersistenceError> {
        let dir = self.existing_run_dir(run_id)?;
        self.read_list(&dir.join("bugs.json"))
    }

    pub fn append_artifact(&self, artifact: &ArtifactRecord) -> Result<(), PersistenceError> {
        let dir = self.existing_run_dir(&artifact.run_id)?;
        let path = dir.join("artifacts.json");
        let mut artifacts: Vec<ArtifactRecord> = self.read_list(&path)?;
        artifacts.push(artifact.clone());
        self.write_json(&path, &artifacts)
    }

    pub fn read_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, PersistenceError> {
        let dir = self.existing_run_dir(run_id)?;
        self.read_list(&dir.join("artifacts.json"))
    }

    /// Attach a filed issue URL to its bug and record the link.
    pub fn record_issue(
        &self,
        run_id: &str,
        bug_id: &str,
        url: &str,
    ) -> Result<IssueRef, PersistenceError> {
        let dir = self.existing_run_dir(run_id)?;

        let bugs_path = dir.join("bugs.json");
        let mut bugs: Vec<BugRecord> = self.read_list(&bugs_path)?;
        for bug in bugs.iter_mut().filter(|b| b.bug_id == bug_id) {
            bug.issue_url = Some(url.to_string());
        }
        self.write_json(&bugs_path, &bugs)?;

        let issue = IssueRef {
            run_id: run_id.to_string(),
            bug_id: bug_id.to_string(),
            url: url.to_string(),
            created_at: Utc::now(),
        };
        let issues_path = dir.join("issues.json");
        let mut issues: Vec<IssueRef> = self.read_list(&issues_path)?;
        issues.push(issue.clone());
        self.write_json(&issues_path, &issues)?;
        Ok(issue)
    }

    pub fn read_issues(&self, run_id: &str) -> Result<Vec<IssueRef>, PersistenceError> {
        let dir = self.existing_run_dir(run_id)?;
        self.read_list(&dir.join("issues.json"))
    }

    // ── Queue ────────────────────────────────────────────────────────────

    /// Claim the oldest pending run, if any.
    pub fn claim_next(&self) -> Result<Option<String>, PersistenceError> {
        let mut pending = Vec::new();
        for entry in std::fs::read_dir(self.queue_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            pending.push((modified, entry.file_name().to_string_lossy().to_string()));
        }
        pending.sort();

        for (_, run_id) in pending {
            let from = self.queue_dir().join(&run_id);
            let to = self.claimed_dir().join(format!("{run_id}.{}", self.owner));
            match std::fs::rename(&from, &to) {
                Ok(()) => return Ok(Some(run_id)),
                // Lost the race to another claimant or a cancel.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn claim_markers(&self) -> Result<Vec<ClaimMarker>, PersistenceError> {
        let mut markers = Vec::new();
        for entry in std::fs::read_dir(self.claimed_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && let Some(marker) = ClaimMarker::parse(entry.path())
            {
                markers.push(marker);
            }
        }
        Ok(markers)
    }

    /// Release the claim on `run_id` once processing has returned.
    pub fn complete_claim(&self, run_id: &str) -> Result<(), PersistenceError> {
        for marker in self.claim_markers()?.into_iter().filter(|m| m.run_id == run_id) {
            match std::fs::remove_file(&marker.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Run ids currently claimed, by any consumer.
    pub fn claimed_runs(&self) -> Result<Vec<String>, PersistenceError> {
        let mut runs: Vec<String> = self
            .claim_markers()?
            .into_iter()
            .map(|m| m.run_id)
            .collect();
        runs.sort();
        Ok(runs)
    }

    /// Claims whose owning process has exited.
    pub fn stale_claims(&self) -> Result<Vec<String>, PersistenceError> {
        let mut runs: Vec<String> = self
            .claim_markers()?
            .into_iter()
            .filter(ClaimMarker::is_abandoned)
            .map(|m| m.run_id)
            .collect();
        runs.sort();
        Ok(runs)
    }

    /// Cancel a run that no consumer has claimed yet.
    pub fn cancel(&self, run_id: &str) -> Result<RunRecord, PersistenceError> {
        let mut run = self.read_run(run_id)?;
        if run.status != RunStatus::Queued {
            run.cancel(Utc::now())?;
        }
        match std::fs::remove_file(self.queue_dir().join(run_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::AlreadyClaimed {
                    run_id: run_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        run.cancel(Utc::now())?;
        self.write_run(&run)?;
        tracing::info!(run_id = %run_id, "run cancelled");
        Ok(run)
    }
}
