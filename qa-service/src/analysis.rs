//! External analysis collaborator: repository analysis, test generation and
//! failure triage.
//!
//! The production adapter shells out to an agentic CLI in the repository
//! root with the prompt on stdin. The call is bounded twice: the process
//! timeout, and an outer deadline strictly larger than it so the two never
//! race to cancel the same call.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uiqa_core::qa::RawBug;

use crate::config::AnalysisConfig;
use crate::parse::{ParseError, parse_json_response};
use crate::process::{self, ProcessError};

/// Optional workflow contract read from the repository root.
pub const CONTRACT_FILE: &str = "ui_contract.txt";

const DEFAULT_SELECTOR_STRATEGY: &str = "data-testid";

/// How much of a rejected response is quoted back in the error.
const RAW_EXCERPT_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{operation} timed out after {timeout_secs}s")]
    TimedOut {
        operation: &'static str,
        timeout_secs: u64,
    },

    #[error("{operation} exited with code {exit_code}: {stderr}")]
    Failed {
        operation: &'static str,
        exit_code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Malformed {operation} response: {source}")]
    Malformed {
        operation: &'static str,
        source: serde_json::Error,
    },

    #[error("Incomplete {operation} response: {reason}. Raw: {raw}")]
    Incomplete {
        operation: &'static str,
        reason: &'static str,
        raw: String,
    },
}

impl AnalysisError {
    fn incomplete(operation: &'static str, reason: &'static str, raw: &str) -> Self {
        AnalysisError::Incomplete {
            operation,
            reason,
            raw: raw.trim().chars().take(RAW_EXCERPT_CHARS).collect(),
        }
    }
}

// ── Response shapes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(
        default,
        rename = "baseUrl",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectorInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Result of `analyze_repo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepoAnalysis {
    #[serde(default)]
    pub start: StartSpec,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub detected: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub selectors: SelectorInfo,
}

impl RepoAnalysis {
    /// Reject answers that parsed but carry nothing to act on.
    pub fn check(&self) -> Result<(), &'static str> {
        if self.workflows.is_empty() {
            return Err("no workflows");
        }
        if self.workflows.iter().any(|w| w.name.trim().is_empty()) {
            return Err("workflow without a name");
        }
        if self.start.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
            return Err("no start command");
        }
        Ok(())
    }

    pub fn selector_strategy(&self) -> &str {
        self.selectors
            .strategy
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SELECTOR_STRATEGY)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedFiles {
    #[serde(
        default,
        rename = "testsDir",
        skip_serializing_if = "Option::is_none"
    )]
    pub tests_dir: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Result of `generate_tests`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneratedTests {
    pub created: CreatedFiles,
    #[serde(default, rename = "selectorChanges")]
    pub selector_changes: serde_json::Value,
}

/// Result of `triage_failures`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TriageResponse {
    #[serde(default)]
    pub bugs: Vec<RawBug>,
}

// ── Requests ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub repo_root: &'a Path,
    pub app_dir: &'a str,
    pub ui_dir: &'a str,
    pub contract: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub repo_root: &'a Path,
    pub ui_dir: &'a str,
    pub workflows: &'a [Workflow],
    pub selector_strategy: &'a str,
}

/// Read `<repo_root>/ui_contract.txt`, if present.
pub fn read_contract(repo_root: &Path) -> Option<String> {
    let path = repo_root.join(CONTRACT_FILE);
    if !path.is_file() {
        return None;
    }
    match std::fs::read(&path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            tracing::warn!(path = %path.display(), "unreadable contract file: {e}");
            None
        }
    }
}

#[async_trait]
pub trait AnalysisCollaborator: Send + Sync {
    async fn analyze_repo(&self, request: &AnalysisRequest<'_>)
    -> Result<RepoAnalysis, AnalysisError>;

    async fn generate_tests(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<GeneratedTests, AnalysisError>;

    async fn triage_failures(
        &self,
        repo_root: &Path,
        results_path: &Path,
    ) -> Result<TriageResponse, AnalysisError>;
}

/// Decode a parsed response; a non-object or mistyped payload is an error.
fn decode<T: serde::de::DeserializeOwned>(
    raw: &str,
    operation: &'static str,
) -> Result<T, AnalysisError> {
    let (value, _) = parse_json_response(raw, operation)?;
    if !value.is_object() {
        return Err(AnalysisError::incomplete(
            operation,
            "expected a JSON object",
            raw,
        ));
    }
    serde_json::from_value(value).map_err(|source| AnalysisError::Malformed { operation, source })
}

/// CLI-backed collaborator (`claude -p --output-format text` by default).
pub struct ClaudeCodeAdapter {
    config: AnalysisConfig,
}

impl ClaudeCodeAdapter {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    async fn call(
        &self,
        operation: &'static str,
        repo_root: &Path,
        prompt: &str,
        tools: &[&str],
    ) -> Result<String, AnalysisError> {
        let mut args = self.config.args.clone();
        if !tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }

        let inner = Duration::from_secs(self.config.timeout_secs);
        let outer = inner + Duration::from_secs(self.config.outer_grace_secs);
        tracing::info!(operation, command = %self.config.command, "calling analysis collaborator");

        let env = HashMap::new();
        let call = process::capture(
            &self.config.command,
            &args,
            repo_root,
            &env,
            Some(prompt),
            inner,
        );
        let out = match tokio::time::timeout(outer, call).await {
            Ok(out) => out?,
            Err(_) => {
                return Err(AnalysisError::TimedOut {
                    operation,
                    timeout_secs: outer.as_secs(),
                });
            }
        };

        if out.timed_out {
            return Err(AnalysisError::TimedOut {
                operation,
                timeout_secs: self.config.timeout_secs,
            });
        }
        if out.exit_code != 0 {
            return Err(AnalysisError::Failed {
                operation,
                exit_code: out.exit_code,
                stderr: process::tail_excerpt(&out.stderr, 1000),
            });
        }
        tracing::debug!(operation, len = out.stdout.len(), "analysis response received");
        Ok(out.stdout)
    }
}

#[async_trait]
impl AnalysisCollaborator for ClaudeCodeAdapter {
    async fn analyze_repo(
        &self,
        request: &AnalysisRequest<'_>,
    ) -> Result<RepoAnalysis, AnalysisError> {
        let prompt = analyze_prompt(request);
        let raw = self
            .call(
                "analyze_repo",
                request.repo_root,
                &prompt,
                &["Bash", "Read", "Grep", "Glob", "LS"],
            )
            .await?;
        let analysis: RepoAnalysis = decode(&raw, "analyze_repo")?;
        analysis
            .check()
            .map_err(|reason| AnalysisError::incomplete("analyze_repo", reason, &raw))?;
        Ok(analysis)
    }

    async fn generate_tests(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<GeneratedTests, AnalysisError> {
        let prompt = generate_prompt(request);
        let raw = self
            .call(
                "generate_tests",
                request.repo_root,
                &prompt,
                &["Bash", "Read", "Write", "Edit", "Grep", "Glob", "LS"],
            )
            .await?;
        decode(&raw, "generate_tests")
    }

    async fn triage_failures(
        &self,
        repo_root: &Path,
        results_path: &Path,
    ) -> Result<TriageResponse, AnalysisError> {
        let prompt = triage_prompt(repo_root, results_path);
        let raw = self
            .call(
                "triage_failures",
                repo_root,
                &prompt,
                &["Read", "Grep", "Glob", "LS"],
            )
            .await?;
        decode(&raw, "triage_failures")
    }
}

// ── Prompts ──────────────────────────────────────────────────────────────

fn analyze_prompt(request: &AnalysisRequest<'_>) -> String {
    format!(
        r#"You are working inside a git repository checked out at {root}.
Analyze it and answer with one JSON object, no markdown, describing:
1. how to start the UI application (command, working directory, default port)
2. 3 to 10 smoke workflows covering the core functionality
3. existing end-to-end tooling (Playwright, Cypress, ...)
4. whether stable selectors exist, and a selector strategy if not

Application folder: {app_dir}
UI folder: {ui_dir}

Workflow contract (may be empty; when present it defines the workflows):
{contract}

Schema:
{{
  "start": {{"cwd": "relative/path", "command": "npm run dev -- --port 4173", "baseUrl": "http://127.0.0.1:4173"}},
  "workflows": [{{"name": "...", "description": "...", "steps": ["..."]}}],
  "detected": {{"hasPlaywright": false, "hasCypress": false, "notes": "..."}},
  "selectors": {{"strategy": "data-testid", "notes": "..."}}
}}

Return ONLY valid JSON."#,
        root = request.repo_root.display(),
        app_dir = request.app_dir,
        ui_dir = request.ui_dir,
        contract = request.contract.as_deref().unwrap_or(""),
    )
}

fn generate_prompt(request: &GenerationRequest<'_>) -> String {
    let workflows =
        serde_json::to_string_pretty(request.workflows).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"You are working inside the repository at {root}.

Make sure Playwright end-to-end tests exist under {ui_dir}/ui-testing/:
- tests/smoke.spec.ts (fast, minimal) and tests/regression.spec.ts (broader)
- a README.md in ui-testing/ explaining how the tests run and how to extend them
- where the UI lacks stable selectors, add {strategy} attributes sparingly and document the rule
- implement a test for every workflow below:
{workflows}

Playwright config requirements:
- baseURL: process.env.BASE_URL || 'http://localhost:3000'
- webServer.reuseExistingServer: true (the server is started externally)
- JSON reporter, traces/videos/screenshots on failure
- chromium project only

Prefer role-based selectors, wait explicitly for navigation and loading states,
and do not break the existing lint or build.

Answer with one JSON object, no markdown:
{{
  "created": {{"testsDir": "{ui_dir}/ui-testing", "files": ["..."]}},
  "selectorChanges": {{"modifiedFiles": ["..."], "notes": "..."}}
}}

Return ONLY valid JSON."#,
        root = request.repo_root.display(),
        ui_dir = request.ui_dir,
        strategy = request.selector_strategy,
    )
}

fn triage_prompt(repo_root: &Path, results_path: &Path) -> String {
    format!(
        r#"You are working inside the repository at {root}.

Read the Playwright JSON results at {results}
and turn every failure into a bug record.

Each bug needs: title, severity (blocker|critical|major|minor), suite
(smoke|regression), repro_steps (list), expected, actual, evidence_paths
(list of trace/screenshot/video paths), suggested_fix, component_guess.

Answer with one JSON object, no markdown:
{{"bugs": [{{"title": "...", "severity": "major", "suite": "smoke", "repro_steps": ["..."],
  "expected": "...", "actual": "...", "evidence_paths": ["..."],
  "suggested_fix": "...", "component_guess": "..."}}]}}

Return ONLY valid JSON."#,
        root = repo_root.display(),
        results = results_path.display(),
    )
}
