//! Process Lifecycle Manager: run one test suite against a freshly started
//! instance of the target application.
//!
//! Sequence per suite: install dependencies, allocate a port, start the
//! app server in its own process group, probe readiness, run Playwright
//! under a wall-clock timeout, copy evidence, and always tear the server
//! group down before returning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Child;
use uiqa_core::qa::SuiteKind;
use walkdir::WalkDir;

use crate::config::RunnerConfig;
use crate::process::{self, ProcessError};

/// Evidence extensions copied into the artifact tree.
const EVIDENCE_EXTENSIONS: &[&str] = &["zip", "png", "jpg", "jpeg", "webm", "json"];

/// Test-project subdirectories that may hold evidence.
const EVIDENCE_DIRS: &[&str] = &["test-results", "playwright-report", "artifacts"];

/// Spec file conventions, tried in order.
const SPEC_EXTENSIONS: &[&str] = &[".spec.ts", ".spec.js", ".test.ts", ".test.js"];

/// Default test project location under the UI directory.
const DEFAULT_TEST_DIR: &str = "ui-testing";

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("UI folder missing package.json: {0}")]
    MissingPackageJson(PathBuf),

    #[error("Failed to read {path}: {source}")]
    PackageJson {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("No dev/start script found in {0}")]
    NoStartScript(PathBuf),

    #[error("Command failed: {command} (exit {exit_code}); see {stdout} / {stderr}", stdout = .stdout_path.display(), stderr = .stderr_path.display())]
    InstallFailed {
        command: String,
        exit_code: i32,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
    },

    #[error("Dependency install `{command}` timed out after {timeout_secs}s; see {stdout} / {stderr}", stdout = .stdout_path.display(), stderr = .stderr_path.display())]
    InstallTimedOut {
        command: String,
        timeout_secs: u64,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
    },

    #[error("Readiness probe for {base_url} timed out after {timeout_secs}s; see {stdout} / {stderr}", stdout = .stdout_path.display(), stderr = .stderr_path.display())]
    NotReady {
        base_url: String,
        timeout_secs: u64,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
    },

    #[error("Playwright tests folder not found: {0}. Generate tests first.")]
    TestsNotFound(PathBuf),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalized outcome of one suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteResult {
    pub suite: SuiteKind,
    pub ok: bool,
    /// Structured report; may not exist if the runner produced none.
    pub results_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub exit_code: i32,
}

/// Where a suite runs and where its outputs go.
#[derive(Debug, Clone)]
pub struct SuiteRequest {
    pub run_id: String,
    pub repo_root: PathBuf,
    /// UI directory relative to `repo_root`.
    pub ui_dir: String,
    pub artifacts_dir: PathBuf,
}

#[async_trait]
pub trait SuiteExecutor: Send + Sync {
    async fn run_suite(
        &self,
        request: &SuiteRequest,
        suite: SuiteKind,
    ) -> Result<SuiteResult, RunnerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    /// Lockfile priority: pnpm, then yarn, else npm.
    pub fn detect(dir: &Path) -> Self {
        if dir.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else if dir.join("yarn.lock").exists() {
            PackageManager::Yarn
        } else {
            PackageManager::Npm
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }

    fn reproducible_install(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm ci",
            PackageManager::Pnpm => "pnpm install --frozen-lockfile",
            PackageManager::Yarn => "yarn install --frozen-lockfile",
        }
    }

    fn relaxed_install(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm install",
            PackageManager::Pnpm => "pnpm install",
            PackageManager::Yarn => "yarn install",
        }
    }

    fn dev_command(self, port: u16) -> String {
        match self {
            PackageManager::Npm => format!("npm run dev -- --host 127.0.0.1 --port {port}"),
            PackageManager::Pnpm => format!("pnpm dev -- --host 127.0.0.1 --port {port}"),
            PackageManager::Yarn => format!("yarn dev --host 127.0.0.1 --port {port}"),
        }
    }
}

/// Resolved application start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPlan {
    pub cwd: PathBuf,
    pub command: String,
    pub base_url: String,
}

/// Bind port 0 on loopback and read back the assigned port.
pub fn allocate_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Kills the server's process group if it is still held when dropped.
struct ServerGuard {
    child: Option<Child>,
}

impl ServerGuard {
    async fn shutdown(mut self, grace: Duration) {
        if let Some(mut child) = self.child.take() {
            process::terminate_group(&mut child, grace).await;
        }
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut()
            && let Some(pid) = child.id()
        {
            process::signal_group(pid, libc::SIGKILL);
        }
    }
}

/// Playwright-backed [`SuiteExecutor`].
pub struct PlaywrightRunner {
    config: RunnerConfig,
    http: reqwest::Client,
}

impl PlaywrightRunner {
    pub fn new(config: RunnerConfig) -> Result<Self, RunnerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_secs))
            .build()?;
        Ok(Self { config, http })
    }

    /// Start plan: configured override, else `dev`, else `start` script.
    pub fn resolve_start(
        &self,
        repo_root: &Path,
        ui_dir_rel: &str,
        ui_dir: &Path,
        port: u16,
    ) -> Result<StartPlan, RunnerError> {
        let base_url = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}"));

        if let Some(command) = &self.config.start_command {
            let cwd = repo_root.join(self.config.start_cwd.as_deref().unwrap_or(ui_dir_rel));
            let command = command
                .replace("{port}", &port.to_string())
                .replace("{baseUrl}", &base_url);
            return Ok(StartPlan {
                cwd,
                command,
                base_url,
            });
        }

        let pm = PackageManager::detect(ui_dir);
        let scripts = read_scripts(ui_dir)?;
        let command = if scripts.contains_key("dev") {
            pm.dev_command(port)
        } else if scripts.contains_key("start") {
            format!("{} run start", pm.as_str())
        } else {
            return Err(RunnerError::NoStartScript(ui_dir.join("package.json")));
        };
        Ok(StartPlan {
            cwd: ui_dir.to_path_buf(),
            command,
            base_url,
        })
    }

    /// Test project directory; relative overrides resolve against the UI dir.
    pub fn test_dir(&self, ui_dir: &Path) -> PathBuf {
        match &self.config.test_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => ui_dir.join(dir),
            None => ui_dir.join(DEFAULT_TEST_DIR),
        }
    }

    async fn install_dependencies(
        &self,
        dir: &Path,
        artifacts_dir: &Path,
        log_prefix: &str,
    ) -> Result<(), RunnerError> {
        if !self.config.install_dependencies {
            return Ok(());
        }
        let pm = PackageManager::detect(dir);
        let stdout_path = artifacts_dir.join(format!("{log_prefix}.stdout.txt"));
        let stderr_path = artifacts_dir.join(format!("{log_prefix}.stderr.txt"));
        let timeout = Duration::from_secs(self.config.install_timeout_secs);
        let env = HashMap::new();

        let mut command = pm.reproducible_install();
        let mut exit_code =
            process::run_logged(command, dir, &env, &stdout_path, &stderr_path, timeout).await?;
        // A timed-out install is not retried: the relaxed install would
        // double the bound.
        if exit_code != 0 && exit_code != process::TIMEOUT_EXIT_CODE {
            tracing::warn!(
                dir = %dir.display(),
                exit_code,
                "reproducible install failed, retrying relaxed"
            );
            command = pm.relaxed_install();
            exit_code =
                process::run_logged(command, dir, &env, &stdout_path, &stderr_path, timeout)
                    .await?;
        }
        install_outcome(command, exit_code, timeout, stdout_path, stderr_path)
    }

    /// Poll `url` until a non-5xx response or the readiness timeout.
    pub async fn wait_ready(&self, url: &str) -> bool {
        let deadline = Instant::now() + self.config.readiness_timeout();
        let poll = Duration::from_millis(self.config.readiness_poll_ms);
        loop {
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().as_u16() < 500 => return true,
                Ok(resp) => tracing::debug!(url, status = %resp.status(), "server not ready"),
                Err(e) => tracing::trace!(url, "probe failed: {e}"),
            }
            if Instant::now() + poll >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn run_tests(
        &self,
        request: &SuiteRequest,
        suite: SuiteKind,
        ui_dir: &Path,
        plan: &StartPlan,
        mut env: HashMap<String, String>,
    ) -> Result<SuiteResult, RunnerError> {
        let artifacts = &request.artifacts_dir;
        if !self.wait_ready(&plan.base_url).await {
            return Err(RunnerError::NotReady {
                base_url: plan.base_url.clone(),
                timeout_secs: self.config.readiness_timeout_secs,
                stdout_path: artifacts.join(format!("server.{suite}.stdout.txt")),
                stderr_path: artifacts.join(format!("server.{suite}.stderr.txt")),
            });
        }
        tracing::info!(run_id = %request.run_id, %suite, base_url = %plan.base_url, "server ready");

        let test_dir = self.test_dir(ui_dir);
        if !test_dir.is_dir() {
            return Err(RunnerError::TestsNotFound(test_dir));
        }
        if test_dir.join("package.json").exists() {
            self.install_dependencies(&test_dir, artifacts, &format!("install_tests.{suite}"))
                .await?;
        }

        let output_dir = artifacts.join(format!("playwright-{suite}"));
        std::fs::create_dir_all(&output_dir)?;
        let results_path = artifacts.join(format!("playwright.{suite}.results.json"));
        let stdout_path = artifacts.join(format!("playwright.{suite}.stdout.txt"));
        let stderr_path = artifacts.join(format!("playwright.{suite}.stderr.txt"));
        env.insert(
            "PLAYWRIGHT_OUTPUT_DIR".to_string(),
            output_dir.to_string_lossy().to_string(),
        );

        let command = self.test_command(&test_dir, suite, &output_dir);
        tracing::info!(run_id = %request.run_id, %suite, %command, "running tests");
        let exit_code = process::run_logged(
            &command,
            &test_dir,
            &env,
            &stdout_path,
            &stderr_path,
            Duration::from_secs(self.config.test_timeout_secs),
        )
        .await?;
        if exit_code == process::TIMEOUT_EXIT_CODE {
            tracing::warn!(run_id = %request.run_id, %suite, "test run hit its timeout");
        }

        keep_json_report(&stdout_path, &results_path);
        copy_evidence(&test_dir, &output_dir);

        Ok(SuiteResult {
            suite,
            ok: exit_code == 0,
            results_path,
            stdout_path,
            stderr_path,
            exit_code,
        })
    }

    /// `npx playwright test <target> [--project p] --reporter=json ...`.
    pub fn test_command(&self, test_dir: &Path, suite: SuiteKind, output_dir: &Path) -> String {
        let target = SPEC_EXTENSIONS
            .iter()
            .map(|ext| format!("tests/{suite}{ext}"))
            .find(|candidate| test_dir.join(candidate).is_file())
            .unwrap_or_else(|| format!("--grep {suite}"));
        let project = self
            .config
            .test_project
            .as_deref()
            .map(|p| format!(" --project {}", quote(p)))
            .unwrap_or_default();
        format!(
            "npx playwright test {target}{project} --reporter=json --output={} --trace=on",
            quote(&output_dir.to_string_lossy())
        )
    }
}

#[async_trait]
impl SuiteExecutor for PlaywrightRunner {
    async fn run_suite(
        &self,
        request: &SuiteRequest,
        suite: SuiteKind,
    ) -> Result<SuiteResult, RunnerError> {
        let ui_dir = request.repo_root.join(&request.ui_dir);
        if !ui_dir.join("package.json").exists() {
            return Err(RunnerError::MissingPackageJson(ui_dir));
        }
        std::fs::create_dir_all(&request.artifacts_dir)?;

        self.install_dependencies(&ui_dir, &request.artifacts_dir, &format!("install.{suite}"))
            .await?;

        let port = allocate_port()?;
        let plan = self.resolve_start(&request.repo_root, &request.ui_dir, &ui_dir, port)?;

        let mut env = HashMap::new();
        if std::env::var_os("PORT").is_none() {
            env.insert("PORT".to_string(), port.to_string());
        }
        if std::env::var_os("NODE_OPTIONS").is_none() {
            env.insert(
                "NODE_OPTIONS".to_string(),
                "--openssl-legacy-provider".to_string(),
            );
        }
        env.insert("BASE_URL".to_string(), plan.base_url.clone());
        env.insert("PLAYWRIGHT_BASE_URL".to_string(), plan.base_url.clone());
        env.insert("CI".to_string(), "true".to_string());

        tracing::info!(
            run_id = %request.run_id,
            %suite,
            command = %plan.command,
            cwd = %plan.cwd.display(),
            "starting app server"
        );
        let server = process::spawn_logged(
            &plan.command,
            &plan.cwd,
            &env,
            &request.artifacts_dir.join(format!("server.{suite}.stdout.txt")),
            &request.artifacts_dir.join(format!("server.{suite}.stderr.txt")),
        )?;
        let guard = ServerGuard {
            child: Some(server),
        };

        let result = self.run_tests(request, suite, &ui_dir, &plan, env).await;
        guard
            .shutdown(Duration::from_secs(self.config.stop_grace_secs))
            .await;
        result
    }
}

fn read_scripts(ui_dir: &Path) -> Result<serde_json::Map<String, serde_json::Value>, RunnerError> {
    let path = ui_dir.join("package.json");
    let text = std::fs::read_to_string(&path)?;
    let manifest: serde_json::Value =
        serde_json::from_str(&text).map_err(|source| RunnerError::PackageJson { path, source })?;
    Ok(manifest
        .get("scripts")
        .and_then(serde_json::Value::as_object)
        .cloned()
        .unwrap_or_default())
}

fn quote(word: &str) -> String {
    shlex::try_quote(word)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_else(|_| word.to_string())
}

/// Keep the JSON reporter's stdout as the structured report.
fn keep_json_report(stdout_path: &Path, results_path: &Path) {
    let Ok(text) = std::fs::read_to_string(stdout_path) else {
        return;
    };
    let text = text.trim();
    if text.starts_with('{')
        && text.contains("tests")
        && let Err(e) = std::fs::write(results_path, text)
    {
        tracing::warn!(path = %results_path.display(), "failed to write report: {e}");
    }
}

/// Copy recognized evidence files out of the test project.
///
fn install_outcome(
    command: &str,
    exit_code: i32,
    timeout: Duration,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
) -> Result<(), RunnerError> {
    match exit_code {
        0 => Ok(()),
        process::TIMEOUT_EXIT_CODE => Err(RunnerError::InstallTimedOut {
            command: command.to_string(),
            timeout_secs: timeout.as_secs(),
            stdout_path,
            stderr_path,
        }),
        exit_code => Err(RunnerError::InstallFailed {
            command: command.to_string(),
            exit_code,
            stdout_path,
            stderr_path,
        }),
    }
}

/// Returns how many files were copied. Individual copy failures are logged
/// and skipped.
pub fn copy_evidence(test_dir: &Path, output_dir: &Path) -> usize {
    let mut copied = 0;
    for name in EVIDENCE_DIRS {
        let src = test_dir.join(name);
        if !src.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&src).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || !is_evidence(entry.path()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&src) else {
                continue;
            };
            let dest = output_dir.join(name).join(rel);
            let copy = dest
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::copy(entry.path(), &dest));
            match copy {
                Ok(_) => copied += 1,
                Err(e) => tracing::debug!(path = %entry.path().display(), "evidence copy failed: {e}"),
            }
        }
    }
    copied
}

fn is_evidence(path: &Path) -> bool {
    path.extension()
        .and_then(std::ffi::OsStr::to_str)
        .is_some_and(|ext| {
            EVIDENCE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}
