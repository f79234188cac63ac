//! Service configuration.
//!
//! Layered with the `config` crate:
//! 1. serialized defaults
//! 2. optional TOML file (`--config`, or `<config_dir>/uiqa/config.toml`)
//! 3. environment, prefix `UIQA_`, `__` between sections
//!    (e.g. `UIQA_RUNNER__START_COMMAND`, `UIQA_GITHUB__TOKEN`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to serialize defaults: {0}")]
    Defaults(#[from] serde_json::Error),

    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// Root configuration shared by `serve` and `worker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Store root: run records, bugs, queue markers.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root of per-run artifact trees.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,

    /// Parent of per-run scratch clones.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Control socket; `None` resolves to [`crate::default_socket_path`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    #[serde(default)]
    pub clone: CloneConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneConfig {
    #[serde(default = "default_git_program")]
    pub program: String,
    #[serde(default = "default_clone_timeout")]
    pub timeout_secs: u64,
}

/// Knobs for the Process Lifecycle Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_true")]
    pub install_dependencies: bool,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL for the app server.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Start command override; `{port}` and `{baseUrl}` are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    /// Start directory override, relative to the repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Test project directory; relative paths resolve against the UI dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_project: Option<String>,
}

/// External analysis CLI invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_command")]
    pub command: String,
    #[serde(default = "default_analysis_args")]
    pub args: Vec<String>,
    /// Internal process timeout.
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
    /// Added on top of `timeout_secs` for the outer call deadline.
    #[serde(default = "default_analysis_grace")]
    pub outer_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_github_api")]
    pub api_base: String,
    #[serde(default = "default_github_timeout")]
    pub timeout_secs: u64,
}

/// Worker Lifecycle Manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Consumer executable; `None` means the current executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_status_tail")]
    pub status_tail: usize,
    #[serde(default = "default_liveness_check_ms")]
    pub liveness_check_ms: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_kill_wait")]
    pub kill_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("uiqa"))
        .unwrap_or_else(|| PathBuf::from(".uiqa"))
}
fn default_artifacts_dir() -> PathBuf {
    default_data_dir().join("artifacts")
}
fn default_work_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_git_program() -> String {
    "git".to_string()
}
fn default_clone_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_install_timeout() -> u64 {
    1800
}
fn default_readiness_timeout() -> u64 {
    90
}
fn default_readiness_poll_ms() -> u64 {
    500
}
fn default_probe_timeout() -> u64 {
    3
}
fn default_test_timeout() -> u64 {
    1800
}
fn default_stop_grace() -> u64 {
    10
}
fn default_analysis_command() -> String {
    "claude".to_string()
}
fn default_analysis_args() -> Vec<String> {
    vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "text".to_string(),
    ]
}
fn default_analysis_timeout() -> u64 {
    900
}
fn default_analysis_grace() -> u64 {
    30
}
fn default_github_api() -> String {
    "https://api.github.com".to_string()
}
fn default_github_timeout() -> u64 {
    30
}
fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}
fn default_log_capacity() -> usize {
    uiqa_feedback::DEFAULT_MAX_LINES
}
fn default_status_tail() -> usize {
    100
}
fn default_liveness_check_ms() -> u64 {
    1000
}
fn default_kill_wait() -> u64 {
    5
}
fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            program: default_git_program(),
            timeout_secs: default_clone_timeout(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            install_dependencies: default_true(),
            install_timeout_secs: default_install_timeout(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_poll_ms: default_readiness_poll_ms(),
            probe_timeout_secs: default_probe_timeout(),
            test_timeout_secs: default_test_timeout(),
            stop_grace_secs: default_stop_grace(),
            start_command: None,
            start_cwd: None,
            base_url: None,
            test_dir: None,
            test_project: None,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            command: default_analysis_command(),
            args: default_analysis_args(),
            timeout_secs: default_analysis_timeout(),
            outer_grace_secs: default_analysis_grace(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_github_api(),
            timeout_secs: default_github_timeout(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_worker_args(),
            log_capacity: default_log_capacity(),
            status_tail: default_status_tail(),
            liveness_check_ms: default_liveness_check_ms(),
            stop_grace_secs: default_stop_grace(),
            kill_wait_secs: default_kill_wait(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            artifacts_dir: default_artifacts_dir(),
            work_dir: default_work_dir(),
            socket_path: None,
            clone: CloneConfig::default(),
            runner: RunnerConfig::default(),
            analysis: AnalysisConfig::default(),
            github: GitHubConfig::default(),
            worker: WorkerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Control socket path, resolved.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::default_socket_path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis.outer_grace_secs == 0 {
            return Err(ConfigError::Invalid(
                "analysis.outer_grace_secs must be > 0 so the outer deadline exceeds the process timeout"
                    .to_string(),
            ));
        }
        if self.runner.readiness_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "runner.readiness_poll_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl RunnerConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

/// Configuration loader with layered merging support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_source: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_source: None,
        }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Read environment overrides from `vars` instead of the process env.
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (UIQA_ prefix)
    pub fn load(&self) -> Result<ServiceConfig, ConfigError> {
        let mut builder = Config::builder();

        // Layer 1: Defaults (serialize defaults to JSON and load as base)
        let defaults_json = serde_json::to_string(&ServiceConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        // Layer 2: Config file (if provided)
        if let Some(ref path) = self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        // Layer 3: Environment variables (UIQA_ prefix, double underscore for nesting)
        builder = builder.add_source(
            Environment::with_prefix("UIQA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("analysis.args")
                .with_list_parse_key("worker.args")
                .source(self.env_source.clone()),
        );

        let config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// `<config_dir>/uiqa/config.toml`, when present.
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./uiqa.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }
        dirs::config_dir()
            .map(|d| d.join("uiqa").join("config.toml"))
            .filter(|p| p.exists())
    }

    /// Load from the explicit path, or from the default locations.
    pub fn load_default(explicit: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
        let loader = match explicit.map(Path::to_path_buf).or_else(Self::find_config_file) {
            Some(path) => ConfigLoader::new().with_file(path),
            None => ConfigLoader::new(),
        };
        loader.load()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
