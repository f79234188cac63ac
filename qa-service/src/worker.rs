//! Worker Lifecycle Manager.
//!
//! Supervises at most one background consumer process. Output (stdout and
//! stderr, merged) lands in a bounded [`LogRing`]. Liveness is reconciled
//! lazily: an exited child is noticed on the next `status`/`start` call.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uiqa_feedback::LogRing;

use crate::config::WorkerConfig;
use crate::process::signal_process;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Uses the operator's local analysis-CLI login.
    #[default]
    Local,
    /// Uses an injected API key.
    Docker,
}

impl WorkerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerMode::Local => "local",
            WorkerMode::Docker => "docker",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker is already running")]
    AlreadyRunning { pid: u32 },

    #[error("Worker is not running")]
    NotRunning,

    #[error("An API key is required in docker mode")]
    MissingApiKey,

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker failed to start")]
    ExitedEarly { exit_code: Option<i32> },

    #[error("Failed to stop worker: {0}")]
    Stop(#[source] std::io::Error),
}

/// Control-plane locations handed to the consumer through its environment.
#[derive(Debug, Clone)]
pub struct WorkerEndpoints {
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub socket_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedWorker {
    pub pid: u32,
    pub mode: WorkerMode,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerStatus {
    pub running: bool,
    pub mode: WorkerMode,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<f64>,
    pub logs: Vec<String>,
}

struct Supervised {
    child: Child,
    pid: u32,
    started: Instant,
}

struct State {
    current: Option<Supervised>,
    mode: WorkerMode,
}

impl State {
    /// Drop the child if it has exited.
    fn reconcile(&mut self) {
        let exited = match self.current.as_mut() {
            Some(worker) => match worker.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(pid = worker.pid, %status, "worker exited");
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(pid = worker.pid, "worker wait failed: {e}");
                    true
                }
            },
            None => false,
        };
        if exited {
            self.current = None;
        }
    }
}

/// Single-instance supervisor; construct once and share by reference.
pub struct WorkerManager {
    config: WorkerConfig,
    endpoints: WorkerEndpoints,
    state: Mutex<State>,
    logs: LogRing,
}

impl WorkerManager {
    pub fn new(config: WorkerConfig, endpoints: WorkerEndpoints) -> Self {
        let logs = LogRing::with_capacity(config.log_capacity);
        Self {
            config,
            endpoints,
            state: Mutex::new(State {
                current: None,
                mode: WorkerMode::default(),
            }),
            logs,
        }
    }

    fn command(&self, mode: WorkerMode, api_key: Option<&str>) -> Result<Command, WorkerError> {
        let program = match &self.config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(WorkerError::Spawn)?,
        };
        let mut cmd = Command::new(program);
        cmd.args(&self.config.args)
            .env("UIQA_DATA_DIR", &self.endpoints.data_dir)
            .env("UIQA_ARTIFACTS_DIR", &self.endpoints.artifacts_dir)
            .env("UIQA_SOCKET_PATH", &self.endpoints.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if mode == WorkerMode::Docker {
            let key = api_key
                .filter(|k| !k.trim().is_empty())
                .ok_or(WorkerError::MissingApiKey)?;
            cmd.env("ANTHROPIC_API_KEY", key);
        }
        Ok(cmd)
    }

    /// Spawn the consumer. Rejected, without touching the running process,
    /// when one is already alive.
    pub async fn start(
        &self,
        mode: WorkerMode,
        api_key: Option<&str>,
    ) -> Result<StartedWorker, WorkerError> {
        let mut state = self.state.lock().await;
        state.reconcile();
        if let Some(worker) = &state.current {
            return Err(WorkerError::AlreadyRunning { pid: worker.pid });
        }

        let mut cmd = self.command(mode, api_key)?;
        self.logs.clear();
        let mut child = cmd.spawn().map_err(WorkerError::Spawn)?;
        let Some(pid) = child.id() else {
            return Err(WorkerError::ExitedEarly { exit_code: None });
        };
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, self.logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, self.logs.clone()));
        }
        tracing::info!(pid, mode = mode.as_str(), "worker spawned");

        tokio::time::sleep(Duration::from_millis(self.config.liveness_check_ms)).await;
        if let Ok(Some(status)) = child.try_wait() {
            tracing::warn!(pid, %status, "worker exited during liveness check");
            return Err(WorkerError::ExitedEarly {
                exit_code: status.code(),
            });
        }

        state.mode = mode;
        state.current = Some(Supervised {
            child,
            pid,
            started: Instant::now(),
        });
        Ok(StartedWorker { pid, mode })
    }

    /// SIGTERM, bounded wait, then SIGKILL.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        state.reconcile();
        let Some(mut worker) = state.current.take() else {
            return Err(WorkerError::NotRunning);
        };

        signal_process(worker.pid, libc::SIGTERM);
        let grace = Duration::from_secs(self.config.stop_grace_secs);
        match tokio::time::timeout(grace, worker.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = worker.pid, %status, "worker stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(WorkerError::Stop(e)),
            Err(_) => {
                tracing::warn!(pid = worker.pid, "worker ignored SIGTERM, killing");
                worker.child.start_kill().map_err(WorkerError::Stop)?;
                let kill_wait = Duration::from_secs(self.config.kill_wait_secs);
                match tokio::time::timeout(kill_wait, worker.child.wait()).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(WorkerError::Stop(e)),
                    Err(_) => Err(WorkerError::Stop(std::io::Error::other(format!(
                        "worker {} did not exit after SIGKILL",
                        worker.pid
                    )))),
                }
            }
        }
    }

    pub async fn status(&self) -> WorkerStatus {
        let mut state = self.state.lock().await;
        state.reconcile();
        let (pid, uptime_seconds) = match &state.current {
            Some(worker) => (
                Some(worker.pid),
                Some(worker.started.elapsed().as_secs_f64()),
            ),
            None => (None, None),
        };
        WorkerStatus {
            running: pid.is_some(),
            mode: state.mode,
            pid,
            uptime_seconds,
            logs: self.logs.tail(self.config.status_tail),
        }
    }

    /// Last `lines` captured output lines, oldest first.
    pub fn logs(&self, lines: usize) -> Vec<String> {
        self.logs.tail(lines)
    }
}

async fn pump_lines<R>(reader: R, ring: LogRing)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => ring.push_line(&line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("worker output reader stopped: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::is_alive;
    use pretty_assertions::assert_eq;

    fn manager(script: &str) -> WorkerManager {
        let config = WorkerConfig {
            program: Some(PathBuf::from("sh")),
            args: vec!["-c".to_string(), script.to_string()],
            log_capacity: 500,
            status_tail: 100,
            liveness_check_ms: 200,
            stop_grace_secs: 2,
            kill_wait_secs: 2,
        };
        WorkerManager::new(
            config,
            WorkerEndpoints {
                data_dir: PathBuf::from("/srv/uiqa"),
                artifacts_dir: PathBuf::from("/srv/uiqa/artifacts"),
                socket_path: PathBuf::from("/run/uiqa.sock"),
            },
        )
    }

    #[tokio::test]
    async fn second_start_is_rejected_and_first_survives() {
        let workers = manager("echo booted; exec sleep 30");
        let first = workers.start(WorkerMode::Local, None).await.unwrap();

        let err = workers.start(WorkerMode::Local, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Worker is already running");
        assert!(is_alive(first.pid));

        let status = workers.status().await;
        assert!(status.running);
        assert_eq!(status.pid, Some(first.pid));

        workers.stop().await.unwrap();
        assert!(!workers.status().await.running);
    }

    #[tokio::test]
    async fn endpoints_reach_the_child_and_output_is_captured() {
        let workers = manager(
            "echo \"data=$UIQA_DATA_DIR\"; echo \"sock=$UIQA_SOCKET_PATH\" >&2; echo \"key=$ANTHROPIC_API_KEY\"; exec sleep 30",
        );
        workers
            .start(WorkerMode::Docker, Some("sk-test"))
            .await
            .unwrap();

        let logs = workers.logs(10);
        assert!(logs.contains(&"data=/srv/uiqa".to_string()), "{logs:?}");
        assert!(logs.contains(&"sock=/run/uiqa.sock".to_string()), "{logs:?}");
        assert!(logs.contains(&"key=sk-test".to_string()), "{logs:?}");
        assert_eq!(workers.status().await.mode, WorkerMode::Docker);
        workers.stop().await.unwrap();
    }

    #[tokio::test]
    async fn docker_mode_requires_a_key() {
        let workers = manager("exec sleep 30");
        let err = workers.start(WorkerMode::Docker, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::MissingApiKey));
        assert!(!workers.status().await.running);
    }

    #[tokio::test]
    async fn early_exit_is_a_start_failure() {
        let workers = manager("echo 'bad config' >&2; exit 3");
        let err = workers.start(WorkerMode::Local, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::ExitedEarly { exit_code: Some(3) }));
        assert!(!workers.status().await.running);
    }

    #[tokio::test]
    async fn exited_worker_is_reconciled_lazily() {
        let workers = manager("sleep 0.5");
        let started = workers.start(WorkerMode::Local, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        let status = workers.status().await;
        assert!(!status.running);
        assert_eq!(status.pid, None);
        assert!(!is_alive(started.pid));
        assert!(matches!(workers.stop().await, Err(WorkerError::NotRunning)));
    }

    #[tokio::test]
    async fn stop_escalates_when_sigterm_is_ignored() {
        let workers = manager("trap '' TERM; while true; do sleep 0.1; done");
        let started = workers.start(WorkerMode::Local, None).await.unwrap();

        workers.stop().await.unwrap();
        assert!(!is_alive(started.pid));
    }

    #[tokio::test]
    async fn stop_without_worker_reports_not_running() {
        let workers = manager("exec sleep 30");
        let err = workers.stop().await.unwrap_err();
        assert_eq!(err.to_string(), "Worker is not running");
    }
}
