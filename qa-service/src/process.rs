//! Subprocess plumbing shared by the runner, the git fetcher, the analysis
//! adapter and the worker supervisor.
//!
//! Every child is spawned into its own process group so that termination
//! reaches grandchildren too (`npm run dev` forks the real server).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

/// Exit code reported for a command killed by its wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("output capture failed: {0}")]
    OutputCaptureFailed(String),
}

/// Captured result of [`capture`].
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// If true, the process was killed due to exceeding its timeout.
    pub timed_out: bool,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> ProcessError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ProcessError::CommandNotFound(program.to_string())
    } else {
        ProcessError::Io(e)
    }
}

/// Run `program` to completion, capturing stdout/stderr.
///
/// A timeout kills the whole process group and yields
/// [`TIMEOUT_EXIT_CODE`] with `timed_out` set and empty output.
pub async fn capture(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CapturedOutput, ProcessError> {
    let mut child = Command::new(program)
        .args(args)
        .envs(env.iter())
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        match pipe.write_all(input.as_bytes()).await {
            Ok(()) => {}
            // The child exited without reading all of its input.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e.into()),
        }
        // EOF
        drop(pipe);
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessError::OutputCaptureFailed("stdout pipe unavailable".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProcessError::OutputCaptureFailed("stderr pipe unavailable".to_string()))?;
    let stdout_handle = tokio::spawn(async move {
        let mut out = String::new();
        stdout.read_to_string(&mut out).await?;
        Ok::<String, std::io::Error>(out)
    });
    let stderr_handle = tokio::spawn(async move {
        let mut err = String::new();
        stderr.read_to_string(&mut err).await?;
        Ok::<String, std::io::Error>(err)
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            kill_group(&mut child).await;
            stdout_handle.abort();
            stderr_handle.abort();
            return Ok(CapturedOutput {
                exit_code: TIMEOUT_EXIT_CODE,
                timed_out: true,
                ..Default::default()
            });
        }
    };

    let stdout = stdout_handle
        .await
        .map_err(|e| ProcessError::OutputCaptureFailed(format!("stdout task join error: {e}")))??;
    let stderr = stderr_handle
        .await
        .map_err(|e| ProcessError::OutputCaptureFailed(format!("stderr task join error: {e}")))??;

    Ok(CapturedOutput {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
        timed_out: false,
    })
}

/// Spawn `sh -c <command>` in its own process group with stdout/stderr
/// redirected to the given files.
pub fn spawn_logged(
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<Child, ProcessError> {
    let stdout = std::fs::File::create(stdout_path)?;
    let stderr = std::fs::File::create(stderr_path)?;
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env.iter())
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error("sh", e))
}

/// Run a shell command to completion with output in files. Returns the exit
/// code, [`TIMEOUT_EXIT_CODE`] if the timeout fired.
pub async fn run_logged(
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    stdout_path: &Path,
    stderr_path: &Path,
    timeout: Duration,
) -> Result<i32, ProcessError> {
    let mut child = spawn_logged(command, cwd, env, stdout_path, stderr_path)?;
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(status?.code().unwrap_or(-1)),
        Err(_) => {
            tracing::warn!(command, timeout_secs = timeout.as_secs(), "command timed out");
            kill_group(&mut child).await;
            Ok(TIMEOUT_EXIT_CODE)
        }
    }
}

/// Send `signal` to the process group led by `pid`.
pub fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with a negated pid only signals that process group.
    unsafe { libc::kill(-pid, signal) == 0 }
}

/// Send `signal` to the single process `pid`.
pub fn signal_process(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid, signal) == 0 }
}

/// Whether a process with this pid exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    if !signal_process(pid, 0) {
        return false;
    }
    // Zombies answer kill(0) until their new parent reaps them.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next())
            .is_none_or(|state| state != 'Z'),
        Err(_) => true,
    }
}

async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGKILL);
    }
    let _ = child.kill().await;
}

/// SIGTERM the child's process group, wait up to `grace`, then SIGKILL.
///
/// Returns once the direct child has been reaped.
pub async fn terminate_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    signal_group(pid, libc::SIGTERM);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            // Stragglers that ignored SIGTERM still go.
            signal_group(pid, libc::SIGKILL);
        }
        Err(_) => {
            tracing::warn!(pid, "process group ignored SIGTERM, killing");
            kill_group(child).await;
        }
    }
}

/// Last `max_chars` characters of `text`, for error excerpts.
pub fn tail_excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}
