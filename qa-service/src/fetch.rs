//! Shallow repository checkout for a run's scratch location.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::CloneConfig;
use crate::process::{self, ProcessError};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Command failed: {command} (exit {exit_code})")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{command} timed out after {timeout_secs}s")]
    TimedOut { command: String, timeout_secs: u64 },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Outcome of a successful checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedRepo {
    /// Head commit, when it could be determined.
    pub commit_sha: Option<String>,
}

#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Check out `branch` of `repo_url` into `dest`, which must not exist.
    async fn fetch(&self, repo_url: &str, branch: &str, dest: &Path)
    -> Result<FetchedRepo, FetchError>;
}

/// `git clone --depth 1 --branch <branch> -- <url> <dest>`.
pub struct GitFetcher {
    program: String,
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(config: &CloneConfig) -> Self {
        Self {
            program: config.program.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn head_commit(&self, dest: &Path) -> Option<String> {
        let args = vec!["rev-parse".to_string(), "HEAD".to_string()];
        match process::capture(
            &self.program,
            &args,
            dest,
            &HashMap::new(),
            None,
            Duration::from_secs(30),
        )
        .await
        {
            Ok(out) if out.success() => {
                let sha = out.stdout.trim();
                (!sha.is_empty()).then(|| sha.to_string())
            }
            Ok(out) => {
                tracing::debug!(exit_code = out.exit_code, "rev-parse failed");
                None
            }
            Err(e) => {
                tracing::debug!("rev-parse failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(
        &self,
        repo_url: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<FetchedRepo, FetchError> {
        let args = vec![
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
            "--branch".to_string(),
            branch.to_string(),
            "--".to_string(),
            repo_url.to_string(),
            dest.to_string_lossy().to_string(),
        ];
        let command = render_command(&self.program, &args);
        let cwd = dest.parent().unwrap_or_else(|| Path::new("."));

        tracing::info!(%command, "cloning repository");
        let out = process::capture(&self.program, &args, cwd, &HashMap::new(), None, self.timeout)
            .await?;
        if out.timed_out {
            return Err(FetchError::TimedOut {
                command,
                timeout_secs: self.timeout.as_secs(),
            });
        }
        if out.exit_code != 0 {
            return Err(FetchError::CommandFailed {
                command,
                exit_code: out.exit_code,
                stderr: out.stderr,
            });
        }

        Ok(FetchedRepo {
            commit_sha: self.head_commit(dest).await,
        })
    }
}

/// Shell-quoted rendering of a command line, for messages.
pub fn render_command(program: &str, args: &[String]) -> String {
    let words = std::iter::once(program).chain(args.iter().map(String::as_str));
    shlex::try_join(words).unwrap_or_else(|_| format!("{program} {}", args.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(program: &str) -> GitFetcher {
        GitFetcher::new(&CloneConfig {
            program: program.to_string(),
            timeout_secs: 10,
        })
    }

    #[tokio::test]
    async fn non_zero_exit_names_the_clone_command() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = fetcher("false")
            .fetch("https://example.invalid/repo.git", "main", &tmp.path().join("repo"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Command failed: false clone --depth 1 --branch main"));
        assert!(message.contains("(exit 1)"));
    }

    #[tokio::test]
    async fn successful_clone_without_head_has_no_sha() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = tmp.path().join("repo");
        std::fs::create_dir_all(&dest).unwrap();
        let fetched = fetcher("true")
            .fetch("https://example.invalid/repo.git", "main", &dest)
            .await
            .unwrap();
        assert_eq!(fetched, FetchedRepo::default());
    }

    #[tokio::test]
    async fn repository_url_is_never_read_as_an_option() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = fetcher("false")
            .fetch("--upload-pack=touch pwned", "main", &tmp.path().join("repo"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("--branch main -- '--upload-pack=touch pwned'"),
            "{message}"
        );
    }

    #[test]
    fn render_quotes_arguments_with_spaces() {
        let rendered = render_command("git", &["clone".to_string(), "a b".to_string()]);
        assert_eq!(rendered, "git clone 'a b'");
    }
}
