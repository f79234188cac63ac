//! Task consumer: claims queued runs and hands them to the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uiqa_core::qa::RunStatus;

use crate::orchestrator::RunOrchestrator;
use crate::persistence::{PersistenceError, RunStore};

pub struct TaskConsumer {
    store: Arc<RunStore>,
    orchestrator: Arc<RunOrchestrator>,
    poll_interval: Duration,
}

impl TaskConsumer {
    pub fn new(
        store: Arc<RunStore>,
        orchestrator: Arc<RunOrchestrator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            poll_interval,
        }
    }

    /// Settle claims a previous consumer left behind. Returns how many were
    /// settled.
    pub async fn recover(&self) -> Result<usize, PersistenceError> {
        let stale = self.store.stale_claims()?;
        for run_id in &stale {
            tracing::warn!(run_id = %run_id, "recovering stale claim");
            self.settle(run_id).await?;
        }
        Ok(stale.len())
    }

    /// Claim and process at most one queued run.
    pub async fn run_once(&self) -> Result<Option<(String, RunStatus)>, PersistenceError> {
        let Some(run_id) = self.store.claim_next()? else {
            return Ok(None);
        };
        let status = self.settle(&run_id).await?;
        Ok(Some((run_id, status)))
    }

    async fn settle(&self, run_id: &str) -> Result<RunStatus, PersistenceError> {
        let outcome = self.orchestrator.process(run_id).await;
        self.store.complete_claim(run_id)?;
        match outcome {
            Ok(status) => {
                tracing::info!(run_id, %status, "run settled");
                Ok(status)
            }
            Err(PersistenceError::NotFound { .. }) => {
                tracing::warn!(run_id, "claimed run has no record, dropping claim");
                Ok(RunStatus::Failed)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until `shutdown` flips to true. Store errors are logged and the
    /// loop keeps going.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self.recover().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(recovered = n, "stale claims settled"),
            Err(e) => tracing::error!("claim recovery failed: {e}"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                // Drain the queue before sleeping again.
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!("queue poll failed: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("task consumer stopped");
    }
}
