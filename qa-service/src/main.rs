//! `uiqa-service` entry point.
//!
//! ## Modes
//!
//! - **`serve`**: bind the control socket, own the run store, the event bus
//!   and the worker supervisor. `--inline-worker` also runs the task
//!   consumer in-process.
//! - **`worker`**: the supervised consumer. Claims queued runs and forwards
//!   progress events to the control plane.
//! - **`ping`**: hello handshake against a running control plane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use uiqa_core::{EventBus, EventSink};
use uiqa_service::client::{ForwardingSink, ServiceClient};
use uiqa_service::config::{ConfigLoader, ServiceConfig};
use uiqa_service::consumer::TaskConsumer;
use uiqa_service::ipc::{ServiceState, bind_listener, serve};
use uiqa_service::orchestrator::RunOrchestrator;
use uiqa_service::persistence::RunStore;
use uiqa_service::worker::{WorkerEndpoints, WorkerManager};

#[derive(Debug, Parser)]
#[command(name = "uiqa-service", version, about = "UI quality-check pipeline service")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Also consume the run queue in this process.
        #[arg(long)]
        inline_worker: bool,
    },
    /// Run the task consumer.
    Worker,
    /// Check that a control plane is answering.
    Ping,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load_default(cli.config.as_deref())?;
    run(cli.command, config)
}

#[tokio::main]
async fn run(command: Command, config: ServiceConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match command {
        Command::Serve { inline_worker } => run_control_plane(config, inline_worker).await,
        Command::Worker => run_worker(config).await,
        Command::Ping => ping(&config).await,
    }
}

async fn ping(config: &ServiceConfig) -> anyhow::Result<()> {
    let path = config.socket_path();
    let mut client = tokio::time::timeout(Duration::from_secs(10), ServiceClient::connect(&path))
        .await
        .context("ping: connect timed out")??;
    let hello = tokio::time::timeout(Duration::from_secs(10), client.hello())
        .await
        .context("ping: hello timed out")??;
    eprintln!(
        "ping: service is alive (version {})",
        hello["service_version"].as_str().unwrap_or("unknown")
    );
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

fn open_store(config: &ServiceConfig) -> anyhow::Result<Arc<RunStore>> {
    let store = RunStore::open(&config.data_dir).with_context(|| {
        format!("Failed to initialize run store at {}", config.data_dir.display())
    })?;
    tracing::info!("run store at {}", store.base_dir().display());
    Ok(Arc::new(store))
}

fn consumer(
    config: &ServiceConfig,
    store: Arc<RunStore>,
    events: Arc<dyn EventSink>,
) -> anyhow::Result<TaskConsumer> {
    let orchestrator = RunOrchestrator::from_config(config, Arc::clone(&store), events)?;
    Ok(TaskConsumer::new(
        store,
        Arc::new(orchestrator),
        Duration::from_millis(config.consumer.poll_interval_ms),
    ))
}

async fn run_control_plane(config: ServiceConfig, inline_worker: bool) -> anyhow::Result<()> {
    tracing::info!("uiqa-service v{} starting", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config)?;
    let bus = Arc::new(EventBus::new());
    let socket_path = config.socket_path();
    let workers = Arc::new(WorkerManager::new(
        config.worker.clone(),
        WorkerEndpoints {
            data_dir: config.data_dir.clone(),
            artifacts_dir: config.artifacts_dir.clone(),
            socket_path: socket_path.clone(),
        },
    ));

    let listener = bind_listener(&socket_path)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("signal received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    let inline = if inline_worker {
        let consumer = consumer(&config, Arc::clone(&store), Arc::clone(&bus) as Arc<dyn EventSink>)?;
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { consumer.run(rx).await }))
    } else {
        None
    };

    let state = Arc::new(ServiceState {
        store,
        bus,
        workers: Arc::clone(&workers),
    });
    serve(state, listener, shutdown_rx).await?;

    if let Some(handle) = inline {
        handle.abort();
    }
    if workers.status().await.running
        && let Err(e) = workers.stop().await
    {
        tracing::warn!("failed to stop worker: {e}");
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!("socket cleanup: {e}");
    }
    tracing::info!("uiqa-service exiting cleanly");
    Ok(())
}

async fn run_worker(config: ServiceConfig) -> anyhow::Result<()> {
    tracing::info!(
        socket = %config.socket_path().display(),
        "uiqa worker v{} starting",
        env!("CARGO_PKG_VERSION")
    );
    let store = open_store(&config)?;
    let events: Arc<dyn EventSink> = Arc::new(ForwardingSink::spawn(config.socket_path()));
    let consumer = consumer(&config, store, events)?;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    // Dropping the consumer future mid-run tears down its app servers; the
    // interrupted run is failed by the next consumer's recovery pass.
    tokio::select! {
        _ = consumer.run(shutdown_rx) => {}
        _ = shutdown_signal() => tracing::info!("signal received, worker exiting"),
    }
    Ok(())
}
