//! Unix domain socket control plane.
//!
//! Accepts connections, reads newline-delimited JSON-RPC-lite messages and
//! dispatches them against the store, the event bus and the worker
//! supervisor. `events.subscribe` turns the connection into a one-way
//! event stream until the client disconnects.

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use uiqa_core::EventBus;
use uiqa_core::qa::RunSubmission;

use crate::PROTOCOL_VERSION;
use crate::persistence::{PersistenceError, RunStore};
use crate::protocol::*;
use crate::worker::WorkerManager;

/// Everything the control plane serves.
pub struct ServiceState {
    pub store: Arc<RunStore>,
    pub bus: Arc<EventBus>,
    pub workers: Arc<WorkerManager>,
}

/// Bind the control socket, replacing a stale socket file.
pub fn bind_listener(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("control plane listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until `shutdown` flips to true.
pub async fn serve(
    state: Arc<ServiceState>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream).await {
                            tracing::debug!("connection closed with error: {e}");
                        }
                    });
                }
                Err(e) => tracing::error!("accept error: {e}"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// What to do after one message.
enum Dispatch {
    Reply(RpcResponse),
    /// Notification; nothing is written back.
    Silent,
    Subscribe { id: Option<Value>, run_id: String },
}

async fn handle_connection(state: Arc<ServiceState>, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match dispatch_message(&state, trimmed).await {
            Dispatch::Reply(response) => {
                writer.write_all(&response.to_line()).await?;
                writer.flush().await?;
            }
            Dispatch::Silent => {}
            Dispatch::Subscribe { id, run_id } => {
                return stream_events(&state.bus, &run_id, id, reader, writer).await;
            }
        }
    }
    Ok(())
}

/// Forward every event for `run_id` until the client goes away.
async fn stream_events(
    bus: &EventBus,
    run_id: &str,
    id: Option<Value>,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
) -> std::io::Result<()> {
    // Attach before the first frame so nothing published after the
    // client sees it is missed.
    let mut events = bus.subscribe(run_id);
    tracing::debug!(run_id, "event subscriber attached");

    let mut first = serde_json::to_value(RetryFrame {
        retry: STREAM_RETRY_MS,
    })
    .unwrap_or_default();
    if let (Some(id), Some(obj)) = (id, first.as_object_mut()) {
        obj.insert("id".to_string(), id);
    }
    writer.write_all(&encode_line(&first)).await?;
    writer.flush().await?;

    let mut scratch = String::new();
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                writer.write_all(&encode_line(&event)).await?;
                writer.flush().await?;
            }
            read = reader.read_line(&mut scratch) => {
                // Anything but more input means the client is gone.
                if read? == 0 {
                    break;
                }
                scratch.clear();
            }
        }
    }
    tracing::debug!(run_id, "event subscriber detached");
    Ok(())
}

async fn dispatch_message(state: &ServiceState, raw: &str) -> Dispatch {
    let request: RpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            return Dispatch::Reply(RpcResponse::err(
                Value::Null,
                RpcError::new(ERR_INVALID_REQUEST, format!("Invalid JSON-RPC: {e}")),
            ));
        }
    };

    match request.method.as_str() {
        "events.publish" => {
            handle_publish(state, request.params);
            return match request.id {
                Some(id) => Dispatch::Reply(RpcResponse::ok(id, json!({}))),
                None => Dispatch::Silent,
            };
        }
        "events.subscribe" => {
            return match parse_params::<RunIdParams>(request.params, "events.subscribe") {
                Ok(params) => Dispatch::Subscribe {
                    id: request.id,
                    run_id: params.run_id,
                },
                Err(error) => Dispatch::Reply(RpcResponse::err(
                    request.id.unwrap_or(Value::Null),
                    error,
                )),
            };
        }
        _ => {}
    }

    let result = dispatch_method(state, &request.method, request.params).await;
    let Some(id) = request.id else {
        if let Err(error) = result {
            tracing::debug!(method = %request.method, "notification failed: {}", error.message);
        }
        return Dispatch::Silent;
    };
    Dispatch::Reply(match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(error) => RpcResponse::err(id, error),
    })
}

async fn dispatch_method(
    state: &ServiceState,
    method: &str,
    params: Option<Value>,
) -> Result<Value, RpcError> {
    match method {
        "hello" => handle_hello(),
        "run.submit" => {
            let submission: RunSubmission = parse_params(params, method)?;
            let run = state.store.submit(submission).map_err(|e| store_error_to_rpc(&e))?;
            tracing::info!(run_id = %run.id, repo = %run.repo_url, "run submitted");
            to_value(&run)
        }
        "run.get" => {
            let params: RunIdParams = parse_params(params, method)?;
            to_value(&state.store.read_run(&params.run_id).map_err(|e| store_error_to_rpc(&e))?)
        }
        "run.list" => {
            let params: RunListParams = parse_optional_params(params, method)?;
            to_value(&state.store.list_runs(params.limit).map_err(|e| store_error_to_rpc(&e))?)
        }
        "run.bugs" => {
            let params: RunIdParams = parse_params(params, method)?;
            to_value(&state.store.read_bugs(&params.run_id).map_err(|e| store_error_to_rpc(&e))?)
        }
        "run.artifacts" => {
            let params: RunIdParams = parse_params(params, method)?;
            to_value(
                &state
                    .store
                    .read_artifacts(&params.run_id)
                    .map_err(|e| store_error_to_rpc(&e))?,
            )
        }
        "run.issues" => {
            let params: RunIdParams = parse_params(params, method)?;
            to_value(&state.store.read_issues(&params.run_id).map_err(|e| store_error_to_rpc(&e))?)
        }
        "run.cancel" => {
            let params: RunIdParams = parse_params(params, method)?;
            to_value(&state.store.cancel(&params.run_id).map_err(|e| store_error_to_rpc(&e))?)
        }
        "worker.start" => {
            let params: WorkerStartParams = parse_optional_params(params, method)?;
            let result = match state
                .workers
                .start(params.mode, params.api_key.as_deref())
                .await
            {
                Ok(started) => WorkerActionResult {
                    success: true,
                    error: None,
                    pid: Some(started.pid),
                    mode: Some(started.mode),
                },
                Err(e) => WorkerActionResult::failed(e),
            };
            to_value(&result)
        }
        "worker.stop" => {
            let result = match state.workers.stop().await {
                Ok(()) => WorkerActionResult {
                    success: true,
                    ..WorkerActionResult::default()
                },
                Err(e) => WorkerActionResult::failed(e),
            };
            to_value(&result)
        }
        "worker.status" => to_value(&state.workers.status().await),
        "worker.logs" => {
            let params: WorkerLogsParams = parse_optional_params(params, method)?;
            to_value(&WorkerLogsResult {
                logs: state.workers.logs(params.lines),
            })
        }
        _ => Err(RpcError::new(
            ERR_METHOD_NOT_FOUND,
            format!("Unknown method: {method}"),
        )),
    }
}

fn handle_hello() -> Result<Value, RpcError> {
    to_value(&HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: [
            "run.submit",
            "run.get",
            "run.list",
            "run.bugs",
            "run.artifacts",
            "run.issues",
            "run.cancel",
            "events.publish",
            "events.subscribe",
            "worker.start",
            "worker.stop",
            "worker.status",
            "worker.logs",
        ]
        .iter()
        .map(ToString::to_string)
        .collect(),
    })
}

/// Fire-and-forget: malformed publishes are dropped.
fn handle_publish(state: &ServiceState, params: Option<Value>) {
    match parse_params::<PublishParams>(params, "events.publish") {
        Ok(params) => {
            state.bus.send(&params.run_id, params.event);
        }
        Err(error) => tracing::debug!("dropping malformed event: {}", error.message),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>, method: &str) -> Result<T, RpcError> {
    let params = params.ok_or_else(|| RpcError::invalid_params("Missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(format!("Invalid {method} params: {e}")))
}

fn parse_optional_params<T: DeserializeOwned + Default>(
    params: Option<Value>,
    method: &str,
) -> Result<T, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(params) => parse_params(Some(params), method),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(format!("Serialize error: {e}")))
}

/// Map PersistenceError to a JSON-RPC error.
fn store_error_to_rpc(err: &PersistenceError) -> RpcError {
    let code = match err {
        PersistenceError::NotFound { .. } => ERR_NOT_FOUND,
        PersistenceError::InvalidRunId { .. } | PersistenceError::Submission(_) => {
            ERR_INVALID_PARAMS
        }
        PersistenceError::Transition(_) | PersistenceError::AlreadyClaimed { .. } => {
            ERR_INVALID_TRANSITION
        }
        PersistenceError::Io(_) | PersistenceError::Serde(_) => ERR_INTERNAL,
    };
    RpcError::new(code, err.to_string())
}
