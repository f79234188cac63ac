//! Control-socket client, and the event sink a worker forwards through.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use uiqa_core::{EventSink, RunEvent};

use crate::protocol::{PublishParams, RetryFrame, RpcRequest, RpcResponse, encode_line};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{message} (code {code})")]
    Rpc { code: i64, message: String },

    #[error("connection closed by the control plane")]
    Closed,
}

async fn connect(path: &Path) -> Result<UnixStream, ClientError> {
    UnixStream::connect(path)
        .await
        .map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })
}

/// Request/response client over one connection.
pub struct ServiceClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl ServiceClient {
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let (reader, writer) = connect(path).await?.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 0,
        })
    }

    pub async fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.next_id += 1;
        let request = RpcRequest {
            id: Some(json!(self.next_id)),
            method: method.to_string(),
            params,
        };
        self.writer.write_all(&encode_line(&request)).await?;
        self.writer.flush().await?;

        let line = self.lines.next_line().await?.ok_or(ClientError::Closed)?;
        let response: RpcResponse = serde_json::from_str(&line)?;
        match (response.result, response.error) {
            (_, Some(error)) => Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }

    pub async fn hello(&mut self) -> Result<Value, ClientError> {
        self.call("hello", None).await
    }

    /// Switch this connection to the event stream of `run_id`.
    pub async fn subscribe(mut self, run_id: &str) -> Result<EventSubscription, ClientError> {
        self.next_id += 1;
        let request = RpcRequest {
            id: Some(json!(self.next_id)),
            method: "events.subscribe".to_string(),
            params: Some(json!({ "run_id": run_id })),
        };
        self.writer.write_all(&encode_line(&request)).await?;
        self.writer.flush().await?;

        let line = self.lines.next_line().await?.ok_or(ClientError::Closed)?;
        let first: Value = serde_json::from_str(&line)?;
        if let Some(error) = first.get("error") {
            let error: crate::protocol::RpcError = serde_json::from_value(error.clone())?;
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        let retry: RetryFrame = serde_json::from_value(first)?;
        Ok(EventSubscription {
            retry_ms: retry.retry,
            lines: self.lines,
            _writer: self.writer,
        })
    }
}

/// Live event stream for one run.
pub struct EventSubscription {
    pub retry_ms: u64,
    lines: Lines<BufReader<OwnedReadHalf>>,
    _writer: OwnedWriteHalf,
}

impl EventSubscription {
    /// Next event; `None` once the control plane closes the stream.
    pub async fn next(&mut self) -> Result<Option<RunEvent>, ClientError> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

/// Forwards events to the control plane as `events.publish` notifications.
///
/// `publish` never blocks: events are queued to a background task that
/// (re)connects lazily. With no control plane reachable, events are dropped.
pub struct ForwardingSink {
    tx: mpsc::UnboundedSender<PublishParams>,
}

impl ForwardingSink {
    /// Must be called inside a tokio runtime.
    pub fn spawn(socket_path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(socket_path, rx));
        Self { tx }
    }
}

impl EventSink for ForwardingSink {
    fn publish(&self, run_id: &str, event: RunEvent) {
        let _ = self.tx.send(PublishParams {
            run_id: run_id.to_string(),
            event,
        });
    }
}

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

async fn forward(socket_path: PathBuf, mut rx: mpsc::UnboundedReceiver<PublishParams>) {
    let mut conn: Option<UnixStream> = None;
    let mut last_attempt: Option<tokio::time::Instant> = None;

    while let Some(params) = rx.recv().await {
        if conn.is_none() {
            let due = last_attempt.is_none_or(|at| at.elapsed() >= RECONNECT_BACKOFF);
            if !due {
                continue;
            }
            last_attempt = Some(tokio::time::Instant::now());
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => conn = Some(stream),
                Err(e) => {
                    tracing::debug!(path = %socket_path.display(), "control plane unreachable: {e}");
                    continue;
                }
            }
        }

        let request = RpcRequest {
            id: None,
            method: "events.publish".to_string(),
            params: serde_json::to_value(&params).ok(),
        };
        if let Some(stream) = conn.as_mut()
            && let Err(e) = stream.write_all(&encode_line(&request)).await
        {
            tracing::debug!("event forward failed, dropping connection: {e}");
            conn = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::ipc::{ServiceState, bind_listener, serve};
    use crate::persistence::RunStore;
    use crate::worker::{WorkerEndpoints, WorkerManager};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::sync::watch;
    use uiqa_core::EventBus;

    async fn start_service(dir: &Path) -> (PathBuf, Arc<EventBus>, watch::Sender<bool>) {
        let socket = dir.join("uiqa.sock");
        let bus = Arc::new(EventBus::new());
        let state = Arc::new(ServiceState {
            store: Arc::new(RunStore::open(dir.join("data")).unwrap()),
            bus: Arc::clone(&bus),
            workers: Arc::new(WorkerManager::new(
                WorkerConfig::default(),
                WorkerEndpoints {
                    data_dir: dir.join("data"),
                    artifacts_dir: dir.join("artifacts"),
                    socket_path: socket.clone(),
                },
            )),
        });
        let listener = bind_listener(&socket).unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(state, listener, rx));
        (socket, bus, tx)
    }

    #[tokio::test]
    async fn hello_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (socket, _bus, _shutdown) = start_service(tmp.path()).await;

        let mut client = ServiceClient::connect(&socket).await.unwrap();
        let hello = client.hello().await.unwrap();
        assert_eq!(hello["protocol_version"], crate::PROTOCOL_VERSION);

        let err = client
            .call("run.get", Some(json!({"run_id": "missing"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rpc { code: -32001, .. }));
    }

    #[tokio::test]
    async fn forwarded_events_reach_a_socket_subscriber() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (socket, bus, _shutdown) = start_service(tmp.path()).await;

        let mut subscription = ServiceClient::connect(&socket)
            .await
            .unwrap()
            .subscribe("run-1")
            .await
            .unwrap();
        assert_eq!(subscription.retry_ms, 1000);
        // The bus channel exists once the subscriber is attached.
        assert_eq!(bus.channel_count(), 1);

        let sink = ForwardingSink::spawn(socket.clone());
        sink.publish("run-1", RunEvent::started("clone_repo"));
        sink.publish("run-1", RunEvent::finished("clone_repo", None));

        let first = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, Some(RunEvent::started("clone_repo")));
        let second = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, Some(RunEvent::finished("clone_repo", None)));
    }

    #[tokio::test]
    async fn forwarding_without_control_plane_is_silent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sink = ForwardingSink::spawn(tmp.path().join("absent.sock"));
        sink.publish("run-1", RunEvent::started("triage"));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
