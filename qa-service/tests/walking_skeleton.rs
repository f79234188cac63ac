#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Walking-skeleton test of the control plane over a real socket.
//!
//! Proves the outer surface:
//!   1. Start the control plane on a temp socket
//!   2. Handshake
//!   3. Submit a run, read it back, list it
//!   4. Stream events: a subscriber sees what is published after it
//!      attached, and only that
//!   5. Cancel a queued run; cancelling again is rejected
//!   6. Worker status with no worker running

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use uiqa_core::EventBus;
use uiqa_service::PROTOCOL_VERSION;
use uiqa_service::config::WorkerConfig;
use uiqa_service::ipc::{ServiceState, bind_listener, serve};
use uiqa_service::persistence::RunStore;
use uiqa_service::worker::{WorkerEndpoints, WorkerManager};

/// Stateful client that keeps a single connection + buffered reader.
struct TestClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl TestClient {
    fn connect(socket_path: &Path) -> Self {
        let stream = UnixStream::connect(socket_path).expect("Failed to connect to control plane");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let writer = stream.try_clone().expect("clone stream");
        let reader = BufReader::new(stream);
        Self { writer, reader }
    }

    fn send(&mut self, msg: &Value) {
        let mut bytes = serde_json::to_vec(msg).expect("serialize");
        bytes.push(b'\n');
        self.writer.write_all(&bytes).expect("write");
        self.writer.flush().expect("flush");
    }

    fn read_frame(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read frame");
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("parse frame: {e}\nraw: {line}"))
    }

    fn rpc(&mut self, msg: Value) -> Value {
        self.send(&msg);
        self.read_frame()
    }

    fn handshake(&mut self) {
        let resp = self.rpc(json!({"id": 0, "method": "hello"}));
        assert_eq!(
            resp["result"]["protocol_version"].as_str(),
            Some(PROTOCOL_VERSION),
            "Hello should succeed: {resp}"
        );
    }
}

/// Start the control plane in the background.
async fn start_service(dir: &Path) -> (PathBuf, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let socket_path = dir.join("uiqa-test.sock");
    let state = Arc::new(ServiceState {
        store: Arc::new(RunStore::open(dir.join("data")).unwrap()),
        bus: Arc::new(EventBus::new()),
        workers: Arc::new(WorkerManager::new(
            WorkerConfig::default(),
            WorkerEndpoints {
                data_dir: dir.join("data"),
                artifacts_dir: dir.join("artifacts"),
                socket_path: socket_path.clone(),
            },
        )),
    });
    let listener = bind_listener(&socket_path).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        serve(state, listener, shutdown_rx).await.unwrap();
    });
    (socket_path, shutdown_tx, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn walking_skeleton_e2e() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let (socket_path, shutdown, server_handle) = start_service(temp_dir.path()).await;

    let mut client = TestClient::connect(&socket_path);

    // 1. Handshake
    client.handshake();

    // 2. Submit a run with defaults
    let submit = client.rpc(json!({
        "id": 1,
        "method": "run.submit",
        "params": {"repo_url": "https://github.com/acme/shop.git", "suite": "smoke"}
    }));
    let run = &submit["result"];
    assert_eq!(run["status"], "queued", "run.submit should succeed: {submit}");
    assert_eq!(run["suite"], "smoke");
    assert_eq!(run["app_dir"], ".");
    assert!(run["finished_at"].is_null());
    let run_id = run["id"].as_str().unwrap().to_string();

    // 3. Read back and list
    let get = client.rpc(json!({"id": 2, "method": "run.get", "params": {"run_id": run_id}}));
    assert_eq!(get["result"]["id"], run_id.as_str());
    let list = client.rpc(json!({"id": 3, "method": "run.list"}));
    assert_eq!(list["result"].as_array().unwrap().len(), 1);

    // 4. Event stream
    let mut subscriber = TestClient::connect(&socket_path);
    subscriber.send(&json!({"id": 4, "method": "events.subscribe", "params": {"run_id": run_id}}));
    let first = subscriber.read_frame();
    assert_eq!(first["retry"], 1000, "first frame is the retry hint: {first}");

    client.send(&json!({
        "method": "events.publish",
        "params": {"run_id": run_id, "event": {"type": "step", "step": "clone_repo", "status": "started"}}
    }));
    let event = subscriber.read_frame();
    assert_eq!(event, json!({"type": "step", "step": "clone_repo", "status": "started"}));

    // A subscriber attaching now never sees the event above.
    let mut late = TestClient::connect(&socket_path);
    late.send(&json!({"id": 5, "method": "events.subscribe", "params": {"run_id": run_id}}));
    assert_eq!(late.read_frame()["retry"], 1000);
    client.send(&json!({
        "method": "events.publish",
        "params": {"run_id": run_id, "event": {"type": "log", "level": "info", "message": "hello"}}
    }));
    assert_eq!(late.read_frame()["message"], "hello");
    assert_eq!(subscriber.read_frame()["message"], "hello");

    // 5. Cancel
    let cancel = client.rpc(json!({"id": 6, "method": "run.cancel", "params": {"run_id": run_id}}));
    assert_eq!(cancel["result"]["status"], "cancelled", "{cancel}");
    assert!(!cancel["result"]["finished_at"].is_null());
    let again = client.rpc(json!({"id": 7, "method": "run.cancel", "params": {"run_id": run_id}}));
    assert_eq!(again["error"]["code"].as_i64(), Some(-32002));

    // 6. Worker status
    let status = client.rpc(json!({"id": 8, "method": "worker.status"}));
    assert_eq!(status["result"]["running"], false);
    assert_eq!(status["result"]["mode"], "local");
    let stop = client.rpc(json!({"id": 9, "method": "worker.stop"}));
    assert_eq!(
        stop["result"],
        json!({"success": false, "error": "Worker is not running"})
    );

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .expect("server stops on shutdown")
        .unwrap();
}

/// Test that unknown methods return proper errors.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn walking_skeleton_unknown_method() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let (socket_path, _shutdown, server_handle) = start_service(temp_dir.path()).await;

    let mut client = TestClient::connect(&socket_path);
    client.handshake();

    let resp = client.rpc(json!({"id": 1, "method": "nonexistent.method"}));
    assert_eq!(resp["error"]["code"].as_i64(), Some(-32601), "{resp}");

    let resp = client.rpc(json!({"id": 2, "method": "run.get", "params": {}}));
    assert_eq!(resp["error"]["code"].as_i64(), Some(-32602), "{resp}");

    server_handle.abort();
}
