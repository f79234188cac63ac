//! Control-socket protocol.
//!
//! Newline-delimited JSON-RPC-lite: requests are
//! `{"id", "method", "params"}`; responses carry the same `id` and either
//! `result` or `error: {code, message}`. A request without an `id` is a
//! notification and gets no response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uiqa_core::RunEvent;

use crate::worker::WorkerMode;

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

/// Service-specific error codes.
pub const ERR_NOT_FOUND: i64 = -32001;
pub const ERR_INVALID_TRANSITION: i64 = -32002;
pub const ERR_WORKER: i64 = -32003;

/// First frame of every event stream.
pub const STREAM_RETRY_MS: u64 = 1000;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ERR_INTERNAL, message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Newline-terminated wire form.
    pub fn to_line(&self) -> Vec<u8> {
        encode_line(self)
    }
}

/// Serialize `value` as one NDJSON line.
pub fn encode_line<T: Serialize>(value: &T) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    bytes.push(b'\n');
    bytes
}

// ─────────────────────────────────────────────────────────────────────────────
// hello
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// run.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdParams {
    pub run_id: String,
}

fn default_list_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListParams {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

impl Default for RunListParams {
    fn default() -> Self {
        Self {
            limit: default_list_limit(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// events.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishParams {
    pub run_id: String,
    pub event: RunEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryFrame {
    pub retry: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// worker.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStartParams {
    #[serde(default)]
    pub mode: WorkerMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_log_lines() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLogsParams {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

impl Default for WorkerLogsParams {
    fn default() -> Self {
        Self {
            lines: default_log_lines(),
        }
    }
}

/// Outcome of `worker.start` / `worker.stop`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WorkerMode>,
}

impl WorkerActionResult {
    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLogsResult {
    pub logs: Vec<String>,
}
