//! `uiqa-service`: UI quality-check pipeline service.
//!
//! One binary, two roles:
//! - `serve`: control plane on a Unix domain socket speaking
//!   JSON-RPC-lite; owns the run store, the event bus and the single
//!   worker supervisor.
//! - `worker`: the supervised task consumer; claims queued runs and
//!   drives each one through the orchestrator, forwarding progress
//!   events to the control plane.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod analysis;
pub mod client;
pub mod config;
pub mod consumer;
pub mod export;
pub mod fetch;
pub mod ipc;
pub mod issues;
pub mod orchestrator;
pub mod parse;
pub mod persistence;
pub mod process;
pub mod protocol;
pub mod runner;
pub mod triage;
pub mod worker;

/// Protocol version for the control socket.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "uiqa.sock";

/// Get the default socket path using XDG_RUNTIME_DIR.
///
/// Falls back to `/tmp/uiqa-<username>.sock` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> std::path::PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        std::path::PathBuf::from(runtime_dir).join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        std::path::PathBuf::from(format!("/tmp/uiqa-{user}.sock"))
    }
}
