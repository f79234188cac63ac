//! Root of the `uiqa-core` library.
//!
//! Shared model for UI-QA runs: the run state machine, bug records and
//! their stable ids, artifacts, issue links, and the per-run event bus.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod events;
pub mod qa;

pub use events::EventBus;
pub use events::EventSink;
pub use events::EventStream;
pub use events::RunEvent;
