//! UI-QA domain primitives.
//!
//! - `run`: run record, submission, suite selection, lifecycle transitions
//! - `bug`: normalized bug records, severity taxonomy, stable `bug_id`
//! - `artifacts`: artifact records and issue links

pub mod artifacts;
pub mod bug;
pub mod run;

pub use artifacts::{ArtifactKind, ArtifactRecord, IssueRef};
pub use bug::{BugRecord, RawBug, Severity, bug_id};
pub use run::{
    RunRecord, RunStatus, RunSubmission, RunSummary, SubmissionError, SuiteKind, SuiteOutcome,
    SuiteSelection, TransitionError,
};
