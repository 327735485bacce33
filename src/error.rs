//! Error taxonomy for the scheduler core

use thiserror::Error;

/// Errors from the work queue.
///
/// `EmptyPartition` is an expected, recoverable condition: the dispatch loop
/// polls every partition non-blockingly and simply moves on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("no pending batches for model '{model}' (session {session:?})")]
    EmptyPartition {
        model: String,
        session: Option<String>,
    },
}

/// Classified instance fault, produced by the health checkers (or by the
/// provisioning backend through them).
///
/// Retriable faults unlock the instance and resubmit its in-flight batch;
/// fatal faults tear the instance down and surface a failure response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("retriable instance fault: {0}")]
    Retriable(String),
    #[error("fatal instance fault: {0}")]
    Fatal(String),
}

impl HealthError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HealthError::Fatal(_))
    }
}
