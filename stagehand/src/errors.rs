//! Typed error values carried inside [`anyhow::Error`].
//!
//! Callers classify failures with `err.downcast_ref::<T>()` instead of matching
//! on message text.

use std::time::Duration;

use thiserror::Error;

/// Persisted state was written by a pipeline with a different definition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "session '{session_id}' was started with stages [{persisted}] (max_iterations={persisted_max_iterations}) \
     but the pipeline declares [{declared}] (max_iterations={declared_max_iterations})"
)]
pub struct ConfigurationMismatch {
    pub session_id: String,
    pub persisted: String,
    pub declared: String,
    pub persisted_max_iterations: u32,
    pub declared_max_iterations: u32,
}

/// A stage handler returned an error; the run is now in the `failed` state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("stage '{stage}' failed after {elapsed_ms}ms (resume with session '{session_id}')")]
pub struct StageFailed {
    pub session_id: String,
    pub stage: String,
    pub elapsed_ms: u64,
}

/// A retried operation kept failing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed after {attempts} attempt(s)")]
pub struct RetriesExhausted {
    pub operation: String,
    pub attempts: u32,
}

/// The external mutation target refused a change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("mutation '{change}' rejected: {reason}")]
pub struct MutationRejected {
    pub change: String,
    pub reason: String,
}

/// The external mutation target did not answer within its timeout.
///
/// Unlike [`MutationRejected`] this is transient: an idempotent change may be
/// retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("mutation '{change}' timed out after {timeout:?}")]
pub struct MutationTimedOut {
    pub change: String,
    pub timeout: Duration,
}

/// Failures of the generative subsystem.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generator '{program}' could not be started: {reason}")]
    Spawn { program: String, reason: String },
    #[error("generator timed out after {0:?}")]
    TimedOut(Duration),
    #[error("generator exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
}
