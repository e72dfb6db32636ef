// Error taxonomy — fatal conditions that reach the job level, plus the
// soft-error type optional resolver steps are allowed to fail with.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal pipeline conditions. Everything else is retried and logged inside
/// the component that hit it.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The challenge page came back again after a full session refresh.
    #[error("challenge persisted after session refresh (HTTP {status})")]
    ChallengeLoop { status: u16 },

    /// The resolver could not obtain the mandatory transfer target.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// The transfer retry budget (attempts or wall clock) ran out. The
    /// partial file is left in place to seed the next attempt.
    #[error("transfer gave up after {attempts} attempts: {reason}")]
    TransferExhausted { attempts: u32, reason: String },

    /// A segment could not be fetched or decrypted; aborts one episode only.
    #[error("segment {index} failed: {reason}")]
    Segment { index: usize, reason: String },

    /// The external re-encode step failed. The raw intermediate file is
    /// preserved for inspection.
    #[error("re-encode failed for {}: {reason}", raw_path.display())]
    Encode { raw_path: PathBuf, reason: String },

    /// The job was cancelled between units of work.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure of an optional resolver step. The orchestrator logs it and moves
/// on; it never aborts resolution.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SoftError(pub String);

impl SoftError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<anyhow::Error> for SoftError {
    fn from(err: anyhow::Error) -> Self {
        Self(err.to_string())
    }
}

/// Outcome of a cancel request against the task tracker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("task not found")]
    NotFound,
    /// The task already reached a terminal state; its record is unchanged.
    #[error("task is {0} and cannot be cancelled")]
    Conflict(&'static str),
}
