//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The scheduler rejected the task (quota, validation). Never retried.
    #[error("submission rejected: {0}")]
    Submission(String),

    /// Scheduler or store connectivity problem that may succeed on retry.
    #[error("transient error: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the operation that produced this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
