//! Queue errors.

use thiserror::Error;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// No handler registered for a job name.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// Queue is full.
    #[error("Queue is full")]
    QueueFull,

    /// Operation is not valid for the job's state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    WorkerError(String),

    /// Persistence error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Job execution failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}
