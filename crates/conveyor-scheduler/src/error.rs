//! Scheduler errors.

use thiserror::Error;

/// Scheduler error types.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Cron pattern failed to parse.
    #[error("Invalid cron pattern: {0}")]
    InvalidPattern(String),

    /// No schedule registered under the name.
    #[error("Scheduled task not found: {0}")]
    TaskNotFound(String),

    /// Enqueue onto the job queue failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Task config source failed.
    #[error("Config source error: {0}")]
    ConfigSource(String),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}
