//! Monitor errors.

use thiserror::Error;

/// Monitor error types.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Execution record not found.
    #[error("Execution not found: {0}")]
    NotFound(String),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}
