//! Coordination errors.

use thiserror::Error;

/// Coordination error types.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Shared store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}
