//! Key-value store errors.

use thiserror::Error;

/// Key-value store error types.
#[derive(Debug, Error)]
pub enum KvError {
    /// Store is unreachable or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Stored value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}
