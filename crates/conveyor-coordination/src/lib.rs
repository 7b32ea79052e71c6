//! # Conveyor Coordination
//!
//! Cross-replica coordination primitives backed by a shared store.
//!
//! ## Features
//!
//! - Distributed lock with fencing tokens and TTL auto-refresh
//! - Scoped lock acquisition with guaranteed release
//! - Idempotency records with canonical key generation

pub mod config;
pub mod error;
pub mod idempotency;
pub mod lock;

pub use config::CoordinationConfig;
pub use error::CoordinationError;
pub use idempotency::{IdempotencyRecord, IdempotencyStore, RunIdempotentOptions};
pub use lock::{LockGuard, LockManager, WithLockOptions};
