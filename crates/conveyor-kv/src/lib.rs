//! # Conveyor KV
//!
//! Shared key-value store abstraction for cross-replica coordination.
//!
//! ## Features
//!
//! - Atomic set-if-absent with expiry
//! - Atomic compare-and-delete / compare-and-extend (fencing)
//! - Plain get/set/delete with TTL
//! - In-memory reference implementation

pub mod error;
pub mod store;

pub use error::KvError;
pub use store::{MemoryKvStore, SharedStore};
