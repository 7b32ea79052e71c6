//! # Conveyor Monitor
//!
//! Execution history recording and aggregate queries.
//!
//! ## Features
//!
//! - Durable per-execution records (active/completed/failed)
//! - Paginated, filterable history queries
//! - Success-rate and duration statistics over trailing windows
//! - Retention cleanup for old records
//! - SQLite and in-memory log stores

pub mod error;
pub mod monitor;
pub mod record;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use error::MonitorError;
pub use monitor::ExecutionMonitor;
pub use record::{ExecutionOutcome, ExecutionRecord, ExecutionStats, ExecutionStatus, HistoryQuery};
pub use sqlite::SqliteExecutionStore;
pub use store::{ExecutionLogStore, MemoryExecutionStore};
