//! # Conveyor
//!
//! Distributed job scheduling and execution engine.
//!
//! Jobs are independent, named units of work executed with bounded
//! concurrency by any number of cooperating process replicas. Recurring work
//! fires on cron patterns with at-most-one enqueue per tick across replicas,
//! coordinated through a shared key-value store. Every execution is recorded
//! for history and aggregate queries.
//!
//! ## Components
//!
//! - [`conveyor_kv`] — shared store boundary (atomic set-if-absent,
//!   compare-and-delete, compare-and-extend)
//! - [`conveyor_coordination`] — distributed locks with fencing tokens and
//!   idempotency records
//! - [`conveyor_queue`] — job queue with retry/backoff/retention and the
//!   worker pool
//! - [`conveyor_scheduler`] — cron scheduler with cross-replica tick locking
//! - [`conveyor_monitor`] — execution history and statistics
//!
//! The [`Engine`] wires them together behind one construction point.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use conveyor::queue::{JobContext, JobHandler, JobSpec, QueueError};
//! use conveyor::Engine;
//! use serde_json::Value;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     async fn execute(&self, _ctx: &JobContext, payload: &Value) -> Result<Value, QueueError> {
//!         // deliver the email described by `payload`
//!         Ok(Value::Null)
//!     }
//! }
//!
//! # async fn run() -> Result<(), conveyor::EngineError> {
//! let engine = Engine::builder().build();
//! engine.register_handler("send-email", Arc::new(SendEmail)).await;
//! engine.start().await?;
//!
//! engine
//!     .enqueue(JobSpec::new("send-email", serde_json::json!({"to": "a@b.com"})))
//!     .await?;
//!
//! engine.shutdown(Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;

pub use conveyor_coordination as coordination;
pub use conveyor_kv as kv;
pub use conveyor_monitor as monitor;
pub use conveyor_queue as queue;
pub use conveyor_scheduler as scheduler;
