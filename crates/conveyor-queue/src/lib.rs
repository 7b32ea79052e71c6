//! # Conveyor Queue
//!
//! Durable job queue and worker pool.
//!
//! ## Features
//!
//! - Priority queue with delayed jobs
//! - Retry with fixed or exponential backoff
//! - Retention policies for terminal jobs
//! - Worker pool with bounded concurrency and stalled-job recovery
//! - Idempotency-keyed enqueue deduplication

pub mod config;
pub mod error;
pub mod job;
pub mod observer;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::QueueConfig;
pub use error::QueueError;
pub use job::{BackoffKind, BackoffPolicy, EnqueueOptions, Job, JobOptions, JobStatus, RetentionPolicy};
pub use observer::{ExecutionObserver, NoopObserver};
pub use queue::{Enqueued, FailureDisposition, JobLease, JobQueue, JobSpec, QueueStatus, StallDisposition, StalledJob};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use worker::{HandlerRegistry, JobContext, JobHandler, WorkerConfig, WorkerPool};
