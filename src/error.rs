//! Engine errors.

use thiserror::Error;

use conveyor_coordination::CoordinationError;
use conveyor_monitor::MonitorError;
use conveyor_queue::QueueError;
use conveyor_scheduler::SchedulerError;

/// Engine error types.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Coordination layer failed.
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Queue or worker operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Scheduler operation failed.
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Execution monitor query failed.
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}
