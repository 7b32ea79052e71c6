//! Execution lifecycle events.

use async_trait::async_trait;
use serde_json::Value;

use crate::job::Job;

/// Receiver for worker lifecycle events.
///
/// Implementations must tolerate being called concurrently and must not
/// assume events for different jobs arrive in any particular order. Event
/// delivery failures are the implementation's problem: observers are
/// expected to swallow and log their own errors, never to panic the worker.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// A worker dequeued the job and is about to run it.
    async fn on_active(&self, job: &Job, execution_id: &str);

    /// The handler reported incremental progress.
    async fn on_progress(&self, job: &Job, execution_id: &str, progress: &Value);

    /// The handler returned successfully.
    async fn on_completed(&self, job: &Job, execution_id: &str, result: &Value);

    /// The execution failed: handler error, stall reclaim, or interrupt.
    async fn on_failed(&self, job: &Job, execution_id: &str, error: &str);
}

/// Observer that ignores every event.
pub struct NoopObserver;

#[async_trait]
impl ExecutionObserver for NoopObserver {
    async fn on_active(&self, _job: &Job, _execution_id: &str) {}

    async fn on_progress(&self, _job: &Job, _execution_id: &str, _progress: &Value) {}

    async fn on_completed(&self, _job: &Job, _execution_id: &str, _result: &Value) {}

    async fn on_failed(&self, _job: &Job, _execution_id: &str, _error: &str) {}
}
