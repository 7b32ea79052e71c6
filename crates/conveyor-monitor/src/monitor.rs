//! Execution monitor: records worker lifecycle events and serves queries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use conveyor_queue::{ExecutionObserver, Job};

use crate::error::MonitorError;
use crate::record::{ExecutionOutcome, ExecutionRecord, ExecutionStats, HistoryQuery};
use crate::store::ExecutionLogStore;

/// Records start/completion/failure of every execution and exposes
/// historical and aggregate queries.
///
/// Log-write failures are caught and logged, never propagated: observability
/// must not fail the job it observes.
pub struct ExecutionMonitor {
    store: Arc<dyn ExecutionLogStore>,
}

impl ExecutionMonitor {
    /// Create a monitor over a log store.
    pub fn new(store: Arc<dyn ExecutionLogStore>) -> Self {
        Self { store }
    }

    /// Paginated, filterable execution history for a job, newest first.
    pub async fn get_execution_history(
        &self,
        job_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<ExecutionRecord>, MonitorError> {
        self.store.history(job_id, query).await
    }

    /// Aggregate statistics for a job over the trailing `days`.
    pub async fn get_execution_stats(
        &self,
        job_id: &str,
        days: u32,
    ) -> Result<ExecutionStats, MonitorError> {
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        self.store.stats(job_id, since).await
    }

    /// Delete records older than `retention_days`. Returns the count.
    pub async fn cleanup_old_logs(&self, retention_days: u32) -> Result<usize, MonitorError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let deleted = self.store.delete_older_than(cutoff).await?;
        if deleted > 0 {
            debug!("Cleaned up {} execution records", deleted);
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ExecutionObserver for ExecutionMonitor {
    async fn on_active(&self, job: &Job, execution_id: &str) {
        let record = ExecutionRecord::started(job, execution_id);
        if let Err(e) = self.store.insert(&record).await {
            warn!("Failed to record execution start for job {}: {}", job.id, e);
        }
    }

    async fn on_progress(&self, job: &Job, execution_id: &str, progress: &Value) {
        debug!("Job {} progress ({}): {}", job.id, execution_id, progress);
    }

    async fn on_completed(&self, job: &Job, execution_id: &str, result: &Value) {
        let outcome = ExecutionOutcome::completed(result.clone(), job.attempts_made);
        if let Err(e) = self.store.finish(execution_id, outcome).await {
            warn!("Failed to record completion for job {}: {}", job.id, e);
        }
    }

    async fn on_failed(&self, job: &Job, execution_id: &str, error: &str) {
        let outcome = ExecutionOutcome::failed(error, job.attempts_made);
        if let Err(e) = self.store.finish(execution_id, outcome).await {
            warn!("Failed to record failure for job {}: {}", job.id, e);
        }
    }
}
