//! Execution log store trait and in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MonitorError;
use crate::record::{ExecutionOutcome, ExecutionRecord, ExecutionStats, ExecutionStatus, HistoryQuery};

/// Durable store for execution records.
#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    /// Insert a record for a started execution.
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), MonitorError>;

    /// Transition a record to its terminal state, computing the duration
    /// from the stored start time.
    async fn finish(&self, execution_id: &str, outcome: ExecutionOutcome)
    -> Result<(), MonitorError>;

    /// Load a record by execution id.
    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, MonitorError>;

    /// Query a job's history, newest first.
    async fn history(
        &self,
        job_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<ExecutionRecord>, MonitorError>;

    /// Aggregate statistics for a job since `since`.
    async fn stats(&self, job_id: &str, since: DateTime<Utc>)
    -> Result<ExecutionStats, MonitorError>;

    /// Delete records started before `cutoff`. Returns the count deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, MonitorError>;
}

/// In-memory execution log store.
pub struct MemoryExecutionStore {
    records: tokio::sync::RwLock<HashMap<String, ExecutionRecord>>,
}

impl MemoryExecutionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionLogStore for MemoryExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), MonitorError> {
        let mut records = self.records.write().await;
        records.insert(record.execution_id.clone(), record.clone());
        Ok(())
    }

    async fn finish(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<(), MonitorError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(execution_id) else {
            return Err(MonitorError::NotFound(execution_id.to_string()));
        };

        record.status = outcome.status;
        record.finished_at = Some(outcome.finished_at);
        record.duration_ms = Some((outcome.finished_at - record.started_at).num_milliseconds());
        record.result = outcome.result;
        record.error_message = outcome.error_message;
        record.retry_count = outcome.retry_count;
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, MonitorError> {
        let records = self.records.read().await;
        Ok(records.get(execution_id).cloned())
    }

    async fn history(
        &self,
        job_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<ExecutionRecord>, MonitorError> {
        let records = self.records.read().await;

        let mut matches: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| r.job_id == job_id)
            .filter(|r| query.status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| query.start_date.map(|d| r.started_at >= d).unwrap_or(true))
            .filter(|r| query.end_date.map(|d| r.started_at <= d).unwrap_or(true))
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        Ok(matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn stats(
        &self,
        job_id: &str,
        since: DateTime<Utc>,
    ) -> Result<ExecutionStats, MonitorError> {
        let records = self.records.read().await;

        let window: Vec<&ExecutionRecord> = records
            .values()
            .filter(|r| r.job_id == job_id && r.started_at >= since)
            .collect();

        let completed = window
            .iter()
            .filter(|r| r.status == ExecutionStatus::Completed)
            .count() as u64;
        let failed = window
            .iter()
            .filter(|r| r.status == ExecutionStatus::Failed)
            .count() as u64;

        let durations: Vec<i64> = window.iter().filter_map(|r| r.duration_ms).collect();
        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        let finished = completed + failed;
        Ok(ExecutionStats {
            total: window.len() as u64,
            completed,
            failed,
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
            avg_duration_ms,
            last_execution: window.iter().map(|r| r.started_at).max(),
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, MonitorError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.started_at >= cutoff);
        Ok(before - records.len())
    }
}
