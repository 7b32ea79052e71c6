//! Execution record types and query shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conveyor_queue::Job;

/// Execution record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Worker is executing the job.
    Active,
    /// Handler returned successfully.
    Completed,
    /// Handler failed, the job stalled, or the execution was interrupted.
    Failed,
}

impl ExecutionStatus {
    /// Stable string form used in persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Active => "active",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ExecutionStatus::Active),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique execution id.
    pub execution_id: String,
    /// Job id.
    pub job_id: String,
    /// Job name (handler key).
    pub job_name: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the worker started the attempt.
    pub started_at: DateTime<Utc>,
    /// When the attempt reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the attempt.
    pub duration_ms: Option<i64>,
    /// Handler result for completed attempts.
    pub result: Option<Value>,
    /// Error message for failed attempts.
    pub error_message: Option<String>,
    /// Failed attempts made on the job before this record's terminal state.
    pub retry_count: u32,
}

impl ExecutionRecord {
    /// Record for an attempt that just started.
    pub fn started(job: &Job, execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            status: ExecutionStatus::Active,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            result: None,
            error_message: None,
            retry_count: job.attempts_made,
        }
    }
}

/// Terminal outcome applied to an active record.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Completed or Failed.
    pub status: ExecutionStatus,
    /// Terminal timestamp.
    pub finished_at: DateTime<Utc>,
    /// Handler result.
    pub result: Option<Value>,
    /// Error message.
    pub error_message: Option<String>,
    /// Failed attempts reached.
    pub retry_count: u32,
}

impl ExecutionOutcome {
    /// Successful outcome.
    pub fn completed(result: Value, retry_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            finished_at: Utc::now(),
            result: Some(result),
            error_message: None,
            retry_count,
        }
    }

    /// Failed outcome.
    pub fn failed(error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            finished_at: Utc::now(),
            result: None,
            error_message: Some(error.into()),
            retry_count,
        }
    }
}

/// History query options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Records to skip.
    #[serde(default)]
    pub offset: usize,
    /// Filter by status.
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    /// Only executions started at or after this time.
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    /// Only executions started at or before this time.
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

fn default_limit() -> usize {
    50
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
            status: None,
            start_date: None,
            end_date: None,
        }
    }
}

/// Aggregate statistics over a trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Executions in the window.
    pub total: u64,
    /// Completed executions.
    pub completed: u64,
    /// Failed executions.
    pub failed: u64,
    /// completed / (completed + failed); zero when nothing finished.
    pub success_rate: f64,
    /// Mean duration of finished executions.
    pub avg_duration_ms: Option<f64>,
    /// Most recent execution start in the window.
    pub last_execution: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Active,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_started_record() {
        let mut job = Job::new("send-email", json!({"to": "a@b.com"}));
        job.attempts_made = 2;

        let record = ExecutionRecord::started(&job, "exec-1");
        assert_eq!(record.status, ExecutionStatus::Active);
        assert_eq!(record.job_id, job.id);
        assert_eq!(record.retry_count, 2);
        assert!(record.finished_at.is_none());
    }
}
