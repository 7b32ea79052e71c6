//! Job definition, options, and retry/retention policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in queue, ready to run.
    Waiting,
    /// Waiting for a scheduled run time (initial delay or retry backoff).
    Delayed,
    /// Currently being processed by a worker.
    Active,
    /// Completed successfully.
    Completed,
    /// Failed terminally (attempts exhausted or stall budget spent).
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Waiting
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffKind {
    /// Constant delay between attempts.
    Fixed,
    /// Delay doubles with each failed attempt.
    Exponential,
}

/// Delay policy applied before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Strategy.
    pub kind: BackoffKind,
    /// Base delay.
    pub delay: Duration,
}

impl BackoffPolicy {
    /// Fixed backoff with the given base delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    /// Exponential backoff with the given base delay.
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }

    /// Delay before retry `n` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.delay.saturating_mul(factor)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

/// Retention bounds for terminal jobs.
///
/// A job is pruned when either bound is exceeded; unset bounds keep jobs
/// indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum age since finishing.
    pub max_age: Option<Duration>,
    /// Maximum number of retained jobs, newest kept.
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    /// Keep everything.
    pub fn keep_all() -> Self {
        Self::default()
    }

    /// True when no bound is configured.
    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_count.is_none()
    }
}

/// Resolved per-job options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total execution attempts (at least 1).
    pub attempts: u32,
    /// Backoff between retries.
    pub backoff: BackoffPolicy,
    /// Priority; higher runs first.
    pub priority: i32,
    /// Initial delay before the first attempt.
    pub delay: Option<Duration>,
    /// Retention for completed jobs.
    pub remove_on_complete: RetentionPolicy,
    /// Retention for failed jobs.
    pub remove_on_fail: RetentionPolicy,
    /// Deduplication key; enqueue collapses onto an already-processed key.
    pub idempotency_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::default(),
            priority: 0,
            delay: None,
            remove_on_complete: RetentionPolicy::keep_all(),
            remove_on_fail: RetentionPolicy::keep_all(),
            idempotency_key: None,
        }
    }
}

impl JobOptions {
    /// Overlay the set fields of `overrides` onto these options.
    pub fn apply(&mut self, overrides: &EnqueueOptions) {
        if let Some(attempts) = overrides.attempts {
            self.attempts = attempts.max(1);
        }
        if let Some(backoff) = overrides.backoff {
            self.backoff = backoff;
        }
        if let Some(priority) = overrides.priority {
            self.priority = priority;
        }
        if let Some(delay) = overrides.delay {
            self.delay = Some(delay);
        }
        if let Some(retention) = overrides.remove_on_complete {
            self.remove_on_complete = retention;
        }
        if let Some(retention) = overrides.remove_on_fail {
            self.remove_on_fail = retention;
        }
        if let Some(key) = &overrides.idempotency_key {
            self.idempotency_key = Some(key.clone());
        }
    }
}

/// Caller-supplied option overrides, merged over task and queue defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Total execution attempts.
    #[serde(default)]
    pub attempts: Option<u32>,
    /// Backoff between retries.
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    /// Priority; higher runs first.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Initial delay before the first attempt.
    #[serde(default)]
    pub delay: Option<Duration>,
    /// Retention for completed jobs.
    #[serde(default)]
    pub remove_on_complete: Option<RetentionPolicy>,
    /// Retention for failed jobs.
    #[serde(default)]
    pub remove_on_fail: Option<RetentionPolicy>,
    /// Deduplication key.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl EnqueueOptions {
    /// Set the attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the initial delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID; caller-assigned ids deduplicate submissions.
    pub id: String,
    /// Handler key.
    pub name: String,
    /// Arbitrary payload handed to the handler.
    pub payload: Value,
    /// Resolved options.
    pub opts: JobOptions,
    /// Current status.
    pub status: JobStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may run (None = immediately).
    pub run_at: Option<DateTime<Utc>>,
    /// Attempts that have ended in failure.
    pub attempts_made: u32,
    /// Times the job was reclaimed from a stalled worker.
    pub stalled_count: u32,
    /// Last error message.
    pub last_error: Option<String>,
    /// Time the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Handler result for completed jobs.
    pub result: Option<Value>,
}

impl Job {
    /// Create a new waiting job with default options.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            payload,
            opts: JobOptions::default(),
            status: JobStatus::Waiting,
            created_at: now,
            updated_at: now,
            run_at: None,
            attempts_made: 0,
            stalled_count: 0,
            last_error: None,
            finished_at: None,
            result: None,
        }
    }

    /// Set the job ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the resolved options, deriving delayed status from the delay.
    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        if let Some(delay) = opts.delay {
            self.run_at = Some(self.created_at + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Delayed;
        }
        self.opts = opts;
        self
    }

    /// True for completed or terminally failed jobs.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    /// True when more attempts remain after a failure.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.opts.attempts
    }

    /// True when the job may be handed to a worker now.
    pub fn is_ready(&self) -> bool {
        if !matches!(self.status, JobStatus::Waiting | JobStatus::Delayed) {
            return false;
        }
        match self.run_at {
            Some(at) => at <= Utc::now(),
            None => true,
        }
    }

    /// The time ordering ties are broken by: scheduled run time, else creation.
    pub fn effective_run_at(&self) -> DateTime<Utc> {
        self.run_at.unwrap_or(self.created_at)
    }
}
