//! Scheduled task configuration and its external source boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use conveyor_queue::EnqueueOptions;

use crate::error::SchedulerError;

/// Configuration of one recurring task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTaskConfig {
    /// Unique task name; also the job handler key.
    pub name: String,
    /// Six-field cron pattern (`sec min hour dom mon dow`).
    pub cron_pattern: String,
    /// Payload enqueued on each tick.
    #[serde(default)]
    pub payload: Value,
    /// Protect ticks with a distributed lock so only one replica enqueues.
    #[serde(default)]
    pub use_lock: bool,
    /// Tick lock TTL in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Option overrides for the enqueued job.
    #[serde(default)]
    pub job_options: EnqueueOptions,
}

fn default_lock_ttl() -> u64 {
    60
}

impl ScheduledTaskConfig {
    /// Create a config for a named task and pattern.
    pub fn new(name: impl Into<String>, cron_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron_pattern: cron_pattern.into(),
            payload: Value::Null,
            use_lock: false,
            lock_ttl_secs: default_lock_ttl(),
            job_options: EnqueueOptions::default(),
        }
    }

    /// Set the tick payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Protect ticks with a distributed lock of the given TTL.
    pub fn with_lock(mut self, ttl: Duration) -> Self {
        self.use_lock = true;
        self.lock_ttl_secs = ttl.as_secs();
        self
    }

    /// Set job option overrides for enqueued ticks.
    pub fn with_job_options(mut self, options: EnqueueOptions) -> Self {
        self.job_options = options;
        self
    }

    /// Tick lock TTL as a duration.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Source of scheduled task configurations.
///
/// The production implementation reads rows from the external relational
/// store; the scheduler only consumes this boundary.
#[async_trait]
pub trait TaskConfigSource: Send + Sync {
    /// Load every task configuration.
    async fn load_all(&self) -> Result<Vec<ScheduledTaskConfig>, SchedulerError>;
}

/// In-memory task config source.
pub struct MemoryTaskConfigSource {
    configs: tokio::sync::RwLock<Vec<ScheduledTaskConfig>>,
}

impl MemoryTaskConfigSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self {
            configs: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    /// Add a task configuration.
    pub async fn add(&self, config: ScheduledTaskConfig) {
        self.configs.write().await.push(config);
    }
}

impl Default for MemoryTaskConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskConfigSource for MemoryTaskConfigSource {
    async fn load_all(&self) -> Result<Vec<ScheduledTaskConfig>, SchedulerError> {
        Ok(self.configs.read().await.clone())
    }
}
