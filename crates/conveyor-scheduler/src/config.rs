//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use conveyor_coordination::WithLockOptions;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Prefix for per-task tick lock keys.
    #[serde(default = "default_lock_key_prefix")]
    pub lock_key_prefix: String,

    /// Lock acquisition retries per tick.
    #[serde(default)]
    pub lock_retries: u32,

    /// Delay between lock acquisition retries in milliseconds.
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
}

fn default_lock_key_prefix() -> String {
    "cron:".to_string()
}

fn default_lock_retry_delay() -> u64 {
    200
}

impl SchedulerConfig {
    /// Tick lock acquisition options from this configuration.
    pub fn with_lock_options(&self) -> WithLockOptions {
        WithLockOptions {
            retries: self.lock_retries,
            retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_key_prefix: default_lock_key_prefix(),
            lock_retries: 0,
            lock_retry_delay_ms: default_lock_retry_delay(),
        }
    }
}
