//! Coordination configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock::WithLockOptions;

/// Coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Key prefix for lock entries.
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,

    /// Key prefix for idempotency records.
    #[serde(default = "default_idempotency_prefix")]
    pub idempotency_prefix: String,

    /// Default lock TTL in seconds.
    #[serde(default = "default_lock_ttl")]
    pub default_lock_ttl_secs: u64,

    /// Default idempotency record TTL in seconds.
    #[serde(default = "default_idempotency_ttl")]
    pub default_idempotency_ttl_secs: u64,

    /// Acquisition retries for scoped locking.
    #[serde(default)]
    pub lock_retries: u32,

    /// Delay between acquisition retries in milliseconds.
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay_ms: u64,
}

fn default_lock_prefix() -> String {
    "lock:".to_string()
}

fn default_idempotency_prefix() -> String {
    "idempotency:".to_string()
}

fn default_lock_ttl() -> u64 {
    60
}

fn default_idempotency_ttl() -> u64 {
    86_400
}

fn default_lock_retry_delay() -> u64 {
    200
}

impl CoordinationConfig {
    /// Default lock TTL as a duration.
    pub fn default_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.default_lock_ttl_secs)
    }

    /// Default idempotency record TTL as a duration.
    pub fn default_idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.default_idempotency_ttl_secs)
    }

    /// Scoped-lock acquisition options from this configuration.
    pub fn with_lock_options(&self) -> WithLockOptions {
        WithLockOptions {
            retries: self.lock_retries,
            retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_prefix: default_lock_prefix(),
            idempotency_prefix: default_idempotency_prefix(),
            default_lock_ttl_secs: default_lock_ttl(),
            default_idempotency_ttl_secs: default_idempotency_ttl(),
            lock_retries: 0,
            lock_retry_delay_ms: default_lock_retry_delay(),
        }
    }
}
