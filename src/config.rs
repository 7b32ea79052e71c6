//! Aggregate engine configuration.

use serde::{Deserialize, Serialize};

use conveyor_coordination::CoordinationConfig;
use conveyor_queue::{QueueConfig, WorkerConfig};
use conveyor_scheduler::SchedulerConfig;

/// Configuration for one engine instance.
///
/// Aggregates the per-component configurations, including the key-namespace
/// prefixes for lock, idempotency, and scheduler entries. Several engines
/// with different configurations may coexist in one process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lock and idempotency settings.
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Queue name, size bound, and default job options.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker concurrency, heartbeat, and stall settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Cron tick lock settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_from_partial_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "queue": {"name": "emails"},
                "worker": {"concurrency": 8}
            }"#,
        )
        .unwrap();

        assert_eq!(config.queue.name, "emails");
        assert_eq!(config.worker.concurrency, 8);
        // Untouched sections keep their defaults.
        assert_eq!(config.coordination.lock_prefix, "lock:");
        assert_eq!(config.scheduler.lock_key_prefix, "cron:");
    }
}
