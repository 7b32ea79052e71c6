//! Queue configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::{EnqueueOptions, JobOptions};

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name.
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Maximum number of queued jobs (0 = unlimited).
    #[serde(default)]
    pub max_queue_size: u64,

    /// Queue-wide default job options.
    #[serde(default)]
    pub default_options: JobOptions,

    /// Per-task default option overrides, keyed by job name.
    #[serde(default)]
    pub task_defaults: HashMap<String, EnqueueOptions>,
}

fn default_queue_name() -> String {
    "default".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_queue_size: 0,
            default_options: JobOptions::default(),
            task_defaults: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Resolve effective options for a job: caller overrides over task
    /// defaults over queue defaults, field by field.
    pub fn resolve_options(&self, name: &str, overrides: &EnqueueOptions) -> JobOptions {
        let mut opts = self.default_options.clone();
        if let Some(task_level) = self.task_defaults.get(name) {
            opts.apply(task_level);
        }
        opts.apply(overrides);
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BackoffKind, BackoffPolicy};
    use std::time::Duration;

    #[test]
    fn test_resolution_order() {
        let mut config = QueueConfig::default();
        config.default_options.attempts = 2;
        config.task_defaults.insert(
            "report".to_string(),
            EnqueueOptions::default()
                .with_attempts(5)
                .with_backoff(BackoffPolicy::exponential(Duration::from_secs(1))),
        );

        // Task defaults beat queue defaults.
        let opts = config.resolve_options("report", &EnqueueOptions::default());
        assert_eq!(opts.attempts, 5);
        assert_eq!(opts.backoff.kind, BackoffKind::Exponential);

        // Caller overrides beat both.
        let opts = config.resolve_options("report", &EnqueueOptions::default().with_attempts(1));
        assert_eq!(opts.attempts, 1);
        assert_eq!(opts.backoff.kind, BackoffKind::Exponential);

        // Unknown task falls back to queue defaults.
        let opts = config.resolve_options("other", &EnqueueOptions::default());
        assert_eq!(opts.attempts, 2);
    }
}
