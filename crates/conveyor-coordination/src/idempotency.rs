//! Idempotency records for collapsing duplicate logical requests.
//!
//! A non-expired record under a key means the operation already ran and its
//! cached result must be returned instead of re-executing. Store failures
//! during the check are treated as "not processed" (fail open) so that an
//! unavailable store does not block legitimate work; every such fallback is
//! logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use conveyor_kv::SharedStore;

use crate::config::CoordinationConfig;
use crate::error::CoordinationError;

/// A cached outcome stored under an idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Result of the original execution.
    pub result: Value,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record expires.
    pub expires_at: DateTime<Utc>,
}

/// Options for [`IdempotencyStore::run_idempotent`].
#[derive(Debug, Clone)]
pub struct RunIdempotentOptions {
    /// Record TTL; the store default when unset.
    pub ttl: Option<Duration>,
    /// Return the cached result without re-running when already processed.
    pub skip_on_exists: bool,
}

impl Default for RunIdempotentOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            skip_on_exists: true,
        }
    }
}

/// Deduplication cache keyed by caller-supplied keys.
pub struct IdempotencyStore {
    store: Arc<dyn SharedStore>,
    prefix: String,
    default_ttl: Duration,
}

impl IdempotencyStore {
    /// Create a new idempotency store.
    pub fn new(store: Arc<dyn SharedStore>, config: &CoordinationConfig) -> Self {
        Self {
            store,
            prefix: config.idempotency_prefix.clone(),
            default_ttl: config.default_idempotency_ttl(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Check whether a key has already been processed.
    pub async fn is_processed(&self, key: &str) -> bool {
        match self.store.get(&self.full_key(key)).await {
            Ok(record) => record.is_some(),
            Err(e) => {
                warn!(
                    "Idempotency check for {} failed, treating as not processed: {}",
                    key, e
                );
                false
            }
        }
    }

    /// Store the result of a completed operation under a key.
    pub async fn mark_processed(
        &self,
        key: &str,
        result: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinationError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Utc::now();
        let expires = chrono::Duration::from_std(ttl)
            .map_err(|e| CoordinationError::Custom(format!("TTL out of range: {}", e)))?;

        let record = IdempotencyRecord {
            result: result.clone(),
            created_at: now,
            expires_at: now + expires,
        };

        let encoded = serde_json::to_string(&record)
            .map_err(|e| CoordinationError::Serialization(e.to_string()))?;

        self.store
            .set(&self.full_key(key), &encoded, Some(ttl))
            .await
            .map_err(|e| CoordinationError::Store(e.to_string()))?;

        debug!("Marked {} as processed (ttl {:?})", key, ttl);
        Ok(())
    }

    /// Get the cached result for a processed key, if any.
    pub async fn processed_result(&self, key: &str) -> Option<Value> {
        let raw = match self.store.get(&self.full_key(key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read idempotency record for {}: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str::<IdempotencyRecord>(&raw) {
            Ok(record) => Some(record.result),
            Err(e) => {
                warn!("Malformed idempotency record for {}: {}", key, e);
                None
            }
        }
    }

    /// Remove a processed record. Returns true if one existed.
    pub async fn clear(&self, key: &str) -> Result<bool, CoordinationError> {
        self.store
            .delete(&self.full_key(key))
            .await
            .map_err(|e| CoordinationError::Store(e.to_string()))
    }

    /// Derive a deterministic key from a task name and its parameters.
    ///
    /// Object keys are sorted recursively, so logically identical parameter
    /// maps produce the same key regardless of field order.
    pub fn generate_key(task_name: &str, params: &Value) -> String {
        let mut canonical = String::new();
        write_canonical(params, &mut canonical);
        format!("{}:{}", task_name, canonical)
    }

    /// Run `f` at most once per key.
    ///
    /// When the key is already processed and `skip_on_exists` is set, the
    /// cached result is returned and `f` never runs. Otherwise `f` runs and
    /// its result is recorded.
    pub async fn run_idempotent<F, Fut>(
        &self,
        key: &str,
        options: RunIdempotentOptions,
        f: F,
    ) -> Result<Value, CoordinationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, CoordinationError>>,
    {
        if options.skip_on_exists {
            if let Some(cached) = self.processed_result(key).await {
                debug!("Skipping already-processed key {}", key);
                return Ok(cached);
            }
        }

        let result = f().await?;
        self.mark_processed(key, &result, options.ttl).await?;
        Ok(result)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_kv::MemoryKvStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(
            Arc::new(MemoryKvStore::new()),
            &CoordinationConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_mark_and_check() {
        let idem = store();

        assert!(!idem.is_processed("welcome-42").await);
        idem.mark_processed("welcome-42", &json!({"sent": true}), None)
            .await
            .unwrap();

        assert!(idem.is_processed("welcome-42").await);
        assert_eq!(
            idem.processed_result("welcome-42").await,
            Some(json!({"sent": true}))
        );
    }

    #[tokio::test]
    async fn test_record_expires() {
        let idem = store();

        idem.mark_processed("short", &json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!idem.is_processed("short").await);
        assert_eq!(idem.processed_result("short").await, None);
    }

    #[tokio::test]
    async fn test_clear() {
        let idem = store();

        idem.mark_processed("k", &json!(null), None).await.unwrap();
        assert!(idem.clear("k").await.unwrap());
        assert!(!idem.is_processed("k").await);
        assert!(!idem.clear("k").await.unwrap());
    }

    #[test]
    fn test_generate_key_ignores_field_order() {
        let a = IdempotencyStore::generate_key(
            "send-email",
            &json!({"to": "a@b.com", "template": "welcome"}),
        );
        let b = IdempotencyStore::generate_key(
            "send-email",
            &json!({"template": "welcome", "to": "a@b.com"}),
        );
        assert_eq!(a, b);
        assert!(a.starts_with("send-email:"));
    }

    #[test]
    fn test_generate_key_sorts_nested_objects() {
        let a = IdempotencyStore::generate_key("t", &json!({"outer": {"b": 2, "a": 1}}));
        let b = IdempotencyStore::generate_key("t", &json!({"outer": {"a": 1, "b": 2}}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_key_distinguishes_params() {
        let a = IdempotencyStore::generate_key("t", &json!({"n": 1}));
        let b = IdempotencyStore::generate_key("t", &json!({"n": 2}));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_run_idempotent_executes_once() {
        let idem = store();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let result = idem
                .run_idempotent("once", RunIdempotentOptions::default(), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("done"))
                })
                .await
                .unwrap();
            assert_eq!(result, json!("done"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_idempotent_reruns_without_skip() {
        let idem = store();
        let calls = Arc::new(AtomicU32::new(0));

        let options = RunIdempotentOptions {
            ttl: None,
            skip_on_exists: false,
        };
        for _ in 0..2 {
            let calls = calls.clone();
            idem.run_idempotent("again", options.clone(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .await
            .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
