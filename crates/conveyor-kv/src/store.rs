//! Shared store trait and in-memory implementation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::KvError;

/// Shared key-value store used for cross-replica coordination.
///
/// Implementations are expected to be backed by a store visible to all
/// process replicas (e.g. Redis). The compare-and-* operations must be
/// atomic: read, compare, and mutate as a single step.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically set `key` to `value` with an expiry, only if absent.
    ///
    /// Returns true if the value was set, false if the key already exists.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Get the value for a key.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Set a value, optionally with an expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Delete a key. Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Atomically delete `key` only if its current value equals `expected`.
    ///
    /// Returns true if the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    /// Atomically reset the TTL of `key` only if its current value equals
    /// `expected`. Returns true if the TTL was extended.
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError>;
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

/// In-memory shared store.
///
/// Expired entries are purged lazily: every operation treats an expired
/// entry as absent. Suitable for tests and single-process deployments;
/// multi-replica deployments need a store all replicas can reach.
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryKvStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live (non-expired) entries.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|v| !v.is_expired()).count()
    }

    /// Check whether the store has no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryKvStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(key) {
            if !existing.is_expired() {
                return Ok(false);
            }
            debug!("Purging expired key on set_nx: {}", key);
        }

        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|v| !v.is_expired())
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.write().await;
        match entries.remove(key) {
            Some(v) => Ok(!v.is_expired()),
            None => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.write().await;

        let matches = entries
            .get(key)
            .filter(|v| !v.is_expired())
            .map(|v| v.value == expected)
            .unwrap_or(false);

        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut entries = self.entries.write().await;

        match entries.get_mut(key) {
            Some(v) if !v.is_expired() && v.value == expected => {
                v.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
