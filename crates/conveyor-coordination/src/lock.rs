//! Distributed lock with fencing tokens.
//!
//! A lock is a namespaced key in the shared store holding a random token.
//! Only the holder of the matching token may release or extend it, and both
//! checks happen atomically in the store. While a lock is held, a background
//! refresh task re-extends the TTL so long-running work does not lose the
//! lock mid-flight; the TTL itself is the safety net if the process dies.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use conveyor_kv::SharedStore;

use crate::config::CoordinationConfig;
use crate::error::CoordinationError;

/// Floor for the refresh interval, so tiny TTLs do not spin.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Options for scoped lock acquisition.
#[derive(Debug, Clone)]
pub struct WithLockOptions {
    /// Additional acquisition attempts after the first.
    pub retries: u32,
    /// Delay between acquisition attempts.
    pub retry_delay: Duration,
}

impl Default for WithLockOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Manager for distributed locks on a shared store.
pub struct LockManager {
    store: Arc<dyn SharedStore>,
    prefix: String,
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new(store: Arc<dyn SharedStore>, config: &CoordinationConfig) -> Self {
        Self {
            store,
            prefix: config.lock_prefix.clone(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Attempt to acquire a lock.
    ///
    /// Returns `Ok(None)` when the lock is already held elsewhere; that is
    /// expected under contention, not an error. On success the returned
    /// guard owns the fencing token and a background TTL refresh task.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, CoordinationError> {
        let token = Uuid::new_v4().to_string();
        let full_key = self.full_key(key);

        let acquired = self
            .store
            .set_nx(&full_key, &token, ttl)
            .await
            .map_err(|e| CoordinationError::Store(e.to_string()))?;

        if !acquired {
            debug!("Lock {} already held", full_key);
            return Ok(None);
        }

        debug!("Acquired lock {} (ttl {:?})", full_key, ttl);
        Ok(Some(LockGuard::new(
            self.store.clone(),
            full_key,
            token,
            ttl,
        )))
    }

    /// Release a lock by raw token.
    ///
    /// Returns false when the lock was not held under this token (expired
    /// or taken over); that is logged, not fatal.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        let full_key = self.full_key(key);
        let released = self
            .store
            .compare_and_delete(&full_key, token)
            .await
            .map_err(|e| CoordinationError::Store(e.to_string()))?;

        if !released {
            debug!("Lock {} no longer held by this token at release", full_key);
        }
        Ok(released)
    }

    /// Extend a lock's TTL by raw token.
    pub async fn extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let full_key = self.full_key(key);
        self.store
            .compare_and_extend(&full_key, token, ttl)
            .await
            .map_err(|e| CoordinationError::Store(e.to_string()))
    }

    /// Run `f` under the lock, releasing on every exit path.
    ///
    /// Acquisition is retried per `options`. Returns `None` when the lock
    /// was never acquired. Store failures during acquisition are treated as
    /// "not acquired" (fail closed for mutual exclusion) and logged.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        options: WithLockOptions,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_with_retry(key, ttl, &options).await?;

        let result = f().await;

        if let Err(e) = guard.release().await {
            warn!("Failed to release lock {}: {}", key, e);
        }
        Some(result)
    }

    async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        options: &WithLockOptions,
    ) -> Option<LockGuard> {
        for attempt in 0..=options.retries {
            match self.acquire(key, ttl).await {
                Ok(Some(guard)) => return Some(guard),
                Ok(None) => {
                    debug!("Lock {} held, attempt {}/{}", key, attempt + 1, options.retries + 1);
                }
                Err(e) => {
                    warn!("Store error acquiring lock {}, treating as not acquired: {}", key, e);
                }
            }
            if attempt < options.retries {
                tokio::time::sleep(options.retry_delay).await;
            }
        }
        None
    }
}

/// A held lock.
///
/// Owns the fencing token and the background refresh task. Dropping the
/// guard without calling [`LockGuard::release`] aborts the refresh task and
/// leaves the key to expire via its TTL.
pub struct LockGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
    refresh: JoinHandle<()>,
    possibly_lost: Arc<AtomicBool>,
}

impl LockGuard {
    fn new(store: Arc<dyn SharedStore>, key: String, token: String, ttl: Duration) -> Self {
        let possibly_lost = Arc::new(AtomicBool::new(false));
        let refresh = tokio::spawn(refresh_loop(
            store.clone(),
            key.clone(),
            token.clone(),
            ttl,
            possibly_lost.clone(),
        ));

        Self {
            store,
            key,
            token,
            refresh,
            possibly_lost,
        }
    }

    /// The namespaced lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The fencing token proving ownership.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// True once the refresh task observed the lock gone or unreachable.
    ///
    /// In-flight work is not aborted when this flips; callers that cannot
    /// tolerate a possibly-stolen lock should check it at commit points.
    pub fn is_possibly_lost(&self) -> bool {
        self.possibly_lost.load(Ordering::SeqCst)
    }

    /// Release the lock, stopping the refresh task first.
    ///
    /// Returns false when the lock was no longer held under this token.
    pub async fn release(self) -> Result<bool, CoordinationError> {
        self.refresh.abort();

        let released = self
            .store
            .compare_and_delete(&self.key, &self.token)
            .await
            .map_err(|e| CoordinationError::Store(e.to_string()))?;

        if !released {
            debug!("Lock {} expired or was taken over before release", self.key);
        }
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.refresh.abort();
    }
}

fn refresh_interval(ttl: Duration) -> Duration {
    (ttl / 6).max(MIN_REFRESH_INTERVAL)
}

async fn refresh_loop(
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
    ttl: Duration,
    possibly_lost: Arc<AtomicBool>,
) {
    let interval = refresh_interval(ttl);

    loop {
        tokio::time::sleep(interval).await;

        match store.compare_and_extend(&key, &token, ttl).await {
            Ok(true) => {
                debug!("Extended lock {} (ttl {:?})", key, ttl);
            }
            Ok(false) => {
                warn!("Lock {} no longer held by this token, stopping refresh", key);
                possibly_lost.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                warn!("Store unavailable extending lock {}, stopping refresh: {}", key, e);
                possibly_lost.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}
