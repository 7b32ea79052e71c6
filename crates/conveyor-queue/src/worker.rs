//! Worker pool for concurrent job execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::job::Job;
use crate::observer::ExecutionObserver;
use crate::queue::{FailureDisposition, JobLease, JobQueue, StallDisposition};

/// Handler for one job name.
///
/// Returning an error signals a failed attempt; the queue applies the job's
/// retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute a job.
    async fn execute(&self, ctx: &JobContext, payload: &Value) -> Result<Value, QueueError>;
}

/// Explicit, constructed mapping from job names to handlers.
///
/// Owned by the composition root and passed by reference; registration
/// happens at startup and is validated before workers start.
pub struct HandlerRegistry {
    handlers: tokio::sync::RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under a job name, replacing any previous one.
    pub async fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        let mut handlers = self.handlers.write().await;
        if handlers.insert(name.clone(), handler).is_some() {
            warn!("Replacing handler for '{}'", name);
        }
    }

    /// Register several handlers at once.
    pub async fn register_all(&self, map: HashMap<String, Arc<dyn JobHandler>>) {
        let mut handlers = self.handlers.write().await;
        for (name, handler) in map {
            handlers.insert(name, handler);
        }
    }

    /// Look up a handler.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().await;
        handlers.get(name).cloned()
    }

    /// Registered names.
    pub async fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        handlers.keys().cloned().collect()
    }

    /// Fail fast on names that have no registered handler.
    pub async fn validate(&self, required: &[String]) -> Result<(), QueueError> {
        let handlers = self.handlers.read().await;
        for name in required {
            if !handlers.contains_key(name) {
                return Err(QueueError::HandlerNotFound(name.clone()));
            }
        }
        Ok(())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-execution context handed to handlers.
pub struct JobContext {
    job: Job,
    execution_id: String,
    queue: Arc<JobQueue>,
    observer: Arc<dyn ExecutionObserver>,
}

impl JobContext {
    /// The job being executed. `attempts_made` counts prior failures.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Unique id of this execution attempt.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Report incremental progress. Also counts as a heartbeat.
    pub async fn report_progress(&self, progress: Value) {
        self.queue.touch(&self.job.id);
        self.observer
            .on_progress(&self.job, &self.execution_id, &progress)
            .await;
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent handler executions.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Reassignments before a stalling job is terminally failed.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// Heartbeat silence after which an active job counts as stalled.
    /// Must exceed `heartbeat_interval_ms`.
    #[serde(default = "default_stalled_interval")]
    pub stalled_interval_ms: u64,

    /// Interval between heartbeats for in-flight jobs.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Idle wait between queue polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_stalled_interval() -> u64 {
    30_000
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_poll_interval() -> u64 {
    100
}

impl WorkerConfig {
    /// Stalled interval as a duration.
    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_stalled_count: default_max_stalled_count(),
            stalled_interval_ms: default_stalled_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

struct InFlight {
    execution_id: String,
    abort: AbortHandle,
}

/// Pulls jobs from a queue and executes them against registered handlers.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    observer: Arc<dyn ExecutionObserver>,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    paused: AtomicBool,
    in_flight: DashMap<String, InFlight>,
    completed_count: AtomicU64,
    failed_count: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    /// Create a new worker pool over a queue.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Self {
        let permits = config.concurrency;
        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            config,
            queue,
            registry,
            observer,
            semaphore: Arc::new(Semaphore::new(permits)),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            in_flight: DashMap::new(),
            completed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Whether the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether intake is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Executions finished successfully.
    pub fn completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::SeqCst)
    }

    /// Executions that failed.
    pub fn failed_count(&self) -> u64 {
        self.failed_count.load(Ordering::SeqCst)
    }

    /// Workers not currently executing a job.
    pub fn available_workers(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Jobs this pool is executing right now.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Start the pull loop plus heartbeat and stalled-check tasks.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Worker pool started (concurrency {})", self.config.concurrency);

        let pool = self.clone();
        tokio::spawn(async move { pool.run().await });

        let pool = self.clone();
        tokio::spawn(async move { pool.heartbeat_loop().await });

        tokio::spawn(async move { self.stalled_loop().await });
    }

    /// Stop pulling new jobs. With `force`, interrupt in-flight executions;
    /// interrupted jobs go through the standard failure path.
    pub async fn pause(&self, force: bool) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Worker pool paused (force: {})", force);

        if force {
            self.interrupt_in_flight("interrupted by forced pause").await;
        }
    }

    /// Resume pulling jobs.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Worker pool resumed");
    }

    /// Graceful drain: pause intake, wait for in-flight jobs up to
    /// `timeout`, then force-interrupt stragglers and stop the pool.
    pub async fn shutdown(&self, timeout: Duration) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Worker pool draining (timeout {:?})", timeout);

        let deadline = Instant::now() + timeout;
        while self.in_flight.len() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if !self.in_flight.is_empty() {
            warn!(
                "Drain timeout with {} jobs in flight, interrupting",
                self.in_flight.len()
            );
            self.interrupt_in_flight("interrupted by shutdown").await;
        }

        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        info!("Worker pool stopped");
    }

    async fn interrupt_in_flight(&self, reason: &str) {
        let entries: Vec<(String, InFlight)> = {
            let keys: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
            keys.into_iter()
                .filter_map(|k| self.in_flight.remove(&k))
                .collect()
        };

        for (job_id, in_flight) in entries {
            in_flight.abort.abort();
            self.failed_count.fetch_add(1, Ordering::SeqCst);

            match self.queue.fail_job(&job_id, reason).await {
                Ok(FailureDisposition::Retrying { job, .. })
                | Ok(FailureDisposition::Terminal { job }) => {
                    self.observer
                        .on_failed(&job, &in_flight.execution_id, reason)
                        .await;
                }
                Err(e) => warn!("Could not fail interrupted job {}: {}", job_id, e),
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let pool = self.clone();
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Worker pool pull loop shutting down");
                    break;
                }
                _ = pool.pull_once() => {}
            }
        }
    }

    async fn pull_once(self: Arc<Self>) {
        if self.is_paused() {
            tokio::time::sleep(self.config.poll_interval()).await;
            return;
        }

        match self.queue.next_job().await {
            Ok(Some(lease)) => {
                if let Err(e) = self.dispatch(lease).await {
                    error!("Failed to dispatch job: {}", e);
                }
            }
            Ok(None) => {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
            Err(e) => {
                error!("Failed to pull job: {}", e);
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
    }

    async fn dispatch(self: Arc<Self>, lease: JobLease) -> Result<(), QueueError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| QueueError::WorkerError(e.to_string()))?;

        let JobLease { job, execution_id } = lease;
        let pool = self.clone();
        let job_id = job.id.clone();
        let exec_id = execution_id.clone();

        // The task waits for its in_flight registration before running, so
        // it cannot finish and deregister before we insert.
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = ready_rx.await;
            pool.execute(job, execution_id).await;
            drop(permit);
        });

        self.in_flight.insert(
            job_id,
            InFlight {
                execution_id: exec_id,
                abort: handle.abort_handle(),
            },
        );
        let _ = ready_tx.send(());
        Ok(())
    }

    async fn execute(self: Arc<Self>, job: Job, execution_id: String) {
        debug!("Executing job {} (attempt {})", job.id, job.attempts_made + 1);
        self.observer.on_active(&job, &execution_id).await;

        let result = match self.registry.get(&job.name).await {
            Some(handler) => {
                let ctx = JobContext {
                    job: job.clone(),
                    execution_id: execution_id.clone(),
                    queue: self.queue.clone(),
                    observer: self.observer.clone(),
                };
                handler.execute(&ctx, &job.payload).await
            }
            None => Err(QueueError::HandlerNotFound(job.name.clone())),
        };

        match result {
            Ok(value) => match self.queue.complete_job(&job.id, value.clone()).await {
                Ok(completed) => {
                    self.completed_count.fetch_add(1, Ordering::SeqCst);
                    self.observer
                        .on_completed(&completed, &execution_id, &value)
                        .await;
                }
                Err(e) => {
                    // Reclaimed by the stall checker while we were finishing.
                    warn!("Job {} finished but could not be completed: {}", job.id, e);
                }
            },
            Err(e) => {
                self.failed_count.fetch_add(1, Ordering::SeqCst);
                let message = e.to_string();

                match self.queue.fail_job(&job.id, &message).await {
                    Ok(FailureDisposition::Retrying { job, run_at }) => {
                        debug!("Job {} will retry at {}", job.id, run_at);
                        self.observer.on_failed(&job, &execution_id, &message).await;
                    }
                    Ok(FailureDisposition::Terminal { job }) => {
                        self.observer.on_failed(&job, &execution_id, &message).await;
                    }
                    Err(e) => warn!("Could not record failure for job {}: {}", job.id, e),
                }
            }
        }

        self.in_flight.remove(&job.id);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.heartbeat_interval();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {
                    for entry in self.in_flight.iter() {
                        self.queue.touch(entry.key());
                    }
                }
            }
        }
    }

    async fn stalled_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.stalled_interval();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {
                    match self
                        .queue
                        .check_stalled(interval, self.config.max_stalled_count)
                        .await
                    {
                        Ok(outcomes) => {
                            for stalled in outcomes {
                                let message = match stalled.disposition {
                                    StallDisposition::Requeued => {
                                        "job stalled: worker stopped heartbeating (requeued)"
                                    }
                                    StallDisposition::Failed => {
                                        "job stalled: worker stopped heartbeating (stall budget exhausted)"
                                    }
                                };
                                self.observer
                                    .on_failed(&stalled.job, &stalled.execution_id, message)
                                    .await;
                            }
                        }
                        Err(e) => warn!("Stalled-job check failed: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::job::{BackoffPolicy, EnqueueOptions, JobStatus};
    use crate::observer::NoopObserver;
    use crate::queue::JobSpec;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct OkHandler;

    #[async_trait]
    impl JobHandler for OkHandler {
        async fn execute(&self, _ctx: &JobContext, payload: &Value) -> Result<Value, QueueError> {
            Ok(json!({"echo": payload}))
        }
    }

    struct FailHandler {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for FailHandler {
        async fn execute(&self, _ctx: &JobContext, _payload: &Value) -> Result<Value, QueueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::ExecutionFailed("always fails".to_string()))
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            max_stalled_count: 1,
            stalled_interval_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            poll_interval_ms: 10,
        }
    }

    async fn pool_with(
        handlers: Vec<(&str, Arc<dyn JobHandler>)>,
    ) -> (Arc<JobQueue>, Arc<WorkerPool>) {
        let queue = Arc::new(JobQueue::new(QueueConfig::default()));
        let registry = Arc::new(HandlerRegistry::new());
        for (name, handler) in handlers {
            registry.register(name, handler).await;
        }

        let pool = Arc::new(WorkerPool::new(
            fast_config(),
            queue.clone(),
            registry,
            Arc::new(NoopObserver),
        ));
        (queue, pool)
    }

    #[tokio::test]
    async fn test_registry_register_and_validate() {
        let registry = HandlerRegistry::new();
        registry.register("send-email", Arc::new(OkHandler)).await;

        assert!(registry.get("send-email").await.is_some());
        assert!(registry.get("unknown").await.is_none());

        assert!(registry.validate(&["send-email".to_string()]).await.is_ok());
        let err = registry
            .validate(&["send-email".to_string(), "unknown".to_string()])
            .await;
        assert!(matches!(err, Err(QueueError::HandlerNotFound(name)) if name == "unknown"));
    }

    #[tokio::test]
    async fn test_pool_executes_job() {
        let (queue, pool) =
            pool_with(vec![("echo", Arc::new(OkHandler) as Arc<dyn JobHandler>)]).await;
        pool.clone().start();

        queue
            .enqueue(JobSpec::new("echo", json!({"n": 1})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        assert_eq!(pool.completed_count(), 1);
        let status = queue.status().await.unwrap();
        assert_eq!(status.completed, 1);
        assert_eq!(status.active, 0);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_job() {
        let (queue, pool) = pool_with(vec![]).await;
        pool.clone().start();

        queue
            .enqueue(
                JobSpec::new("nobody-home", json!(null)).with_opts(
                    EnqueueOptions::default()
                        .with_attempts(1),
                ),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        let status = queue.status().await.unwrap();
        assert_eq!(status.failed, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let (queue, pool) = pool_with(vec![(
            "flaky",
            Arc::new(FailHandler { calls: calls.clone() }) as Arc<dyn JobHandler>,
        )])
        .await;
        pool.clone().start();

        queue
            .enqueue(
                JobSpec::new("flaky", json!(null)).with_opts(
                    EnqueueOptions::default()
                        .with_attempts(3)
                        .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10))),
                ),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        // Attempted exactly `attempts` times, then terminal.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let status = queue.status().await.unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.waiting + status.delayed, 0);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        struct SlowHandler {
            peak: Arc<AtomicU32>,
            current: Arc<AtomicU32>,
        }

        #[async_trait]
        impl JobHandler for SlowHandler {
            async fn execute(&self, _ctx: &JobContext, _payload: &Value) -> Result<Value, QueueError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }

        let peak = Arc::new(AtomicU32::new(0));
        let current = Arc::new(AtomicU32::new(0));
        let (queue, pool) = pool_with(vec![(
            "slow",
            Arc::new(SlowHandler {
                peak: peak.clone(),
                current: current.clone(),
            }) as Arc<dyn JobHandler>,
        )])
        .await;
        pool.clone().start();

        for _ in 0..6 {
            queue.enqueue(JobSpec::new("slow", json!(null))).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        assert_eq!(pool.completed_count(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_pause_stops_intake() {
        let (queue, pool) =
            pool_with(vec![("echo", Arc::new(OkHandler) as Arc<dyn JobHandler>)]).await;
        pool.clone().start();
        pool.pause(false).await;

        queue.enqueue(JobSpec::new("echo", json!(null))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.completed_count(), 0);

        pool.resume();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(pool.completed_count(), 1);
    }

    #[tokio::test]
    async fn test_stall_recovery_by_second_worker() {
        let (queue, pool) =
            pool_with(vec![("echo", Arc::new(OkHandler) as Arc<dyn JobHandler>)]).await;

        queue.enqueue(JobSpec::new("echo", json!(null))).await.unwrap();

        // Simulate a worker that took the job and died: lease it directly
        // and never heartbeat.
        let lease = queue.next_job().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let outcomes = queue
            .check_stalled(Duration::from_millis(10), 1)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].job.id, lease.job.id);

        // A live pool picks the requeued job up and completes it.
        pool.clone().start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.shutdown(Duration::from_secs(1)).await;

        let status = queue.status().await.unwrap();
        assert_eq!(status.completed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        struct SlowOk;

        #[async_trait]
        impl JobHandler for SlowOk {
            async fn execute(&self, _ctx: &JobContext, _payload: &Value) -> Result<Value, QueueError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!(null))
            }
        }

        let (queue, pool) =
            pool_with(vec![("slow", Arc::new(SlowOk) as Arc<dyn JobHandler>)]).await;
        pool.clone().start();

        queue.enqueue(JobSpec::new("slow", json!(null))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Drain waits out the 100ms handler.
        pool.shutdown(Duration::from_secs(2)).await;
        assert_eq!(pool.completed_count(), 1);
        assert!(!pool.is_running());
    }
}
