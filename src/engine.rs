//! Engine composition root.
//!
//! The engine wires the shared store, coordination primitives, job queue,
//! worker pool, cron scheduler, and execution monitor into one instance.
//! Every dependency is injected explicitly; nothing lives in process-wide
//! globals, so several independent engines can run in one process.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use conveyor_coordination::{IdempotencyStore, LockManager};
use conveyor_kv::{MemoryKvStore, SharedStore};
use conveyor_monitor::{
    ExecutionLogStore, ExecutionMonitor, ExecutionRecord, ExecutionStats, HistoryQuery,
    MemoryExecutionStore,
};
use conveyor_queue::{
    Enqueued, HandlerRegistry, JobHandler, JobQueue, JobSpec, JobStore, MemoryJobStore,
    QueueStatus, WorkerPool,
};
use conveyor_scheduler::{
    CronScheduler, ScheduleStatus, ScheduledTaskConfig, TaskConfigSource,
};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Builder for an [`Engine`].
///
/// Stores and the handler registry default to in-memory implementations;
/// production deployments inject a store every replica can reach.
pub struct EngineBuilder {
    config: EngineConfig,
    shared_store: Option<Arc<dyn SharedStore>>,
    job_store: Option<Arc<dyn JobStore>>,
    execution_store: Option<Arc<dyn ExecutionLogStore>>,
    registry: Option<Arc<HandlerRegistry>>,
}

impl EngineBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            shared_store: None,
            job_store: None,
            execution_store: None,
            registry: None,
        }
    }

    /// Set the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the shared store backing locks and idempotency records.
    pub fn with_shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared_store = Some(store);
        self
    }

    /// Set the job persistence store.
    pub fn with_job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Set the execution log store.
    pub fn with_execution_store(mut self, store: Arc<dyn ExecutionLogStore>) -> Self {
        self.execution_store = Some(store);
        self
    }

    /// Set a pre-populated handler registry.
    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Wire everything into an engine.
    pub fn build(self) -> Engine {
        let config = self.config;
        let shared_store = self
            .shared_store
            .unwrap_or_else(|| Arc::new(MemoryKvStore::new()));
        let job_store = self
            .job_store
            .unwrap_or_else(|| Arc::new(MemoryJobStore::new()));
        let execution_store = self
            .execution_store
            .unwrap_or_else(|| Arc::new(MemoryExecutionStore::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(HandlerRegistry::new()));

        let locks = Arc::new(LockManager::new(shared_store.clone(), &config.coordination));
        let idempotency = Arc::new(IdempotencyStore::new(
            shared_store.clone(),
            &config.coordination,
        ));

        let queue = Arc::new(
            JobQueue::with_store(config.queue.clone(), job_store)
                .with_idempotency(idempotency.clone()),
        );
        let monitor = Arc::new(ExecutionMonitor::new(execution_store));
        let workers = Arc::new(WorkerPool::new(
            config.worker.clone(),
            queue.clone(),
            registry.clone(),
            monitor.clone(),
        ));
        let scheduler = Arc::new(CronScheduler::new(
            config.scheduler.clone(),
            queue.clone(),
            locks.clone(),
        ));

        Engine {
            config,
            locks,
            idempotency,
            registry,
            queue,
            monitor,
            workers,
            scheduler,
            started: AtomicBool::new(false),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Job scheduling and execution engine.
pub struct Engine {
    config: EngineConfig,
    locks: Arc<LockManager>,
    idempotency: Arc<IdempotencyStore>,
    registry: Arc<HandlerRegistry>,
    queue: Arc<JobQueue>,
    monitor: Arc<ExecutionMonitor>,
    workers: Arc<WorkerPool>,
    scheduler: Arc<CronScheduler>,
    started: AtomicBool,
}

impl Engine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The idempotency store.
    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.idempotency
    }

    /// The job queue.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// The worker pool.
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// The cron scheduler.
    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    /// The execution monitor.
    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    /// Register a handler under a job name.
    pub async fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.registry.register(name, handler).await;
    }

    /// Register several handlers at once.
    pub async fn register_handlers(&self, map: HashMap<String, Arc<dyn JobHandler>>) {
        self.registry.register_all(map).await;
    }

    /// Register a recurring schedule.
    ///
    /// Fails fast when no handler is registered under the task name, before
    /// the schedule could start producing jobs nobody can execute.
    pub async fn register_schedule(&self, config: ScheduledTaskConfig) -> Result<(), EngineError> {
        self.registry
            .validate(std::slice::from_ref(&config.name))
            .await?;
        self.scheduler.register(config).await?;
        Ok(())
    }

    /// Register every schedule from a config source, validating handlers
    /// first. Returns the number registered.
    pub async fn load_schedules(
        &self,
        source: &dyn TaskConfigSource,
    ) -> Result<usize, EngineError> {
        let configs = source.load_all().await?;
        let count = configs.len();
        for config in configs {
            self.register_schedule(config).await?;
        }
        Ok(count)
    }

    /// Start the engine: reload pending jobs, validate that every registered
    /// schedule has a handler, then start the worker pool.
    ///
    /// Starting an already-started engine is a no-op.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let reloaded = self.queue.load_from_store().await?;
        if reloaded > 0 {
            info!("Recovered {} pending jobs from the store", reloaded);
        }

        let scheduled = self.scheduler.task_names().await;
        self.registry.validate(&scheduled).await?;

        self.workers.clone().start();
        info!("Engine started (queue '{}')", self.queue.name());
        Ok(())
    }

    /// Whether the engine has been started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: stop every schedule, then drain the worker pool,
    /// force-interrupting in-flight jobs still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Engine shutting down");
        self.scheduler.stop_all().await;
        self.workers.shutdown(timeout).await;
        self.started.store(false, Ordering::SeqCst);
        info!("Engine stopped");
    }

    /// Submit a job.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Enqueued, EngineError> {
        Ok(self.queue.enqueue(spec).await?)
    }

    /// Submit several jobs as one batch.
    pub async fn enqueue_bulk(&self, specs: Vec<JobSpec>) -> Result<Vec<Enqueued>, EngineError> {
        Ok(self.queue.enqueue_bulk(specs).await?)
    }

    /// Counts per job lifecycle state.
    pub async fn queue_status(&self) -> Result<QueueStatus, EngineError> {
        Ok(self.queue.status().await?)
    }

    /// Stop pulling new jobs; with `force`, interrupt in-flight executions.
    pub async fn pause(&self, force: bool) {
        self.workers.pause(force).await;
    }

    /// Resume pulling jobs.
    pub fn resume(&self) {
        self.workers.resume();
    }

    /// Force an immediate fire of a schedule through the lock/enqueue path.
    pub async fn trigger(&self, name: &str) -> Result<Option<Enqueued>, EngineError> {
        Ok(self.scheduler.trigger(name).await?)
    }

    /// Status snapshot of one schedule.
    pub async fn schedule_status(&self, name: &str) -> Result<ScheduleStatus, EngineError> {
        Ok(self.scheduler.status(name).await?)
    }

    /// Paginated execution history for a job.
    pub async fn execution_history(
        &self,
        job_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        Ok(self.monitor.get_execution_history(job_id, query).await?)
    }

    /// Aggregate execution statistics for a job over the trailing `days`.
    pub async fn execution_stats(
        &self,
        job_id: &str,
        days: u32,
    ) -> Result<ExecutionStats, EngineError> {
        Ok(self.monitor.get_execution_stats(job_id, days).await?)
    }

    /// Delete execution records older than `retention_days`.
    pub async fn cleanup_old_logs(&self, retention_days: u32) -> Result<usize, EngineError> {
        Ok(self.monitor.cleanup_old_logs(retention_days).await?)
    }

    /// Run `f` under a distributed lock, skipping when it is already held.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.locks
            .with_lock(key, ttl, self.config.coordination.with_lock_options(), f)
            .await
    }

    /// Run `f` at most once per idempotency key, returning the cached result
    /// on repeats.
    pub async fn run_idempotent<F, Fut>(&self, key: &str, f: F) -> Result<Value, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, conveyor_coordination::CoordinationError>>,
    {
        Ok(self
            .idempotency
            .run_idempotent(key, Default::default(), f)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_queue::{JobContext, QueueError};
    use conveyor_scheduler::MemoryTaskConfigSource;
    use serde_json::json;

    struct OkHandler;

    #[async_trait]
    impl JobHandler for OkHandler {
        async fn execute(&self, _ctx: &JobContext, payload: &Value) -> Result<Value, QueueError> {
            Ok(payload.clone())
        }
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let engine = Engine::builder().build();

        assert!(!engine.is_started());
        assert_eq!(engine.queue().name(), "default");
        assert_eq!(engine.queue_status().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_register_schedule_requires_handler() {
        let engine = Engine::builder().build();

        let result = engine
            .register_schedule(ScheduledTaskConfig::new("orphan", "0 * * * * *"))
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Queue(QueueError::HandlerNotFound(_)))
        ));

        engine.register_handler("orphan", Arc::new(OkHandler)).await;
        engine
            .register_schedule(ScheduledTaskConfig::new("orphan", "0 * * * * *"))
            .await
            .unwrap();
        engine.scheduler().stop_all().await;
    }

    #[tokio::test]
    async fn test_load_schedules_validates_each() {
        let engine = Engine::builder().build();
        engine.register_handler("known", Arc::new(OkHandler)).await;

        let source = MemoryTaskConfigSource::new();
        source
            .add(ScheduledTaskConfig::new("known", "0 * * * * *"))
            .await;
        source
            .add(ScheduledTaskConfig::new("unknown", "0 * * * * *"))
            .await;

        let result = engine.load_schedules(&source).await;
        assert!(result.is_err());
        engine.scheduler().stop_all().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let engine = Engine::builder().build();

        engine.start().await.unwrap();
        assert!(engine.is_started());
        engine.start().await.unwrap();

        engine.shutdown(Duration::from_millis(100)).await;
        assert!(!engine.is_started());
    }

    #[tokio::test]
    async fn test_enqueue_and_query_through_engine() {
        let engine = Engine::builder().build();
        engine.register_handler("echo", Arc::new(OkHandler)).await;
        engine.start().await.unwrap();

        engine
            .enqueue(JobSpec::new("echo", json!({"n": 1})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.shutdown(Duration::from_secs(1)).await;

        let status = engine.queue_status().await.unwrap();
        assert_eq!(status.completed, 1);
    }
}
