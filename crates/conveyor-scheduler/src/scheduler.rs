//! Cron scheduler with per-task timer tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use conveyor_coordination::LockManager;
use conveyor_queue::{Enqueued, JobQueue, JobSpec};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::task::{ScheduledTaskConfig, TaskConfigSource};

/// Snapshot of one schedule's state.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    /// Task name.
    pub name: String,
    /// Cron pattern.
    pub pattern: String,
    /// Registered and accepting ticks.
    pub is_running: bool,
    /// Ticks are being skipped.
    pub is_paused: bool,
    /// Registration was stopped.
    pub is_stopped: bool,
    /// A tick is firing right now.
    pub is_busy: bool,
    /// Next scheduled fire time.
    pub next_run: Option<DateTime<Utc>>,
    /// Last fire time in this process.
    pub previous_run: Option<DateTime<Utc>>,
}

struct TaskEntry {
    config: ScheduledTaskConfig,
    schedule: Schedule,
    paused: AtomicBool,
    stopped: AtomicBool,
    busy: AtomicBool,
    previous_run: tokio::sync::RwLock<Option<DateTime<Utc>>>,
    timer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskEntry {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Fires registered cron schedules and enqueues one job per tick.
///
/// With `use_lock` set on a task, a tick lock in the shared store guarantees
/// at most one enqueue per tick across all replicas running the same
/// schedule; replicas that fail to acquire simply skip the tick.
pub struct CronScheduler {
    config: SchedulerConfig,
    queue: Arc<JobQueue>,
    locks: Arc<LockManager>,
    entries: tokio::sync::RwLock<HashMap<String, Arc<TaskEntry>>>,
}

impl CronScheduler {
    /// Create a new scheduler enqueueing onto `queue`.
    pub fn new(config: SchedulerConfig, queue: Arc<JobQueue>, locks: Arc<LockManager>) -> Self {
        Self {
            config,
            queue,
            locks,
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register a schedule, replacing any existing one under the same name.
    pub async fn register(&self, config: ScheduledTaskConfig) -> Result<(), SchedulerError> {
        let schedule: Schedule = config.cron_pattern.parse().map_err(|e| {
            SchedulerError::InvalidPattern(format!("{}: {}", config.cron_pattern, e))
        })?;

        // Stop-then-replace.
        if self.remove_entry(&config.name).await {
            debug!("Replacing schedule '{}'", config.name);
        }

        let name = config.name.clone();
        let entry = Arc::new(TaskEntry {
            config,
            schedule,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            previous_run: tokio::sync::RwLock::new(None),
            timer: tokio::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(timer_loop(
            entry.clone(),
            self.queue.clone(),
            self.locks.clone(),
            self.config.clone(),
        ));
        *entry.timer.lock().await = Some(handle);

        let mut entries = self.entries.write().await;
        entries.insert(name.clone(), entry);
        info!("Registered schedule '{}'", name);
        Ok(())
    }

    /// Register every configuration from a source. Returns the count.
    pub async fn register_from_source(
        &self,
        source: &dyn TaskConfigSource,
    ) -> Result<usize, SchedulerError> {
        let configs = source.load_all().await?;
        let count = configs.len();
        for config in configs {
            self.register(config).await?;
        }
        Ok(count)
    }

    /// Force an immediate fire through the normal lock/enqueue path.
    ///
    /// Returns `None` when another replica held the tick lock.
    pub async fn trigger(&self, name: &str) -> Result<Option<Enqueued>, SchedulerError> {
        let entry = self.entry(name).await?;

        entry.busy.store(true, Ordering::SeqCst);
        let fired = fire(&entry, &self.queue, &self.locks, &self.config, Utc::now()).await;
        entry.busy.store(false, Ordering::SeqCst);

        *entry.previous_run.write().await = Some(Utc::now());
        Ok(fired)
    }

    /// Suspend ticks for a schedule.
    pub async fn pause(&self, name: &str) -> Result<(), SchedulerError> {
        let entry = self.entry(name).await?;
        entry.paused.store(true, Ordering::SeqCst);
        info!("Paused schedule '{}'", name);
        Ok(())
    }

    /// Resume ticks for a schedule.
    pub async fn resume(&self, name: &str) -> Result<(), SchedulerError> {
        let entry = self.entry(name).await?;
        entry.paused.store(false, Ordering::SeqCst);
        info!("Resumed schedule '{}'", name);
        Ok(())
    }

    /// Stop a schedule: clear its timer and forget the registration.
    pub async fn stop(&self, name: &str) -> Result<(), SchedulerError> {
        if !self.remove_entry(name).await {
            return Err(SchedulerError::TaskNotFound(name.to_string()));
        }
        info!("Stopped schedule '{}'", name);
        Ok(())
    }

    /// Stop every schedule.
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let entries = self.entries.read().await;
            entries.keys().cloned().collect()
        };
        for name in names {
            self.remove_entry(&name).await;
        }
        info!("All schedules stopped");
    }

    /// Status snapshot for one schedule.
    pub async fn status(&self, name: &str) -> Result<ScheduleStatus, SchedulerError> {
        let entry = self.entry(name).await?;
        Ok(self.snapshot(&entry).await)
    }

    /// Status snapshots for every registered schedule.
    pub async fn status_all(&self) -> Vec<ScheduleStatus> {
        let entries: Vec<Arc<TaskEntry>> = {
            let map = self.entries.read().await;
            map.values().cloned().collect()
        };

        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            statuses.push(self.snapshot(&entry).await);
        }
        statuses
    }

    /// Names of registered schedules.
    pub async fn task_names(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.keys().cloned().collect()
    }

    async fn snapshot(&self, entry: &TaskEntry) -> ScheduleStatus {
        let stopped = entry.is_stopped();
        let paused = entry.is_paused();

        ScheduleStatus {
            name: entry.config.name.clone(),
            pattern: entry.config.cron_pattern.clone(),
            is_running: !stopped && !paused,
            is_paused: paused,
            is_stopped: stopped,
            is_busy: entry.busy.load(Ordering::SeqCst),
            next_run: if stopped {
                None
            } else {
                entry.schedule.upcoming(Utc).next()
            },
            previous_run: *entry.previous_run.read().await,
        }
    }

    async fn entry(&self, name: &str) -> Result<Arc<TaskEntry>, SchedulerError> {
        let entries = self.entries.read().await;
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(name.to_string()))
    }

    /// Remove an entry, cancelling its timer. Returns whether one existed.
    async fn remove_entry(&self, name: &str) -> bool {
        let entry = {
            let mut entries = self.entries.write().await;
            entries.remove(name)
        };

        let Some(entry) = entry else {
            return false;
        };

        entry.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = entry.timer.lock().await.take() {
            handle.abort();
        }
        true
    }
}

async fn timer_loop(
    entry: Arc<TaskEntry>,
    queue: Arc<JobQueue>,
    locks: Arc<LockManager>,
    config: SchedulerConfig,
) {
    loop {
        if entry.is_stopped() {
            break;
        }

        let Some(next) = entry.schedule.upcoming(Utc).next() else {
            debug!("Schedule '{}' has no upcoming fire times", entry.config.name);
            break;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        if entry.is_stopped() {
            break;
        }
        if entry.is_paused() {
            debug!("Schedule '{}' paused, skipping tick at {}", entry.config.name, next);
            continue;
        }

        entry.busy.store(true, Ordering::SeqCst);
        fire(&entry, &queue, &locks, &config, next).await;
        entry.busy.store(false, Ordering::SeqCst);

        *entry.previous_run.write().await = Some(next);
    }
}

/// Run one tick: lock-protected when configured, then enqueue.
async fn fire(
    entry: &TaskEntry,
    queue: &JobQueue,
    locks: &LockManager,
    config: &SchedulerConfig,
    tick: DateTime<Utc>,
) -> Option<Enqueued> {
    let name = &entry.config.name;
    debug!("Schedule '{}' tick at {}", name, tick);

    if entry.config.use_lock {
        let lock_key = format!("{}{}", config.lock_key_prefix, name);
        let outcome = locks
            .with_lock(
                &lock_key,
                entry.config.lock_ttl(),
                config.with_lock_options(),
                || enqueue_tick(entry, queue, tick),
            )
            .await;

        match outcome {
            Some(enqueued) => enqueued,
            None => {
                info!("Schedule '{}' tick at {} handled by another replica", name, tick);
                None
            }
        }
    } else {
        enqueue_tick(entry, queue, tick).await
    }
}

async fn enqueue_tick(entry: &TaskEntry, queue: &JobQueue, tick: DateTime<Utc>) -> Option<Enqueued> {
    let name = &entry.config.name;
    let job_id = format!("{}:{}", name, tick.timestamp());

    let spec = JobSpec::new(name.clone(), entry.config.payload.clone())
        .with_job_id(job_id)
        .with_opts(entry.config.job_options.clone());

    match queue.enqueue(spec).await {
        Ok(enqueued) => {
            match &enqueued {
                Enqueued::Created(job) => debug!("Schedule '{}' enqueued job {}", name, job.id),
                Enqueued::Deduplicated { id } => {
                    debug!("Schedule '{}' tick {} already submitted", name, id)
                }
            }
            Some(enqueued)
        }
        Err(e) => {
            warn!("Schedule '{}' failed to enqueue tick: {}", name, e);
            None
        }
    }
}
