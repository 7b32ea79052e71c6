//! Priority job queue with retry, retention, and stall bookkeeping.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conveyor_coordination::IdempotencyStore;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{EnqueueOptions, Job, JobStatus};
use crate::store::{JobStore, MemoryJobStore};

/// Wrapper for priority queue ordering.
struct PrioritizedJob(Job);

impl PartialEq for PrioritizedJob {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for PrioritizedJob {}

impl PartialOrd for PrioritizedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier run time.
        match self.0.opts.priority.cmp(&other.0.opts.priority) {
            Ordering::Equal => other.0.effective_run_at().cmp(&self.0.effective_run_at()),
            ordering => ordering,
        }
    }
}

/// A job handed to a worker, with the execution id assigned at activation.
#[derive(Debug, Clone)]
pub struct JobLease {
    /// The activated job.
    pub job: Job,
    /// Unique id for this execution attempt.
    pub execution_id: String,
}

/// Result of submitting a job.
#[derive(Debug, Clone)]
pub enum Enqueued {
    /// A new job was created.
    Created(Job),
    /// The submission collapsed onto existing work.
    Deduplicated {
        /// Existing job id or idempotency key.
        id: String,
    },
}

impl Enqueued {
    /// The created job, if one was.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Enqueued::Created(job) => Some(job),
            Enqueued::Deduplicated { .. } => None,
        }
    }

    /// The id this submission resolved to.
    pub fn id(&self) -> &str {
        match self {
            Enqueued::Created(job) => &job.id,
            Enqueued::Deduplicated { id } => id,
        }
    }
}

/// What happened to a job after a failed execution.
#[derive(Debug, Clone)]
pub enum FailureDisposition {
    /// Another attempt was scheduled.
    Retrying {
        /// Updated job.
        job: Job,
        /// When the retry becomes runnable.
        run_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the job is terminally failed.
    Terminal {
        /// Updated job.
        job: Job,
    },
}

/// What happened to a stalled job.
#[derive(Debug, Clone)]
pub enum StallDisposition {
    /// Requeued for another worker.
    Requeued,
    /// Stall budget exhausted; terminally failed.
    Failed,
}

/// A job reclaimed from a worker that stopped heartbeating.
#[derive(Debug, Clone)]
pub struct StalledJob {
    /// Updated job.
    pub job: Job,
    /// Execution id of the abandoned attempt.
    pub execution_id: String,
    /// Outcome of the reclaim.
    pub disposition: StallDisposition,
}

/// Counts per lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub total: usize,
}

/// A job submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Handler key.
    pub name: String,
    /// Payload handed to the handler.
    pub payload: Value,
    /// Caller-assigned job id, deduplicating resubmissions.
    #[serde(default)]
    pub job_id: Option<String>,
    /// Option overrides.
    #[serde(default)]
    pub opts: EnqueueOptions,
}

impl JobSpec {
    /// Create a submission for the named handler.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            job_id: None,
            opts: EnqueueOptions::default(),
        }
    }

    /// Set a caller-assigned job id.
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Set option overrides.
    pub fn with_opts(mut self, opts: EnqueueOptions) -> Self {
        self.opts = opts;
        self
    }
}

struct ActiveEntry {
    job: Job,
    execution_id: String,
    last_heartbeat: Instant,
}

/// Durable, ordered holding area for jobs.
pub struct JobQueue {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    idempotency: Option<Arc<IdempotencyStore>>,
    queue: tokio::sync::RwLock<BinaryHeap<PrioritizedJob>>,
    active: DashMap<String, ActiveEntry>,
    paused: AtomicBool,
}

impl JobQueue {
    /// Create a queue with an in-memory store and no idempotency layer.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryJobStore::new()))
    }

    /// Create a queue with a custom store.
    pub fn with_store(config: QueueConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            store,
            idempotency: None,
            queue: tokio::sync::RwLock::new(BinaryHeap::new()),
            active: DashMap::new(),
            paused: AtomicBool::new(false),
        }
    }

    /// Attach an idempotency store consulted on enqueue.
    pub fn with_idempotency(mut self, idempotency: Arc<IdempotencyStore>) -> Self {
        self.idempotency = Some(idempotency);
        self
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Submit a job.
    ///
    /// Succeeds immediately regardless of eventual execution outcome. The
    /// submission is deduplicated when its idempotency key is already
    /// processed or a job with the same caller-assigned id already exists.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Enqueued, QueueError> {
        let opts = self.config.resolve_options(&spec.name, &spec.opts);

        if let (Some(key), Some(idempotency)) = (&opts.idempotency_key, &self.idempotency) {
            if idempotency.is_processed(key).await {
                debug!("Enqueue of '{}' collapsed onto processed key {}", spec.name, key);
                return Ok(Enqueued::Deduplicated { id: key.clone() });
            }
        }

        let id = spec
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if spec.job_id.is_some() {
            if let Some(existing) = self.store.load(&id).await? {
                debug!("Job {} already submitted ({:?})", id, existing.status);
                return Ok(Enqueued::Deduplicated { id });
            }
        }

        if self.config.max_queue_size > 0 {
            let queue = self.queue.read().await;
            if queue.len() as u64 >= self.config.max_queue_size {
                return Err(QueueError::QueueFull);
            }
        }

        let job = Job::new(spec.name, spec.payload)
            .with_id(id)
            .with_opts(opts);

        self.store.save(&job).await?;

        let mut queue = self.queue.write().await;
        debug!("Enqueueing job {} (name: {}, priority: {})", job.id, job.name, job.opts.priority);
        queue.push(PrioritizedJob(job.clone()));

        Ok(Enqueued::Created(job))
    }

    /// Submit several jobs, merging options per item.
    pub async fn enqueue_bulk(&self, specs: Vec<JobSpec>) -> Result<Vec<Enqueued>, QueueError> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            results.push(self.enqueue(spec).await?);
        }
        Ok(results)
    }

    /// Stop handing out jobs; queued jobs are kept.
    pub fn pause(&self) {
        self.paused.store(true, AtomicOrdering::SeqCst);
        info!("Queue '{}' paused", self.config.name);
    }

    /// Resume handing out jobs.
    pub fn resume(&self) {
        self.paused.store(false, AtomicOrdering::SeqCst);
        info!("Queue '{}' resumed", self.config.name);
    }

    /// Whether intake is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(AtomicOrdering::SeqCst)
    }

    /// Counts per lifecycle state.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let (waiting, delayed) = {
            let queue = self.queue.read().await;
            let now = Utc::now();
            let delayed = queue
                .iter()
                .filter(|p| p.0.run_at.map(|at| at > now).unwrap_or(false))
                .count();
            (queue.len() - delayed, delayed)
        };

        let active = self.active.len();
        let completed = self.store.count_by_status(JobStatus::Completed).await?;
        let failed = self.store.count_by_status(JobStatus::Failed).await?;

        Ok(QueueStatus {
            waiting,
            active,
            completed,
            failed,
            delayed,
            total: waiting + active + completed + failed + delayed,
        })
    }

    /// Hand the highest-priority ready job to a worker.
    ///
    /// Returns `None` when the queue is paused or nothing is ready. The job
    /// transitions to active and starts heartbeat tracking.
    pub async fn next_job(&self) -> Result<Option<JobLease>, QueueError> {
        if self.is_paused() {
            return Ok(None);
        }

        let mut queue = self.queue.write().await;

        // Skim off not-yet-ready jobs to reach the first ready one.
        let mut not_ready = Vec::new();
        let mut found = None;

        while let Some(prioritized) = queue.pop() {
            if prioritized.0.is_ready() {
                found = Some(prioritized.0);
                break;
            }
            not_ready.push(prioritized);
        }

        for prioritized in not_ready {
            queue.push(prioritized);
        }
        drop(queue);

        let Some(mut job) = found else {
            return Ok(None);
        };

        job.status = JobStatus::Active;
        job.updated_at = Utc::now();
        self.store.update(&job).await?;

        let execution_id = Uuid::new_v4().to_string();
        self.active.insert(
            job.id.clone(),
            ActiveEntry {
                job: job.clone(),
                execution_id: execution_id.clone(),
                last_heartbeat: Instant::now(),
            },
        );

        debug!("Dequeued job {} (execution {})", job.id, execution_id);
        Ok(Some(JobLease { job, execution_id }))
    }

    /// Record a heartbeat for an active job. Returns false when the job is
    /// no longer tracked (completed or reclaimed).
    pub fn touch(&self, id: &str) -> bool {
        match self.active.get_mut(id) {
            Some(mut entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Number of jobs currently being executed.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Mark an active job completed.
    pub async fn complete_job(&self, id: &str, result: Value) -> Result<Job, QueueError> {
        let Some((_, entry)) = self.active.remove(id) else {
            return Err(QueueError::JobNotFound(id.to_string()));
        };

        let mut job = entry.job;
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.updated_at = now;
        job.finished_at = Some(now);
        job.result = Some(result.clone());

        self.store.update(&job).await?;

        // Later submissions under the same key collapse onto this result.
        if let (Some(key), Some(idempotency)) = (&job.opts.idempotency_key, &self.idempotency) {
            if let Err(e) = idempotency.mark_processed(key, &result, None).await {
                warn!("Failed to mark idempotency key {} processed: {}", key, e);
            }
        }

        self.apply_retention(JobStatus::Completed, &job).await;

        debug!("Job {} completed", job.id);
        Ok(job)
    }

    /// Mark an active job's execution failed, scheduling a retry when
    /// attempts remain.
    pub async fn fail_job(&self, id: &str, error: &str) -> Result<FailureDisposition, QueueError> {
        let Some((_, entry)) = self.active.remove(id) else {
            return Err(QueueError::JobNotFound(id.to_string()));
        };

        let mut job = entry.job;
        let now = Utc::now();
        job.attempts_made += 1;
        job.last_error = Some(error.to_string());
        job.updated_at = now;

        if job.can_retry() {
            let delay = job.opts.backoff.delay_for(job.attempts_made);
            let run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            job.status = JobStatus::Delayed;
            job.run_at = Some(run_at);

            self.store.update(&job).await?;

            let mut queue = self.queue.write().await;
            queue.push(PrioritizedJob(job.clone()));
            drop(queue);

            debug!(
                "Job {} failed (attempt {}/{}), retrying at {}",
                job.id, job.attempts_made, job.opts.attempts, run_at
            );
            Ok(FailureDisposition::Retrying { job, run_at })
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);

            self.store.update(&job).await?;
            self.apply_retention(JobStatus::Failed, &job).await;

            warn!(
                "Job {} terminally failed after {} attempts: {}",
                job.id, job.attempts_made, error
            );
            Ok(FailureDisposition::Terminal { job })
        }
    }

    /// Reclaim active jobs whose last heartbeat is older than
    /// `stalled_after`. Each is requeued, or terminally failed once it has
    /// stalled more than `max_stalled_count` times.
    pub async fn check_stalled(
        &self,
        stalled_after: Duration,
        max_stalled_count: u32,
    ) -> Result<Vec<StalledJob>, QueueError> {
        let stalled_ids: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.last_heartbeat.elapsed() > stalled_after)
            .map(|entry| entry.key().clone())
            .collect();

        let mut outcomes = Vec::new();
        for id in stalled_ids {
            let Some((_, entry)) = self.active.remove(&id) else {
                continue;
            };

            let mut job = entry.job;
            let now = Utc::now();
            job.stalled_count += 1;
            job.updated_at = now;

            if job.stalled_count > max_stalled_count {
                job.status = JobStatus::Failed;
                job.last_error = Some("job stalled: worker stopped heartbeating".to_string());
                job.finished_at = Some(now);

                self.store.update(&job).await?;
                self.apply_retention(JobStatus::Failed, &job).await;

                warn!("Job {} failed: stall budget exhausted ({} stalls)", job.id, job.stalled_count);
                outcomes.push(StalledJob {
                    job,
                    execution_id: entry.execution_id,
                    disposition: StallDisposition::Failed,
                });
            } else {
                job.status = JobStatus::Waiting;
                job.run_at = None;

                self.store.update(&job).await?;

                let mut queue = self.queue.write().await;
                queue.push(PrioritizedJob(job.clone()));
                drop(queue);

                info!("Job {} presumed abandoned, requeued (stall {})", job.id, job.stalled_count);
                outcomes.push(StalledJob {
                    job,
                    execution_id: entry.execution_id,
                    disposition: StallDisposition::Requeued,
                });
            }
        }

        Ok(outcomes)
    }

    /// Remove terminal jobs finished more than `older_than` ago, at most
    /// `limit` of them, oldest first. Returns the number removed.
    pub async fn clean(
        &self,
        older_than: Duration,
        limit: usize,
        state: JobStatus,
    ) -> Result<usize, QueueError> {
        if !matches!(state, JobStatus::Completed | JobStatus::Failed) {
            return Err(QueueError::InvalidState(format!(
                "clean only applies to terminal jobs, got {:?}",
                state
            )));
        }

        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut candidates: Vec<Job> = self
            .store
            .list_by_status(state)
            .await?
            .into_iter()
            .filter(|j| j.finished_at.map(|at| at < cutoff).unwrap_or(false))
            .collect();

        candidates.sort_by_key(|j| j.finished_at);

        let mut removed = 0;
        for job in candidates.into_iter().take(limit) {
            self.store.delete(&job.id).await?;
            removed += 1;
        }

        if removed > 0 {
            info!("Cleaned {} {:?} jobs from '{}'", removed, state, self.config.name);
        }
        Ok(removed)
    }

    /// Requeue terminally failed jobs with a fresh attempt budget. Returns
    /// the number requeued.
    pub async fn retry_failed(&self, limit: Option<usize>) -> Result<usize, QueueError> {
        let mut failed = self.store.list_by_status(JobStatus::Failed).await?;
        failed.sort_by_key(|j| j.finished_at);

        let take = limit.unwrap_or(failed.len());
        let mut requeued = 0;

        for mut job in failed.into_iter().take(take) {
            job.status = JobStatus::Waiting;
            job.attempts_made = 0;
            job.stalled_count = 0;
            job.run_at = None;
            job.finished_at = None;
            job.updated_at = Utc::now();

            self.store.update(&job).await?;

            let mut queue = self.queue.write().await;
            queue.push(PrioritizedJob(job));
            drop(queue);

            requeued += 1;
        }

        if requeued > 0 {
            info!("Requeued {} failed jobs on '{}'", requeued, self.config.name);
        }
        Ok(requeued)
    }

    /// Rebuild the in-memory queue from the store's waiting and delayed
    /// jobs, e.g. after a restart. Safe to call on a queue that already
    /// holds jobs: every pending job is persisted, so the rebuild cannot
    /// lose or duplicate work.
    pub async fn load_from_store(&self) -> Result<usize, QueueError> {
        let pending = self.store.load_pending().await?;
        let mut queue = self.queue.write().await;
        queue.clear();

        let count = pending.len();
        for job in pending {
            queue.push(PrioritizedJob(job));
        }

        info!("Loaded {} pending jobs into '{}'", count, self.config.name);
        Ok(count)
    }

    /// Apply the finishing job's retention policy to its terminal set.
    async fn apply_retention(&self, state: JobStatus, finished: &Job) {
        let policy = match state {
            JobStatus::Completed => finished.opts.remove_on_complete,
            JobStatus::Failed => finished.opts.remove_on_fail,
            _ => return,
        };
        if policy.is_unbounded() {
            return;
        }

        let mut terminal = match self.store.list_by_status(state).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Retention sweep skipped, list failed: {}", e);
                return;
            }
        };

        // Newest first; count bound keeps the head, age bound drops the old.
        terminal.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));

        let mut to_remove: Vec<String> = Vec::new();
        if let Some(max_count) = policy.max_count {
            for job in terminal.iter().skip(max_count) {
                to_remove.push(job.id.clone());
            }
        }
        if let Some(max_age) = policy.max_age {
            let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
            for job in &terminal {
                if job.finished_at.map(|at| at < cutoff).unwrap_or(false)
                    && !to_remove.contains(&job.id)
                {
                    to_remove.push(job.id.clone());
                }
            }
        }

        for id in to_remove {
            if let Err(e) = self.store.delete(&id).await {
                warn!("Retention sweep failed to delete {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BackoffPolicy, RetentionPolicy};
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::new(QueueConfig::default())
    }

    #[tokio::test]
    async fn test_enqueue_dequeue() {
        let queue = queue();

        let enqueued = queue.enqueue(JobSpec::new("t", json!(1))).await.unwrap();
        let job = enqueued.job().unwrap().clone();

        let lease = queue.next_job().await.unwrap().unwrap();
        assert_eq!(lease.job.id, job.id);
        assert_eq!(lease.job.status, JobStatus::Active);
        assert_eq!(queue.active_count(), 1);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = queue();

        for (name, priority) in [("low", -5), ("high", 5), ("normal", 0)] {
            queue
                .enqueue(
                    JobSpec::new(name, json!(null))
                        .with_opts(EnqueueOptions::default().with_priority(priority)),
                )
                .await
                .unwrap();
        }

        assert_eq!(queue.next_job().await.unwrap().unwrap().job.name, "high");
        assert_eq!(queue.next_job().await.unwrap().unwrap().job.name, "normal");
        assert_eq!(queue.next_job().await.unwrap().unwrap().job.name, "low");
    }

    #[tokio::test]
    async fn test_delayed_job_not_handed_out_early() {
        let queue = queue();

        queue
            .enqueue(
                JobSpec::new("later", json!(null))
                    .with_opts(EnqueueOptions::default().with_delay(Duration::from_secs(3600))),
            )
            .await
            .unwrap();

        assert!(queue.next_job().await.unwrap().is_none());

        let status = queue.status().await.unwrap();
        assert_eq!(status.delayed, 1);
        assert_eq!(status.waiting, 0);
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let queue = queue();
        queue.enqueue(JobSpec::new("t", json!(null))).await.unwrap();

        queue.pause();
        assert!(queue.next_job().await.unwrap().is_none());

        queue.resume();
        assert!(queue.next_job().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_caller_assigned_id_deduplicates() {
        let queue = queue();
        let spec = JobSpec::new("tick", json!(null)).with_job_id("heartbeat:100");

        let first = queue.enqueue(spec.clone()).await.unwrap();
        assert!(matches!(first, Enqueued::Created(_)));

        let second = queue.enqueue(spec).await.unwrap();
        assert!(matches!(second, Enqueued::Deduplicated { .. }));
        assert_eq!(second.id(), "heartbeat:100");

        let status = queue.status().await.unwrap();
        assert_eq!(status.waiting, 1);
    }

    #[tokio::test]
    async fn test_retry_backoff_then_terminal() {
        let queue = queue();
        queue
            .enqueue(
                JobSpec::new("flaky", json!(null)).with_opts(
                    EnqueueOptions::default()
                        .with_attempts(2)
                        .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10))),
                ),
            )
            .await
            .unwrap();

        let lease = queue.next_job().await.unwrap().unwrap();
        let disposition = queue.fail_job(&lease.job.id, "boom").await.unwrap();
        let FailureDisposition::Retrying { job, .. } = disposition else {
            panic!("expected retry after first failure");
        };
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.status, JobStatus::Delayed);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let lease = queue.next_job().await.unwrap().unwrap();
        let disposition = queue.fail_job(&lease.job.id, "boom again").await.unwrap();
        let FailureDisposition::Terminal { job } = disposition else {
            panic!("expected terminal failure after second attempt");
        };
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.status, JobStatus::Failed);

        // Nothing left to run.
        assert!(queue.next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_job() {
        let queue = queue();
        queue.enqueue(JobSpec::new("t", json!(null))).await.unwrap();

        let lease = queue.next_job().await.unwrap().unwrap();
        let job = queue
            .complete_job(&lease.job.id, json!({"ok": true}))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_job_requeued_then_failed() {
        let queue = queue();
        queue.enqueue(JobSpec::new("t", json!(null))).await.unwrap();

        // First stall: requeued.
        let lease = queue.next_job().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let outcomes = queue
            .check_stalled(Duration::from_millis(10), 1)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].disposition, StallDisposition::Requeued));
        assert_eq!(outcomes[0].execution_id, lease.execution_id);

        // Second stall exceeds max_stalled_count = 1: terminal.
        queue.next_job().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let outcomes = queue
            .check_stalled(Duration::from_millis(10), 1)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].disposition, StallDisposition::Failed));
        assert_eq!(outcomes[0].job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_heartbeat_prevents_stall() {
        let queue = queue();
        queue.enqueue(JobSpec::new("t", json!(null))).await.unwrap();

        let lease = queue.next_job().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.touch(&lease.job.id));

        let outcomes = queue
            .check_stalled(Duration::from_millis(25), 1)
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_clean_respects_grace_and_limit() {
        let queue = queue();

        for i in 0..3 {
            queue
                .enqueue(JobSpec::new(format!("job-{}", i), json!(null)))
                .await
                .unwrap();
            let lease = queue.next_job().await.unwrap().unwrap();
            queue.complete_job(&lease.job.id, json!(null)).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Grace period covers everything: nothing removed.
        let removed = queue
            .clean(Duration::from_secs(3600), 10, JobStatus::Completed)
            .await
            .unwrap();
        assert_eq!(removed, 0);

        // Zero grace, limit 2: two oldest removed.
        let removed = queue
            .clean(Duration::ZERO, 2, JobStatus::Completed)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(queue.status().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_clean_rejects_non_terminal_state() {
        let queue = queue();
        let result = queue.clean(Duration::ZERO, 10, JobStatus::Active).await;
        assert!(matches!(result, Err(QueueError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_retry_failed_resets_attempts() {
        let queue = queue();
        queue
            .enqueue(JobSpec::new("t", json!(null)).with_opts(EnqueueOptions::default().with_attempts(1)))
            .await
            .unwrap();

        let lease = queue.next_job().await.unwrap().unwrap();
        queue.fail_job(&lease.job.id, "boom").await.unwrap();
        assert_eq!(queue.status().await.unwrap().failed, 1);

        let requeued = queue.retry_failed(None).await.unwrap();
        assert_eq!(requeued, 1);

        let lease = queue.next_job().await.unwrap().unwrap();
        assert_eq!(lease.job.attempts_made, 0);
        assert_eq!(lease.job.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_retention_count_bound() {
        let mut config = QueueConfig::default();
        config.default_options.remove_on_complete = RetentionPolicy {
            max_age: None,
            max_count: Some(2),
        };
        let queue = JobQueue::new(config);

        for i in 0..4 {
            queue
                .enqueue(JobSpec::new(format!("job-{}", i), json!(null)))
                .await
                .unwrap();
            let lease = queue.next_job().await.unwrap().unwrap();
            queue.complete_job(&lease.job.id, json!(null)).await.unwrap();
        }

        assert_eq!(queue.status().await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_idempotency_key_collapses_after_completion() {
        use conveyor_coordination::CoordinationConfig;
        use conveyor_kv::MemoryKvStore;

        let kv = Arc::new(MemoryKvStore::new());
        let idem = Arc::new(IdempotencyStore::new(kv, &CoordinationConfig::default()));
        let queue = JobQueue::new(QueueConfig::default()).with_idempotency(idem.clone());

        let spec = JobSpec::new("send-email", json!({"to": "a@b.com"}))
            .with_opts(EnqueueOptions::default().with_idempotency_key("welcome-42"));

        let first = queue.enqueue(spec.clone()).await.unwrap();
        assert!(matches!(first, Enqueued::Created(_)));

        let lease = queue.next_job().await.unwrap().unwrap();
        queue
            .complete_job(&lease.job.id, json!({"sent": true}))
            .await
            .unwrap();
        assert!(idem.is_processed("welcome-42").await);

        // The second submission returns a placeholder, no new job.
        let second = queue.enqueue(spec).await.unwrap();
        assert!(matches!(second, Enqueued::Deduplicated { .. }));
        assert_eq!(second.id(), "welcome-42");
        assert_eq!(queue.status().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_enqueue_bulk() {
        let queue = queue();

        let results = queue
            .enqueue_bulk(vec![
                JobSpec::new("a", json!(1)),
                JobSpec::new("b", json!(2)),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(queue.status().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = Arc::new(MemoryJobStore::new());
        {
            let queue = JobQueue::with_store(QueueConfig::default(), store.clone());
            queue.enqueue(JobSpec::new("t", json!(null))).await.unwrap();
        }

        // A fresh queue over the same store picks the job back up.
        let queue = JobQueue::with_store(QueueConfig::default(), store);
        assert_eq!(queue.load_from_store().await.unwrap(), 1);
        assert!(queue.next_job().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queue_full() {
        let config = QueueConfig {
            max_queue_size: 1,
            ..Default::default()
        };
        let queue = JobQueue::new(config);

        queue.enqueue(JobSpec::new("a", json!(null))).await.unwrap();
        let result = queue.enqueue(JobSpec::new("b", json!(null))).await;
        assert!(matches!(result, Err(QueueError::QueueFull)));
    }
}
