//! Job persistence store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::job::{Job, JobStatus};

/// Job store trait for persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Save a job.
    async fn save(&self, job: &Job) -> Result<(), QueueError>;

    /// Load a job by ID.
    async fn load(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Update a job.
    async fn update(&self, job: &Job) -> Result<(), QueueError>;

    /// Delete a job.
    async fn delete(&self, id: &str) -> Result<(), QueueError>;

    /// Load all jobs waiting to run (waiting or delayed).
    async fn load_pending(&self) -> Result<Vec<Job>, QueueError>;

    /// List all jobs in a status.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, QueueError>;

    /// Count jobs in a status.
    async fn count_by_status(&self, status: JobStatus) -> Result<usize, QueueError>;
}

/// In-memory job store.
pub struct MemoryJobStore {
    jobs: tokio::sync::RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        Self {
            jobs: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), QueueError> {
        self.save(job).await
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(id);
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Waiting | JobStatus::Delayed))
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<usize, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| j.status == status).count())
    }
}

/// File system based job store.
///
/// Jobs are stored as individual JSON files organized by status:
/// ```text
/// {storage_path}/
/// └── jobs/
///     ├── waiting/
///     │   └── {id}.json
///     ├── delayed/
///     ├── active/
///     ├── completed/
///     └── failed/
/// ```
pub struct FileJobStore {
    storage_path: PathBuf,
}

const STATUSES: [JobStatus; 5] = [
    JobStatus::Waiting,
    JobStatus::Delayed,
    JobStatus::Active,
    JobStatus::Completed,
    JobStatus::Failed,
];

fn status_name(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Waiting => "waiting",
        JobStatus::Delayed => "delayed",
        JobStatus::Active => "active",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

impl FileJobStore {
    /// Create a new file-based job store rooted at `storage_path`.
    pub async fn new(storage_path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let storage_path = storage_path.into();
        let jobs_dir = storage_path.join("jobs");

        for status in STATUSES {
            let dir = jobs_dir.join(status_name(status));
            fs::create_dir_all(&dir).await.map_err(|e| {
                QueueError::Storage(format!(
                    "Failed to create {} directory: {}",
                    status_name(status),
                    e
                ))
            })?;
        }

        debug!("FileJobStore initialized at {:?}", storage_path);
        Ok(Self { storage_path })
    }

    fn status_dir(&self, status: JobStatus) -> PathBuf {
        self.storage_path.join("jobs").join(status_name(status))
    }

    fn job_path(&self, id: &str, status: JobStatus) -> PathBuf {
        self.status_dir(status).join(format!("{}.json", sanitize_id(id)))
    }

    async fn find_job_file(&self, id: &str) -> Option<(PathBuf, JobStatus)> {
        for status in STATUSES {
            let path = self.job_path(id, status);
            if path.exists() {
                return Some((path, status));
            }
        }
        None
    }

    async fn read_status_dir(&self, status: JobStatus) -> Result<Vec<Job>, QueueError> {
        let dir = self.status_dir(status);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to read {:?}: {}", dir, e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<Job>(&content) {
                    Ok(job) => jobs.push(job),
                    Err(e) => warn!("Failed to deserialize job from {:?}: {}", path, e),
                },
                Err(e) => warn!("Failed to read job file {:?}: {}", path, e),
            }
        }

        Ok(jobs)
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        // Move the file when the status changed since the last save.
        if let Some((old_path, old_status)) = self.find_job_file(&job.id).await {
            if old_status != job.status {
                fs::remove_file(&old_path).await.ok();
            }
        }

        let path = self.job_path(&job.id, job.status);
        let content = serde_json::to_string_pretty(job)
            .map_err(|e| QueueError::Storage(format!("Failed to serialize job: {}", e)))?;

        fs::write(&path, content)
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to write job file: {}", e)))?;

        debug!("Saved job '{}' to {:?}", job.id, path);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let Some((path, _)) = self.find_job_file(id).await else {
            return Ok(None);
        };

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to read job file: {}", e)))?;

        let job: Job = serde_json::from_str(&content)
            .map_err(|e| QueueError::Storage(format!("Failed to deserialize job: {}", e)))?;

        Ok(Some(job))
    }

    async fn update(&self, job: &Job) -> Result<(), QueueError> {
        self.save(job).await
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        if let Some((path, _)) = self.find_job_file(id).await {
            fs::remove_file(&path)
                .await
                .map_err(|e| QueueError::Storage(format!("Failed to delete job file: {}", e)))?;
            debug!("Deleted job '{}'", id);
        }
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs = self.read_status_dir(JobStatus::Waiting).await?;
        jobs.extend(self.read_status_dir(JobStatus::Delayed).await?);

        // Highest priority first, then oldest.
        jobs.sort_by(|a, b| {
            b.opts
                .priority
                .cmp(&a.opts.priority)
                .then_with(|| a.effective_run_at().cmp(&b.effective_run_at()))
        });

        debug!("Loaded {} pending jobs", jobs.len());
        Ok(jobs)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, QueueError> {
        self.read_status_dir(status).await
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<usize, QueueError> {
        Ok(self.read_status_dir(status).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::new(temp_dir.path()).await.unwrap();

        let job = Job::new("send-email", json!({"to": "a@b.com"}));
        store.save(&job).await.unwrap();

        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "send-email");
        assert_eq!(loaded.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_file_store_status_change_moves_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::new(temp_dir.path()).await.unwrap();

        let mut job = Job::new("t", json!(null));
        store.save(&job).await.unwrap();
        assert!(store.job_path(&job.id, JobStatus::Waiting).exists());

        job.status = JobStatus::Active;
        store.save(&job).await.unwrap();
        assert!(!store.job_path(&job.id, JobStatus::Waiting).exists());
        assert!(store.job_path(&job.id, JobStatus::Active).exists());
    }

    #[tokio::test]
    async fn test_file_store_load_pending_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::new(temp_dir.path()).await.unwrap();

        let mut low = Job::new("low", json!(null));
        low.opts.priority = -1;
        let mut high = Job::new("high", json!(null));
        high.opts.priority = 5;
        let normal = Job::new("normal", json!(null));

        store.save(&low).await.unwrap();
        store.save(&normal).await.unwrap();
        store.save(&high).await.unwrap();

        let pending = store.load_pending().await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].name, "high");
        assert_eq!(pending[1].name, "normal");
        assert_eq!(pending[2].name, "low");
    }

    #[tokio::test]
    async fn test_file_store_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::new(temp_dir.path()).await.unwrap();

        let job = Job::new("gone", json!(null));
        store.save(&job).await.unwrap();
        store.delete(&job.id).await.unwrap();

        assert!(store.load(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_counts() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::new(temp_dir.path()).await.unwrap();

        let mut done = Job::new("done", json!(null));
        done.status = JobStatus::Completed;
        store.save(&done).await.unwrap();
        store.save(&Job::new("w", json!(null))).await.unwrap();

        assert_eq!(store.count_by_status(JobStatus::Completed).await.unwrap(), 1);
        assert_eq!(store.count_by_status(JobStatus::Waiting).await.unwrap(), 1);
        assert_eq!(store.count_by_status(JobStatus::Failed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sanitize_id_for_path() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::new(temp_dir.path()).await.unwrap();

        // Cron-style ids contain colons.
        let job = Job::new("tick", json!(null)).with_id("heartbeat:1700000000");
        store.save(&job).await.unwrap();

        let loaded = store.load("heartbeat:1700000000").await.unwrap();
        assert!(loaded.is_some());
    }
}
