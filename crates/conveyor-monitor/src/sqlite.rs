//! SQLite execution log store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use std::path::Path;
use tokio_rusqlite::Connection;

use crate::error::MonitorError;
use crate::record::{ExecutionOutcome, ExecutionRecord, ExecutionStats, ExecutionStatus, HistoryQuery};
use crate::schema::init_schema;
use crate::store::ExecutionLogStore;

/// SQLite-backed execution log store.
pub struct SqliteExecutionStore {
    conn: Connection,
}

impl SqliteExecutionStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, MonitorError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))?;

        conn.call(|conn| Ok(init_schema(conn)?))
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))?;

        Ok(Self { conn })
    }

    /// Create a new file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path)
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))?;

        conn.call(|conn| Ok(init_schema(conn)?))
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))?;

        Ok(Self { conn })
    }
}

// Fixed-width timestamps so string comparison matches time order.
fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_time(s: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status_str: String = row.get(3)?;
    let started_str: String = row.get(4)?;
    let finished_str: Option<String> = row.get(5)?;
    let result_str: Option<String> = row.get(7)?;

    let finished_at = match finished_str {
        Some(s) => Some(decode_time(&s, 5)?),
        None => None,
    };

    Ok(ExecutionRecord {
        execution_id: row.get(0)?,
        job_id: row.get(1)?,
        job_name: row.get(2)?,
        status: ExecutionStatus::parse(&status_str).unwrap_or(ExecutionStatus::Failed),
        started_at: decode_time(&started_str, 4)?,
        finished_at,
        duration_ms: row.get(6)?,
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get(8)?,
        retry_count: row.get(9)?,
    })
}

const RECORD_COLUMNS: &str = "execution_id, job_id, job_name, status, started_at, finished_at, \
                              duration_ms, result, error_message, retry_count";

#[async_trait]
impl ExecutionLogStore for SqliteExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), MonitorError> {
        let record = record.clone();
        let result_json = match &record.result {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| MonitorError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO execution_logs (execution_id, job_id, job_name, status, started_at, \
                     finished_at, duration_ms, result, error_message, retry_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        record.execution_id,
                        record.job_id,
                        record.job_name,
                        record.status.as_str(),
                        encode_time(record.started_at),
                        record.finished_at.map(encode_time),
                        record.duration_ms,
                        result_json,
                        record.error_message,
                        record.retry_count,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))
    }

    async fn finish(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<(), MonitorError> {
        let execution_id = execution_id.to_string();
        let result_json = match &outcome.result {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| MonitorError::Serialization(e.to_string()))?,
            ),
            None => None,
        };

        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let started: Option<String> = tx
                    .query_row(
                        "SELECT started_at FROM execution_logs WHERE execution_id = ?1",
                        [&execution_id],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let Some(started) = started else {
                    return Ok(false);
                };

                let duration_ms = decode_time(&started, 0)
                    .ok()
                    .map(|started_at| (outcome.finished_at - started_at).num_milliseconds());

                tx.execute(
                    "UPDATE execution_logs
                     SET status = ?1, finished_at = ?2, duration_ms = ?3, result = ?4,
                         error_message = ?5, retry_count = ?6
                     WHERE execution_id = ?7",
                    params![
                        outcome.status.as_str(),
                        encode_time(outcome.finished_at),
                        duration_ms,
                        result_json,
                        outcome.error_message,
                        outcome.retry_count,
                        execution_id,
                    ],
                )?;

                tx.commit()?;
                Ok(true)
            })
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))?;

        if !updated {
            return Err(MonitorError::NotFound("execution not found".to_string()));
        }
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, MonitorError> {
        let execution_id = execution_id.to_string();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM execution_logs WHERE execution_id = ?1",
                    RECORD_COLUMNS
                ))?;

                match stmt.query_row([&execution_id], row_to_record) {
                    Ok(record) => Ok(Some(record)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))
    }

    async fn history(
        &self,
        job_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<ExecutionRecord>, MonitorError> {
        let mut sql = format!(
            "SELECT {} FROM execution_logs WHERE job_id = ?1",
            RECORD_COLUMNS
        );
        let mut args: Vec<String> = vec![job_id.to_string()];

        if let Some(status) = query.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(start) = query.start_date {
            args.push(encode_time(start));
            sql.push_str(&format!(" AND started_at >= ?{}", args.len()));
        }
        if let Some(end) = query.end_date {
            args.push(encode_time(end));
            sql.push_str(&format!(" AND started_at <= ?{}", args.len()));
        }

        sql.push_str(&format!(
            " ORDER BY started_at DESC LIMIT {} OFFSET {}",
            query.limit, query.offset
        ));

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))
    }

    async fn stats(
        &self,
        job_id: &str,
        since: DateTime<Utc>,
    ) -> Result<ExecutionStats, MonitorError> {
        let job_id = job_id.to_string();
        let since = encode_time(since);

        self.conn
            .call(move |conn| {
                let row = conn.query_row(
                    "SELECT COUNT(*),
                            SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                            SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                            AVG(duration_ms),
                            MAX(started_at)
                     FROM execution_logs
                     WHERE job_id = ?1 AND started_at >= ?2",
                    params![job_id, since],
                    |row| {
                        let total: i64 = row.get(0)?;
                        let completed: Option<i64> = row.get(1)?;
                        let failed: Option<i64> = row.get(2)?;
                        let avg: Option<f64> = row.get(3)?;
                        let last: Option<String> = row.get(4)?;
                        Ok((total, completed, failed, avg, last))
                    },
                )?;

                let (total, completed, failed, avg, last) = row;
                let completed = completed.unwrap_or(0).max(0) as u64;
                let failed = failed.unwrap_or(0).max(0) as u64;
                let finished = completed + failed;

                let last_execution = match last {
                    Some(s) => Some(decode_time(&s, 4)?),
                    None => None,
                };

                Ok(ExecutionStats {
                    total: total.max(0) as u64,
                    completed,
                    failed,
                    success_rate: if finished == 0 {
                        0.0
                    } else {
                        completed as f64 / finished as f64
                    },
                    avg_duration_ms: avg,
                    last_execution,
                })
            })
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, MonitorError> {
        let cutoff = encode_time(cutoff);

        self.conn
            .call(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM execution_logs WHERE started_at < ?1",
                    [&cutoff],
                )?;
                Ok(deleted)
            })
            .await
            .map_err(|e| MonitorError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_queue::Job;
    use serde_json::json;

    fn record(job_id: &str, execution_id: &str) -> ExecutionRecord {
        let job = Job::new("t", json!({"n": 1})).with_id(job_id);
        ExecutionRecord::started(&job, execution_id)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();

        store.insert(&record("job-1", "exec-1")).await.unwrap();

        let loaded = store.get("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.job_id, "job-1");
        assert_eq!(loaded.status, ExecutionStatus::Active);
        assert!(loaded.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_finish_computes_duration() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        store.insert(&record("job-1", "exec-1")).await.unwrap();

        store
            .finish("exec-1", ExecutionOutcome::completed(json!({"ok": true}), 1))
            .await
            .unwrap();

        let loaded = store.get("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert!(loaded.duration_ms.is_some());
        assert!(loaded.duration_ms.unwrap() >= 0);
        assert_eq!(loaded.result, Some(json!({"ok": true})));
        assert_eq!(loaded.retry_count, 1);
    }

    #[tokio::test]
    async fn test_finish_unknown_execution() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();
        let result = store
            .finish("ghost", ExecutionOutcome::failed("boom", 0))
            .await;
        assert!(matches!(result, Err(MonitorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_history_with_filters() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();

        for i in 0..4 {
            let exec_id = format!("exec-{}", i);
            store.insert(&record("job-1", &exec_id)).await.unwrap();
            let outcome = if i < 3 {
                ExecutionOutcome::completed(json!(null), 0)
            } else {
                ExecutionOutcome::failed("boom", 1)
            };
            store.finish(&exec_id, outcome).await.unwrap();
        }
        store.insert(&record("job-2", "other")).await.unwrap();

        let all = store
            .history("job-1", &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 4);

        let failed = store
            .history(
                "job-1",
                &HistoryQuery {
                    status: Some(ExecutionStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("boom"));

        let page = store
            .history(
                "job-1",
                &HistoryQuery {
                    limit: 2,
                    offset: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();

        for (i, ok) in [true, false, true, true].iter().enumerate() {
            let exec_id = format!("exec-{}", i);
            store.insert(&record("job-1", &exec_id)).await.unwrap();
            let outcome = if *ok {
                ExecutionOutcome::completed(json!(null), 0)
            } else {
                ExecutionOutcome::failed("boom", 1)
            };
            store.finish(&exec_id, outcome).await.unwrap();
        }

        let stats = store
            .stats("job-1", Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
        assert!(stats.avg_duration_ms.is_some());
        assert!(stats.last_execution.is_some());
    }

    #[tokio::test]
    async fn test_stats_empty_window() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();

        let stats = store
            .stats("job-1", Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.avg_duration_ms.is_none());
        assert!(stats.last_execution.is_none());
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();

        let mut old = record("job-1", "old");
        old.started_at = Utc::now() - chrono::Duration::days(90);
        store.insert(&old).await.unwrap();
        store.insert(&record("job-1", "fresh")).await.unwrap();

        let deleted = store
            .delete_older_than(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_backed_store() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("executions.db");

        {
            let store = SqliteExecutionStore::open(&path).await.unwrap();
            store.insert(&record("job-1", "exec-1")).await.unwrap();
        }

        // Reopen: the record survived.
        let store = SqliteExecutionStore::open(&path).await.unwrap();
        assert!(store.get("exec-1").await.unwrap().is_some());
    }
}
