//! Database schema management.

use rusqlite::Connection;
use tokio_rusqlite::Error;

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = r#"
-- Execution log table
CREATE TABLE IF NOT EXISTS execution_logs (
    execution_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    job_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_ms INTEGER,
    result TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);

-- Indexes for history and retention queries
CREATE INDEX IF NOT EXISTS idx_execution_logs_job ON execution_logs(job_id);
CREATE INDEX IF NOT EXISTS idx_execution_logs_started ON execution_logs(started_at);
CREATE INDEX IF NOT EXISTS idx_execution_logs_status ON execution_logs(status);
"#;
