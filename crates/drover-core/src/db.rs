//! Relational store
//!
//! One SQLite database holds job definitions and run history, campaign task
//! templates, task executions and the audit trail. Each component owns a
//! store over a clone of the same pool; this module only opens the pool and
//! creates the schema.

use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use tracing::debug;

/// Shared SQLite pool
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if needed) the database at `path` and migrate it
    pub async fn from_path(path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        debug!(path = %path.display(), "Database ready");
        Ok(db)
    }

    /// The underlying pool
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Database {
    /// Make every insert into `table` fail until [`Database::unblock_inserts`]
    pub(crate) async fn block_inserts(&self, table: &str) {
        let sql = format!(
            "CREATE TRIGGER IF NOT EXISTS block_{table} BEFORE INSERT ON {table} \
             BEGIN SELECT RAISE(ABORT, '{table} offline'); END"
        );
        sqlx::query(&sql).execute(&self.pool).await.unwrap();
    }

    pub(crate) async fn unblock_inserts(&self, table: &str) {
        let sql = format!("DROP TRIGGER IF EXISTS block_{table}");
        sqlx::query(&sql).execute(&self.pool).await.unwrap();
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        cron_expr TEXT,
        next_run_at TIMESTAMP,
        last_run_at TIMESTAMP,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        status TEXT NOT NULL DEFAULT 'idle',
        config TEXT NOT NULL DEFAULT '{}',
        wallet_ids TEXT NOT NULL DEFAULT '[]',
        account_ids TEXT NOT NULL DEFAULT '[]',
        campaign_id TEXT,
        total_runs INTEGER NOT NULL DEFAULT 0,
        success_runs INTEGER NOT NULL DEFAULT 0,
        failed_runs INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL,
        deleted_at TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(is_active, next_run_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS job_runs (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        queued_job_id TEXT,
        started_at TIMESTAMP NOT NULL,
        finished_at TIMESTAMP,
        status TEXT NOT NULL,
        message TEXT,
        FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs(job_id, started_at)",
    r#"
    CREATE TABLE IF NOT EXISTS campaign_tasks (
        id TEXT PRIMARY KEY,
        campaign_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        task_type TEXT NOT NULL,
        platform TEXT NOT NULL,
        target_url TEXT,
        target_account TEXT,
        action_text TEXT,
        requires_manual BOOLEAN NOT NULL DEFAULT FALSE,
        depends_on TEXT,
        max_retries INTEGER NOT NULL DEFAULT 3,
        config TEXT NOT NULL DEFAULT '{}',
        order_index INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_campaign_tasks_campaign ON campaign_tasks(campaign_id, order_index)",
    r#"
    CREATE TABLE IF NOT EXISTS task_executions (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        wallet_id TEXT,
        account_id TEXT,
        status TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        proof_type TEXT,
        proof_value TEXT,
        proof_data TEXT,
        action_text TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        error_code TEXT,
        error_message TEXT,
        browser_session_id TEXT,
        audit_log_id TEXT,
        started_at TIMESTAMP,
        completed_at TIMESTAMP,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_executions_task ON task_executions(task_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_task_executions_user ON task_executions(user_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS audit_logs (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        wallet_id TEXT,
        account_id TEXT,
        task_execution_id TEXT,
        job_id TEXT,
        action TEXT NOT NULL,
        platform TEXT,
        resource_type TEXT,
        resource_id TEXT,
        request_data TEXT,
        response_data TEXT,
        result TEXT NOT NULL,
        error_message TEXT,
        proof_type TEXT,
        proof_value TEXT,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        idempotency_key TEXT UNIQUE,
        ip_address TEXT,
        user_agent TEXT,
        created_at TIMESTAMP NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_audit_user_time ON audit_logs(user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs(action)",
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_from_path_creates_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("drover.db");

        let db = Database::from_path(&path).await.unwrap();
        assert!(path.exists());

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for table in ["audit_logs", "campaign_tasks", "job_runs", "jobs", "task_executions"] {
            assert!(names.contains(&table), "missing table {}", table);
        }

        // Migrating twice is harmless
        Database::from_path(&path).await.unwrap();
    }
}
