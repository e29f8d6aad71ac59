//! Job and run-history persistence

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use super::types::{
    Job, JobRow, JobRun, JobRunRow, JobRunStatus, JobStatus, Result, SchedulerError,
};

/// SQLite-backed job store
#[derive(Clone)]
pub struct JobStore {
    pool: Pool<Sqlite>,
}

impl JobStore {
    /// Create a store over an open pool
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert or replace a job
    pub async fn save_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO jobs (
                id, user_id, name, kind, cron_expr, next_run_at, last_run_at,
                is_active, status, config, wallet_ids, account_ids, campaign_id,
                total_runs, success_runs, failed_runs, created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.user_id.to_string())
        .bind(&job.name)
        .bind(job.kind.as_str())
        .bind(&job.cron_expr)
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(job.is_active)
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.config)?)
        .bind(serde_json::to_string(&job.wallet_ids)?)
        .bind(serde_json::to_string(&job.account_ids)?)
        .bind(job.campaign_id.map(|id| id.to_string()))
        .bind(job.total_runs)
        .bind(job.success_runs)
        .bind(job.failed_runs)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a live job
    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        let row: JobRow =
            sqlx::query_as("SELECT * FROM jobs WHERE id = ? AND deleted_at IS NULL")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .ok_or(SchedulerError::JobNotFound(id))?;
        row.try_into()
    }

    /// Live jobs, optionally for one user, newest first
    pub async fn list_jobs(&self, user_id: Option<Uuid>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = match user_id {
            Some(user) => {
                sqlx::query_as(
                    "SELECT * FROM jobs WHERE user_id = ? AND deleted_at IS NULL ORDER BY created_at DESC",
                )
                .bind(user.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM jobs WHERE deleted_at IS NULL ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Active, non-paused jobs that carry a cron expression
    pub async fn list_active_cron_jobs(&self) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE is_active = TRUE AND deleted_at IS NULL
              AND cron_expr IS NOT NULL AND status != 'paused'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Active jobs whose next run is due and that are neither running nor paused
    pub async fn list_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE is_active = TRUE AND deleted_at IS NULL
              AND status NOT IN ('running', 'paused')
              AND next_run_at IS NOT NULL AND next_run_at <= ?
            ORDER BY next_run_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Set a job's status
    pub async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound(id));
        }
        Ok(())
    }

    /// Set a job's next due time
    pub async fn set_next_run(&self, id: Uuid, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE jobs SET next_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(next_run_at)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a job running and stamp its last run
    pub async fn mark_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'running', last_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fold a finished run into the job's counters
    pub async fn record_outcome(
        &self,
        id: Uuid,
        success: bool,
        status: JobStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                total_runs = total_runs + 1,
                success_runs = success_runs + ?,
                failed_runs = failed_runs + ?,
                status = ?,
                next_run_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(success))
        .bind(i64::from(!success))
        .bind(status.as_str())
        .bind(next_run_at)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Soft-delete a job
    pub async fn soft_delete(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET deleted_at = ?, is_active = FALSE, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound(id));
        }
        Ok(())
    }

    /// Open a run-history row
    pub async fn record_run_start(&self, job_id: Uuid, queued_job_id: Option<Uuid>) -> Result<JobRun> {
        let run = JobRun {
            id: Uuid::new_v4(),
            job_id,
            queued_job_id,
            started_at: Utc::now(),
            finished_at: None,
            status: JobRunStatus::Running,
            message: None,
        };
        sqlx::query(
            "INSERT INTO job_runs (id, job_id, queued_job_id, started_at, status) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(run.job_id.to_string())
        .bind(run.queued_job_id.map(|id| id.to_string()))
        .bind(run.started_at)
        .bind(run.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    /// Close a run-history row
    pub async fn finish_run(&self, run_id: Uuid, status: JobRunStatus, message: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE job_runs SET status = ?, message = ?, finished_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(message)
            .bind(Utc::now())
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Run history of a job, newest first
    pub async fn runs_for_job(&self, job_id: Uuid, limit: i64) -> Result<Vec<JobRun>> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            "SELECT * FROM job_runs WHERE job_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(job_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
