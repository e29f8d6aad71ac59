//! Task and execution persistence

use chrono::Utc;
use sqlx::{Pool, QueryBuilder, Sqlite};
use uuid::Uuid;

use super::types::{
    ExecutionError, ExecutionFilter, ExecutionRow, ExecutionStatus, Proof, Result, Task,
    TaskExecution, TaskRow,
};

/// SQLite-backed task store
#[derive(Clone)]
pub struct TaskStore {
    pool: Pool<Sqlite>,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_unique_violation())
}

impl TaskStore {
    /// Create a store over an open pool
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Save a task template, replacing any previous version
    pub async fn save_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO campaign_tasks (
                id, campaign_id, name, description, task_type, platform,
                target_url, target_account, action_text, requires_manual,
                depends_on, max_retries, config, order_index
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.campaign_id.to_string())
        .bind(&task.name)
        .bind(&task.description)
        .bind(task.task_type.as_str())
        .bind(task.platform.as_str())
        .bind(&task.target_url)
        .bind(&task.target_account)
        .bind(&task.action_text)
        .bind(task.requires_manual)
        .bind(task.depends_on.map(|id| id.to_string()))
        .bind(i64::from(task.max_retries))
        .bind(serde_json::to_string(&task.config)?)
        .bind(i64::from(task.order_index))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a task template
    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        let row: TaskRow = sqlx::query_as("SELECT * FROM campaign_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ExecutionError::TaskNotFound(id))?;
        row.try_into()
    }

    /// Tasks of a campaign in order
    pub async fn list_tasks(&self, campaign_id: Uuid) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM campaign_tasks WHERE campaign_id = ? ORDER BY order_index ASC",
        )
        .bind(campaign_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Insert a new execution
    ///
    /// Returns `false` when another execution already holds the idempotency key.
    pub async fn insert_execution(&self, execution: &TaskExecution) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_executions (
                id, task_id, user_id, wallet_id, account_id, status, idempotency_key,
                proof_type, proof_value, proof_data, action_text, retry_count, max_retries,
                error_code, error_message, browser_session_id, audit_log_id,
                started_at, completed_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.task_id.to_string())
        .bind(execution.user_id.to_string())
        .bind(execution.wallet_id.map(|id| id.to_string()))
        .bind(execution.account_id.map(|id| id.to_string()))
        .bind(execution.status.as_str())
        .bind(&execution.idempotency_key)
        .bind(execution.proof_type.map(|p| p.as_str()))
        .bind(&execution.proof_value)
        .bind(
            execution
                .proof_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&execution.action_text)
        .bind(i64::from(execution.retry_count))
        .bind(i64::from(execution.max_retries))
        .bind(&execution.error_code)
        .bind(&execution.error_message)
        .bind(&execution.browser_session_id)
        .bind(execution.audit_log_id.map(|id| id.to_string()))
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist every mutable field of an execution
    pub async fn update_execution(&self, execution: &mut TaskExecution) -> Result<()> {
        execution.updated_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE task_executions SET
                status = ?, proof_type = ?, proof_value = ?, proof_data = ?,
                action_text = ?, retry_count = ?, max_retries = ?,
                error_code = ?, error_message = ?, browser_session_id = ?,
                audit_log_id = ?, started_at = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.proof_type.map(|p| p.as_str()))
        .bind(&execution.proof_value)
        .bind(
            execution
                .proof_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&execution.action_text)
        .bind(i64::from(execution.retry_count))
        .bind(i64::from(execution.max_retries))
        .bind(&execution.error_code)
        .bind(&execution.error_message)
        .bind(&execution.browser_session_id)
        .bind(execution.audit_log_id.map(|id| id.to_string()))
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.updated_at)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ExecutionError::ExecutionNotFound(execution.id));
        }
        Ok(())
    }

    /// Move an execution to `to` only if it is currently in one of `from`
    ///
    /// Returns `false` when the status had already changed.
    pub async fn transition(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE task_executions SET status = ");
        qb.push_bind(to.as_str())
            .push(", error_message = COALESCE(")
            .push_bind(error_message.map(str::to_string))
            .push(", error_message), updated_at = ")
            .push_bind(Utc::now());
        if to.is_terminal() {
            qb.push(", completed_at = ").push_bind(Utc::now());
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.push(" AND status IN (");
        let mut statuses = qb.separated(", ");
        for status in from {
            statuses.push_bind(status.as_str());
        }
        statuses.push_unseparated(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Settle a manual execution with its proof in one conditional write
    ///
    /// Returns `false` when the execution was no longer `MANUAL_REQUIRED`.
    pub async fn complete_manual(&self, id: Uuid, proof: &Proof, audit_log_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE task_executions SET
                status = ?, proof_type = ?, proof_value = ?, proof_data = ?,
                audit_log_id = ?, error_code = NULL, error_message = NULL,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(ExecutionStatus::Done.as_str())
        .bind(proof.proof_type.as_str())
        .bind(&proof.value)
        .bind(proof.data.as_ref().map(serde_json::to_string).transpose()?)
        .bind(audit_log_id.to_string())
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .bind(ExecutionStatus::ManualRequired.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get an execution
    pub async fn get_execution(&self, id: Uuid) -> Result<TaskExecution> {
        let row: ExecutionRow = sqlx::query_as("SELECT * FROM task_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ExecutionError::ExecutionNotFound(id))?;
        row.try_into()
    }

    /// Get the execution holding an idempotency key
    pub async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<TaskExecution>> {
        let row: Option<ExecutionRow> =
            sqlx::query_as("SELECT * FROM task_executions WHERE idempotency_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Status of the newest execution of `task_id` by exactly this actor
    ///
    /// Absent actor ids match executions that had none.
    pub async fn latest_status(
        &self,
        task_id: Uuid,
        user_id: Uuid,
        account_id: Option<Uuid>,
        wallet_id: Option<Uuid>,
    ) -> Result<Option<ExecutionStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            SELECT status FROM task_executions
            WHERE task_id = ? AND user_id = ? AND account_id IS ? AND wallet_id IS ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(task_id.to_string())
        .bind(user_id.to_string())
        .bind(account_id.map(|id| id.to_string()))
        .bind(wallet_id.map(|id| id.to_string()))
        .fetch_optional(&self.pool)
        .await?;
        status.map(|s| s.parse()).transpose()
    }

    fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ExecutionFilter) {
        qb.push(" WHERE 1=1");
        if let Some(id) = filter.task_id {
            qb.push(" AND task_id = ").push_bind(id.to_string());
        }
        if let Some(id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(id.to_string());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
    }

    /// Filtered page of executions, newest first, plus the unpaged total
    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<TaskExecution>, u64)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM task_executions");
        Self::push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM task_executions");
        Self::push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows: Vec<ExecutionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let executions = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>>>()?;
        Ok((executions, total.max(0) as u64))
    }
}
