//! Audit trail persistence

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite, Transaction};
use uuid::Uuid;

use super::types::{
    AuditEntry, AuditError, AuditFilter, AuditResult, AuditRow, Finalization, Result,
    UserActivity,
};

const INSERT: &str = r#"
    INSERT INTO audit_logs (
        id, user_id, wallet_id, account_id, task_execution_id, job_id,
        action, platform, resource_type, resource_id, request_data, response_data,
        result, error_message, proof_type, proof_value, duration_ms,
        idempotency_key, ip_address, user_agent, created_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// SQLite-backed audit store
#[derive(Clone)]
pub struct AuditStore {
    pool: Pool<Sqlite>,
}

fn opt_json(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

impl AuditStore {
    /// Create a store over an open pool
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    async fn insert_with<'e, E>(executor: E, entry: &AuditEntry) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(INSERT)
            .bind(entry.id.to_string())
            .bind(entry.user_id.to_string())
            .bind(entry.wallet_id.map(|id| id.to_string()))
            .bind(entry.account_id.map(|id| id.to_string()))
            .bind(entry.task_execution_id.map(|id| id.to_string()))
            .bind(entry.job_id.map(|id| id.to_string()))
            .bind(entry.action.as_str())
            .bind(entry.platform.map(|p| p.as_str()))
            .bind(&entry.resource_type)
            .bind(&entry.resource_id)
            .bind(opt_json(&entry.request_data)?)
            .bind(opt_json(&entry.response_data)?)
            .bind(entry.result.as_str())
            .bind(&entry.error_message)
            .bind(&entry.proof_type)
            .bind(&entry.proof_value)
            .bind(entry.duration_ms)
            .bind(&entry.idempotency_key)
            .bind(&entry.ip_address)
            .bind(&entry.user_agent)
            .bind(entry.created_at)
            .execute(executor)
            .await
            .map_err(|e| AuditError::from_insert(e, entry.idempotency_key.as_deref()))?;
        Ok(())
    }

    /// Insert one entry
    pub async fn insert(&self, entry: &AuditEntry) -> Result<()> {
        Self::insert_with(&self.pool, entry).await
    }

    /// Insert entries in one transaction
    pub async fn insert_batch(&self, entries: &[AuditEntry]) -> Result<()> {
        let mut tx: Transaction<'_, Sqlite> = self.pool.begin().await?;
        for entry in entries {
            Self::insert_with(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Get an entry by id
    pub async fn get(&self, id: Uuid) -> Result<AuditEntry> {
        let row: AuditRow = sqlx::query_as("SELECT * FROM audit_logs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuditError::NotFound(id))?;
        row.try_into()
    }

    /// Get the entry recorded under an idempotency key
    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<AuditEntry>> {
        let row: Option<AuditRow> =
            sqlx::query_as("SELECT * FROM audit_logs WHERE idempotency_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Results of every entry keyed `<base>:<attempt>`, oldest first
    pub async fn attempt_results(&self, base: &str) -> Result<Vec<AuditResult>> {
        let prefix = format!("{}:", base);
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT result FROM audit_logs
            WHERE substr(idempotency_key, 1, ?) = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(prefix.len() as i64)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| r.parse()).collect()
    }

    /// Upgrade a pending entry to its terminal result
    ///
    /// The `result = 'pending'` guard makes this exactly-once.
    pub async fn finalize(&self, id: Uuid, outcome: &Finalization) -> Result<AuditEntry> {
        let (proof_type, proof_value) = match &outcome.proof {
            Some((kind, value)) => (Some(kind.as_str()), Some(value.as_str())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE audit_logs SET
                result = ?,
                response_data = COALESCE(?, response_data),
                error_message = COALESCE(?, error_message),
                proof_type = COALESCE(?, proof_type),
                proof_value = COALESCE(?, proof_value),
                duration_ms = ?
            WHERE id = ? AND result = 'pending'
            "#,
        )
        .bind(outcome.result.as_str())
        .bind(opt_json(&outcome.response_data)?)
        .bind(&outcome.error_message)
        .bind(proof_type)
        .bind(proof_value)
        .bind(outcome.duration.as_millis().min(i64::MAX as u128) as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from one that was already finalized
            self.get(id).await?;
            return Err(AuditError::AlreadyFinalized(id));
        }
        self.get(id).await
    }

    fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AuditFilter) {
        qb.push(" WHERE 1=1");
        if let Some(id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(id.to_string());
        }
        if let Some(id) = filter.wallet_id {
            qb.push(" AND wallet_id = ").push_bind(id.to_string());
        }
        if let Some(id) = filter.account_id {
            qb.push(" AND account_id = ").push_bind(id.to_string());
        }
        if let Some(id) = filter.task_execution_id {
            qb.push(" AND task_execution_id = ").push_bind(id.to_string());
        }
        if let Some(id) = filter.job_id {
            qb.push(" AND job_id = ").push_bind(id.to_string());
        }
        if let Some(action) = filter.action {
            qb.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(platform) = filter.platform {
            qb.push(" AND platform = ").push_bind(platform.as_str());
        }
        if let Some(result) = filter.result {
            qb.push(" AND result = ").push_bind(result.as_str());
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at < ").push_bind(until);
        }
    }

    /// Filtered page of entries, newest first, plus the unpaged total
    pub async fn query(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditEntry>, u64)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_logs");
        Self::push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_logs");
        Self::push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows: Vec<AuditRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let entries = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>>>()?;
        Ok((entries, total.max(0) as u64))
    }

    /// Delete entries created before `cutoff`
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Counts per action and result for one user
    pub async fn user_activity(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<UserActivity> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT action, result, COUNT(*)
            FROM audit_logs
            WHERE user_id = ? AND created_at >= ?
            GROUP BY action, result
            "#,
        )
        .bind(user_id.to_string())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut activity = UserActivity::default();
        for (action, result, count) in rows {
            let count = count.max(0) as u64;
            activity.total += count;
            *activity.by_action.entry(action).or_default() += count;
            *activity.by_result.entry(result).or_default() += count;
        }
        Ok(activity)
    }

    /// Number of entries still pending
    pub async fn count_pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs WHERE result = ?")
            .bind(AuditResult::Pending.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
