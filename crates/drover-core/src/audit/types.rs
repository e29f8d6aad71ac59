//! Audit trail types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::platform::Platform;

/// Result type for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;

/// Audit error types
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// An entry with this idempotency key already exists
    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    /// No entry with this id
    #[error("audit entry not found: {0}")]
    NotFound(Uuid),

    /// Entry already carries a terminal result
    #[error("audit entry {0} is already finalized")]
    AlreadyFinalized(Uuid),

    /// A stored row could not be decoded
    #[error("invalid audit row: {0}")]
    InvalidRow(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuditError {
    pub(crate) fn from_insert(err: sqlx::Error, idempotency_key: Option<&str>) -> Self {
        let unique = err
            .as_database_error()
            .is_some_and(|e| e.is_unique_violation());
        match (unique, idempotency_key) {
            (true, Some(key)) => Self::DuplicateIdempotencyKey(key.to_string()),
            _ => Self::Database(err),
        }
    }
}

/// Auditable actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum AuditAction {
    Follow,
    Unfollow,
    Like,
    Unlike,
    Recast,
    Reply,
    Post,
    Join,
    Leave,
    Transaction,
    Claim,
    Connect,
    Sign,
    QuizAnswer,
    TaskStart,
    TaskComplete,
    TaskFail,
    TaskRetry,
    JobRun,
    JobComplete,
    JobFail,
    BrowserAction,
    Login,
    Logout,
    SettingsChange,
    AccountAdd,
    AccountRemove,
    WalletAdd,
    WalletRemove,
}

impl AuditAction {
    /// Every action
    pub const ALL: [AuditAction; 29] = [
        Self::Follow,
        Self::Unfollow,
        Self::Like,
        Self::Unlike,
        Self::Recast,
        Self::Reply,
        Self::Post,
        Self::Join,
        Self::Leave,
        Self::Transaction,
        Self::Claim,
        Self::Connect,
        Self::Sign,
        Self::QuizAnswer,
        Self::TaskStart,
        Self::TaskComplete,
        Self::TaskFail,
        Self::TaskRetry,
        Self::JobRun,
        Self::JobComplete,
        Self::JobFail,
        Self::BrowserAction,
        Self::Login,
        Self::Logout,
        Self::SettingsChange,
        Self::AccountAdd,
        Self::AccountRemove,
        Self::WalletAdd,
        Self::WalletRemove,
    ];

    /// Stored identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Unfollow => "unfollow",
            Self::Like => "like",
            Self::Unlike => "unlike",
            Self::Recast => "recast",
            Self::Reply => "reply",
            Self::Post => "post",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Transaction => "transaction",
            Self::Claim => "claim",
            Self::Connect => "connect",
            Self::Sign => "sign",
            Self::QuizAnswer => "quiz_answer",
            Self::TaskStart => "task_start",
            Self::TaskComplete => "task_complete",
            Self::TaskFail => "task_fail",
            Self::TaskRetry => "task_retry",
            Self::JobRun => "job_run",
            Self::JobComplete => "job_complete",
            Self::JobFail => "job_fail",
            Self::BrowserAction => "browser_action",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::SettingsChange => "settings_change",
            Self::AccountAdd => "account_add",
            Self::AccountRemove => "account_remove",
            Self::WalletAdd => "wallet_add",
            Self::WalletRemove => "wallet_remove",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| AuditError::InvalidRow(format!("unknown action: {}", s)))
    }
}

/// Outcome recorded for an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    /// Action succeeded
    Success,
    /// Action failed
    Failed,
    /// Attempt started, outcome not yet known
    Pending,
    /// Action was not attempted
    Skipped,
}

impl AuditResult {
    /// Stored identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Pending => "pending",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for AuditResult {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "pending" => Ok(Self::Pending),
            "skipped" => Ok(Self::Skipped),
            other => Err(AuditError::InvalidRow(format!("unknown result: {}", other))),
        }
    }
}

/// One audit trail row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id
    pub id: Uuid,
    /// Acting user
    pub user_id: Uuid,
    /// Wallet involved
    pub wallet_id: Option<Uuid>,
    /// Social account involved
    pub account_id: Option<Uuid>,
    /// Task execution this attempt belongs to
    pub task_execution_id: Option<Uuid>,
    /// Job this attempt belongs to
    pub job_id: Option<Uuid>,
    /// What was done
    pub action: AuditAction,
    /// Where it was done
    pub platform: Option<Platform>,
    /// Kind of the target resource
    pub resource_type: Option<String>,
    /// Target resource
    pub resource_id: Option<String>,
    /// Request snapshot
    pub request_data: Option<serde_json::Value>,
    /// Response snapshot
    pub response_data: Option<serde_json::Value>,
    /// Outcome
    pub result: AuditResult,
    /// Failure description
    pub error_message: Option<String>,
    /// Proof kind
    pub proof_type: Option<String>,
    /// Proof value
    pub proof_value: Option<String>,
    /// Wall time of the action
    pub duration_ms: i64,
    /// Unique per logical action
    pub idempotency_key: Option<String>,
    /// Client address
    pub ip_address: Option<String>,
    /// Client agent
    pub user_agent: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// New entry stamped now
    pub fn new(user_id: Uuid, action: AuditAction, result: AuditResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            wallet_id: None,
            account_id: None,
            task_execution_id: None,
            job_id: None,
            action,
            platform: None,
            resource_type: None,
            resource_id: None,
            request_data: None,
            response_data: None,
            result,
            error_message: None,
            proof_type: None,
            proof_value: None,
            duration_ms: 0,
            idempotency_key: None,
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
        }
    }

    /// Set platform
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Set wallet
    #[must_use]
    pub fn with_wallet(mut self, wallet_id: Option<Uuid>) -> Self {
        self.wallet_id = wallet_id;
        self
    }

    /// Set account
    #[must_use]
    pub fn with_account(mut self, account_id: Option<Uuid>) -> Self {
        self.account_id = account_id;
        self
    }

    /// Link to a task execution
    #[must_use]
    pub fn with_task_execution(mut self, execution_id: Uuid) -> Self {
        self.task_execution_id = Some(execution_id);
        self
    }

    /// Link to a job
    #[must_use]
    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Set target resource
    #[must_use]
    pub fn with_resource(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.resource_type = Some(kind.into());
        self.resource_id = Some(id.into());
        self
    }

    /// Attach request snapshot
    #[must_use]
    pub fn with_request(mut self, data: serde_json::Value) -> Self {
        self.request_data = Some(data);
        self
    }

    /// Attach response snapshot
    #[must_use]
    pub fn with_response(mut self, data: serde_json::Value) -> Self {
        self.response_data = Some(data);
        self
    }

    /// Set failure description
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Set proof
    #[must_use]
    pub fn with_proof(mut self, proof_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.proof_type = Some(proof_type.into());
        self.proof_value = Some(value.into());
        self
    }

    /// Set duration
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis().min(i64::MAX as u128) as i64;
        self
    }

    /// Set idempotency key
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set client address and agent
    #[must_use]
    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }
}

/// Terminal outcome applied by [`AuditLogger::finalize`](super::AuditLogger::finalize)
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    /// Success or failed
    pub result: AuditResult,
    /// Response snapshot
    pub response_data: Option<serde_json::Value>,
    /// Failure description
    pub error_message: Option<String>,
    /// Proof kind and value
    pub proof: Option<(String, String)>,
    /// Wall time of the action
    pub duration: Duration,
}

impl Finalization {
    /// Successful outcome
    pub fn success(duration: Duration) -> Self {
        Self {
            result: AuditResult::Success,
            response_data: None,
            error_message: None,
            proof: None,
            duration,
        }
    }

    /// Failed outcome
    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: AuditResult::Failed,
            response_data: None,
            error_message: Some(error.into()),
            proof: None,
            duration,
        }
    }

    /// Attach proof
    #[must_use]
    pub fn with_proof(mut self, proof_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.proof = Some((proof_type.into(), value.into()));
        self
    }

    /// Attach response snapshot
    #[must_use]
    pub fn with_response(mut self, data: serde_json::Value) -> Self {
        self.response_data = Some(data);
        self
    }
}

/// Query filter, every field optional
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    /// Acting user
    pub user_id: Option<Uuid>,
    /// Wallet
    pub wallet_id: Option<Uuid>,
    /// Account
    pub account_id: Option<Uuid>,
    /// Task execution
    pub task_execution_id: Option<Uuid>,
    /// Job
    pub job_id: Option<Uuid>,
    /// Action
    pub action: Option<AuditAction>,
    /// Platform
    pub platform: Option<Platform>,
    /// Result
    pub result: Option<AuditResult>,
    /// Created at or after
    pub since: Option<DateTime<Utc>>,
    /// Created before
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    /// Filter by user
    #[must_use]
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    /// Restrict to one action
    #[must_use]
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Restrict to one result
    #[must_use]
    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Restrict to one platform
    #[must_use]
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Restrict to a time range
    #[must_use]
    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }
}

/// Per-user action counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserActivity {
    /// Entries counted
    pub total: u64,
    /// Counts per action
    pub by_action: BTreeMap<String, u64>,
    /// Counts per result
    pub by_result: BTreeMap<String, u64>,
}

/// Audit logger configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Entries per batched insert
    pub batch_size: usize,
    /// Maximum time an entry waits in the buffer
    pub flush_interval: Duration,
    /// Buffer capacity before callers fall back to direct writes
    pub buffer_capacity: usize,
    /// Default retention for cleanup
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            buffer_capacity: 1000,
            retention_days: 90,
        }
    }
}

impl AuditConfig {
    /// Set batch size
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set flush interval
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set buffer capacity
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }
}

/// Internal row type for database queries
#[derive(FromRow)]
pub(super) struct AuditRow {
    pub id: String,
    pub user_id: String,
    pub wallet_id: Option<String>,
    pub account_id: Option<String>,
    pub task_execution_id: Option<String>,
    pub job_id: Option<String>,
    pub action: String,
    pub platform: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub result: String,
    pub error_message: Option<String>,
    pub proof_type: Option<String>,
    pub proof_value: Option<String>,
    pub duration_ms: i64,
    pub idempotency_key: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| AuditError::InvalidRow(format!("invalid id {}: {}", raw, e)))
}

fn parse_opt_id(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.as_deref().map(parse_id).transpose()
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = AuditError;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(AuditEntry {
            id: parse_id(&row.id)?,
            user_id: parse_id(&row.user_id)?,
            wallet_id: parse_opt_id(row.wallet_id)?,
            account_id: parse_opt_id(row.account_id)?,
            task_execution_id: parse_opt_id(row.task_execution_id)?,
            job_id: parse_opt_id(row.job_id)?,
            action: row.action.parse()?,
            platform: row
                .platform
                .as_deref()
                .map(|p| p.parse::<Platform>())
                .transpose()
                .map_err(|e| AuditError::InvalidRow(e.to_string()))?,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            request_data: parse_json(row.request_data)?,
            response_data: parse_json(row.response_data)?,
            result: row.result.parse()?,
            error_message: row.error_message,
            proof_type: row.proof_type,
            proof_value: row.proof_value,
            duration_ms: row.duration_ms,
            idempotency_key: row.idempotency_key,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            created_at: row.created_at,
        })
    }
}
