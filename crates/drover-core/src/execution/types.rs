//! Task execution types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::AuditError;
use crate::keyspace::KeyspaceError;
use crate::locks::LockError;
use crate::platform::{Platform, PlatformError, PostContent};
use crate::rate_limit::RateLimitError;

/// Result type for execution operations
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Execution error types
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// No such task template
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// No such execution
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// The prerequisite task is not done for this actor
    #[error("task {task_id} depends on {depends_on}, which is not done")]
    DependencyNotMet {
        /// Task being executed
        task_id: Uuid,
        /// Prerequisite task
        depends_on: Uuid,
    },

    /// Quota exhausted for the account
    #[error("rate limited on {platform}, retry in {retry_after:?}")]
    RateLimited {
        /// Platform
        platform: Platform,
        /// Time until quota frees up
        retry_after: Duration,
    },

    /// Lease contention or lease failure
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Operation not valid in the execution's current state
    #[error("execution {id} is {status}, expected {expected}")]
    InvalidState {
        /// Execution
        id: Uuid,
        /// Current status
        status: ExecutionStatus,
        /// What the operation needed
        expected: &'static str,
    },

    /// Another attempt is running right now
    #[error("execution {0} is already running")]
    InProgress(Uuid),

    /// The task type needs an actor the request did not supply
    #[error("task type {task_type} requires a {actor} id")]
    MissingActor {
        /// Task type
        task_type: TaskType,
        /// `wallet` or `account`
        actor: &'static str,
    },

    /// No collaborator configured for this kind of work
    #[error("no {0} configured")]
    MissingCollaborator(&'static str),

    /// Platform or collaborator failure
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Retry loop stopped by shutdown
    #[error("execution cancelled")]
    Cancelled,

    /// A stored row could not be decoded
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Keyspace error
    #[error(transparent)]
    Store(#[from] KeyspaceError),

    /// Audit trail error
    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl From<RateLimitError> for ExecutionError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::RateLimited {
                platform,
                retry_after,
                ..
            } => Self::RateLimited {
                platform,
                retry_after,
            },
            RateLimitError::Store(e) => Self::Store(e),
        }
    }
}

impl ExecutionError {
    /// Stable code stored in `TaskExecution.error_code`
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::DependencyNotMet { .. } => "DEPENDENCY_NOT_MET",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Lock(LockError::NotAcquired(_)) => "LOCK_NOT_ACQUIRED",
            Self::Lock(LockError::NotOwned(_)) => "LOCK_NOT_OWNED",
            Self::Lock(LockError::Expired(_)) => "LOCK_EXPIRED",
            Self::Lock(LockError::Store(_)) | Self::Store(_) => "KEYSPACE_ERROR",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InProgress(_) => "IN_PROGRESS",
            Self::MissingActor { .. } => "MISSING_ACTOR",
            Self::MissingCollaborator(_) => "NOT_CONFIGURED",
            Self::Platform(e) => e.code(),
            Self::Cancelled => "CANCELLED",
            Self::InvalidRow(_) | Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Audit(_) => "AUDIT_ERROR",
        }
    }

    /// Lock or quota contention, handled by rescheduling
    #[must_use]
    pub fn is_contention(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::InProgress(_) => true,
            Self::Lock(e) => e.is_contention(),
            _ => false,
        }
    }

    /// Whether another attempt may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Platform(e) => e.is_retryable(),
            Self::Store(e) | Self::Lock(LockError::Store(e)) => e.is_transient(),
            Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            other => other.is_contention(),
        }
    }
}

/// What a campaign task asks the actor to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum TaskType {
    WalletConnect,
    Transaction,
    Claim,
    Follow,
    Join,
    Post,
    Reply,
    Like,
    Recast,
    Verify,
    Quiz,
    Custom,
}

impl TaskType {
    /// Every task type
    pub const ALL: [TaskType; 12] = [
        Self::WalletConnect,
        Self::Transaction,
        Self::Claim,
        Self::Follow,
        Self::Join,
        Self::Post,
        Self::Reply,
        Self::Like,
        Self::Recast,
        Self::Verify,
        Self::Quiz,
        Self::Custom,
    ];

    /// Stored identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WalletConnect => "wallet_connect",
            Self::Transaction => "transaction",
            Self::Claim => "claim",
            Self::Follow => "follow",
            Self::Join => "join",
            Self::Post => "post",
            Self::Reply => "reply",
            Self::Like => "like",
            Self::Recast => "recast",
            Self::Verify => "verify",
            Self::Quiz => "quiz",
            Self::Custom => "custom",
        }
    }

    /// Dispatched to a platform adapter under an account lease
    #[must_use]
    pub fn is_social(&self) -> bool {
        matches!(
            self,
            Self::Follow | Self::Like | Self::Recast | Self::Reply | Self::Post | Self::Verify
        )
    }

    /// Prepared for signing under a wallet lease
    #[must_use]
    pub fn is_onchain(&self) -> bool {
        matches!(self, Self::Transaction | Self::Claim)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ExecutionError::InvalidRow(format!("unknown task type: {}", s)))
    }
}

/// Campaign task template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id
    pub id: Uuid,
    /// Owning campaign
    pub campaign_id: Uuid,
    /// Display name
    pub name: String,
    /// Description
    pub description: Option<String>,
    /// What to do
    pub task_type: TaskType,
    /// Where to do it
    pub platform: Platform,
    /// Target post or page
    pub target_url: Option<String>,
    /// Target user
    pub target_account: Option<String>,
    /// Text to post, or instructions for a human
    pub action_text: Option<String>,
    /// Always hand over to a human
    pub requires_manual: bool,
    /// Prerequisite task
    pub depends_on: Option<Uuid>,
    /// Attempts before an execution is terminally failed
    pub max_retries: u32,
    /// Type-specific settings (transaction intent, browser profile and steps)
    pub config: serde_json::Value,
    /// Position within the campaign
    pub order_index: i32,
}

impl Task {
    /// New task with defaults
    pub fn new(
        campaign_id: Uuid,
        name: impl Into<String>,
        task_type: TaskType,
        platform: Platform,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            name: name.into(),
            description: None,
            task_type,
            platform,
            target_url: None,
            target_account: None,
            action_text: None,
            requires_manual: false,
            depends_on: None,
            max_retries: 3,
            config: serde_json::Value::Object(Default::default()),
            order_index: 0,
        }
    }

    /// Set target URL or post id
    #[must_use]
    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    /// Set target user
    #[must_use]
    pub fn with_target_account(mut self, account: impl Into<String>) -> Self {
        self.target_account = Some(account.into());
        self
    }

    /// Set action text
    #[must_use]
    pub fn with_action_text(mut self, text: impl Into<String>) -> Self {
        self.action_text = Some(text.into());
        self
    }

    /// Require a human
    #[must_use]
    pub fn manual(mut self) -> Self {
        self.requires_manual = true;
        self
    }

    /// Depend on another task
    #[must_use]
    pub fn depends_on(mut self, task_id: Uuid) -> Self {
        self.depends_on = Some(task_id);
        self
    }

    /// Set retry budget
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set type-specific config
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Target for social actions: the account for follows, the post otherwise
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self.task_type {
            TaskType::Follow => self.target_account.as_deref().or(self.target_url.as_deref()),
            _ => self.target_url.as_deref().or(self.target_account.as_deref()),
        }
    }
}

/// Lifecycle of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created or waiting for another attempt
    Pending,
    /// An attempt is dispatched
    Running,
    /// Waiting for a human to finish the action
    ManualRequired,
    /// Satisfied
    Done,
    /// Out of attempts
    Failed,
    /// Cancelled
    Skipped,
}

impl ExecutionStatus {
    /// Stored identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::ManualRequired => "MANUAL_REQUIRED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// No further transitions without an explicit retry
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "MANUAL_REQUIRED" => Ok(Self::ManualRequired),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(ExecutionError::InvalidRow(format!("unknown status: {}", other))),
        }
    }
}

/// Kind of evidence that an action happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ProofType {
    PostUrl,
    TxHash,
    CastHash,
    Screenshot,
    ApiResponse,
    Signature,
    ManualVerify,
}

impl ProofType {
    /// Stored identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostUrl => "post_url",
            Self::TxHash => "tx_hash",
            Self::CastHash => "cast_hash",
            Self::Screenshot => "screenshot",
            Self::ApiResponse => "api_response",
            Self::Signature => "signature",
            Self::ManualVerify => "manual_verify",
        }
    }
}

impl FromStr for ProofType {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::PostUrl,
            Self::TxHash,
            Self::CastHash,
            Self::Screenshot,
            Self::ApiResponse,
            Self::Signature,
            Self::ManualVerify,
        ]
        .into_iter()
        .find(|p| p.as_str() == s)
        .ok_or_else(|| ExecutionError::InvalidRow(format!("unknown proof type: {}", s)))
    }
}

/// Evidence that an action happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    /// Kind
    pub proof_type: ProofType,
    /// Hash, URL or path
    pub value: String,
    /// Raw metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Proof {
    /// New proof without metadata
    pub fn new(proof_type: ProofType, value: impl Into<String>) -> Self {
        Self {
            proof_type,
            value: value.into(),
            data: None,
        }
    }

    /// Attach metadata
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// One attempt to satisfy a task for an actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Execution id
    pub id: Uuid,
    /// Task template
    pub task_id: Uuid,
    /// Owner
    pub user_id: Uuid,
    /// Wallet acting
    pub wallet_id: Option<Uuid>,
    /// Account acting
    pub account_id: Option<Uuid>,
    /// State
    pub status: ExecutionStatus,
    /// Unique per task, actor and UTC day
    pub idempotency_key: String,
    /// Proof kind
    pub proof_type: Option<ProofType>,
    /// Proof value
    pub proof_value: Option<String>,
    /// Proof metadata
    pub proof_data: Option<serde_json::Value>,
    /// What the human must do while manual
    pub action_text: Option<String>,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Attempts allowed
    pub max_retries: u32,
    /// Stable error code of the last failure
    pub error_code: Option<String>,
    /// Description of the last failure
    pub error_message: Option<String>,
    /// Browser session used by the last attempt
    pub browser_session_id: Option<String>,
    /// Audit entry of the last attempt
    pub audit_log_id: Option<Uuid>,
    /// Last attempt start
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    /// Fresh pending execution
    pub fn pending(task: &Task, request: &ExecuteRequest, idempotency_key: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            user_id: request.user_id,
            wallet_id: request.wallet_id,
            account_id: request.account_id,
            status: ExecutionStatus::Pending,
            idempotency_key,
            proof_type: None,
            proof_value: None,
            proof_data: None,
            action_text: None,
            retry_count: 0,
            max_retries: task.max_retries,
            error_code: None,
            error_message: None,
            browser_session_id: None,
            audit_log_id: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Store a proof
    pub fn apply_proof(&mut self, proof: &Proof) {
        self.proof_type = Some(proof.proof_type);
        self.proof_value = Some(proof.value.clone());
        self.proof_data = proof.data.clone();
    }

    /// The proof, if one is recorded
    #[must_use]
    pub fn proof(&self) -> Option<Proof> {
        Some(Proof {
            proof_type: self.proof_type?,
            value: self.proof_value.clone()?,
            data: self.proof_data.clone(),
        })
    }

    /// Request that reproduces this execution's actor
    #[must_use]
    pub fn request(&self) -> ExecuteRequest {
        ExecuteRequest {
            task_id: self.task_id,
            user_id: self.user_id,
            wallet_id: self.wallet_id,
            account_id: self.account_id,
            force: false,
        }
    }
}

/// `sha256("<task>[:<account>][:<wallet>]:<YYYY-MM-DD>")` as lowercase hex
///
/// The day is the UTC calendar day of the attempt.
#[must_use]
pub fn idempotency_key(
    task_id: Uuid,
    account_id: Option<Uuid>,
    wallet_id: Option<Uuid>,
    day: NaiveDate,
) -> String {
    let mut parts = task_id.to_string();
    if let Some(account) = account_id {
        parts.push(':');
        parts.push_str(&account.to_string());
    }
    if let Some(wallet) = wallet_id {
        parts.push(':');
        parts.push_str(&wallet.to_string());
    }
    parts.push(':');
    parts.push_str(&day.format("%Y-%m-%d").to_string());

    Sha256::digest(parts.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Parameters for [`TaskExecutionEngine::execute`](super::TaskExecutionEngine::execute)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Task template
    pub task_id: Uuid,
    /// Owner
    pub user_id: Uuid,
    /// Wallet acting
    #[serde(default)]
    pub wallet_id: Option<Uuid>,
    /// Account acting
    #[serde(default)]
    pub account_id: Option<Uuid>,
    /// Skip the dependency check
    #[serde(default)]
    pub force: bool,
}

impl ExecuteRequest {
    /// Request for a task and user
    pub fn new(task_id: Uuid, user_id: Uuid) -> Self {
        Self {
            task_id,
            user_id,
            wallet_id: None,
            account_id: None,
            force: false,
        }
    }

    /// Act as this wallet
    #[must_use]
    pub fn with_wallet(mut self, wallet_id: Uuid) -> Self {
        self.wallet_id = Some(wallet_id);
        self
    }

    /// Act as this account
    #[must_use]
    pub fn with_account(mut self, account_id: Uuid) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Skip the dependency check
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Result a human supplies to finish a manual execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinueInput {
    /// Proof kind
    pub proof_type: ProofType,
    /// Proof value, e.g. the transaction hash
    pub proof_value: String,
    /// Extra metadata
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// What an execute call did
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The action happened
    Done(TaskExecution),
    /// An earlier execution with the same key is done; nothing ran
    AlreadyDone(TaskExecution),
    /// Waiting for a human
    ManualRequired(TaskExecution),
    /// The attempt failed and another is allowed after `backoff`
    Retry {
        /// Execution, left `PENDING`
        execution: TaskExecution,
        /// Suggested wait before the next attempt
        backoff: Duration,
    },
    /// Out of attempts, or the failure cannot succeed later
    Failed(TaskExecution),
    /// The execution was cancelled
    Skipped(TaskExecution),
}

impl ExecutionOutcome {
    /// The execution record
    #[must_use]
    pub fn execution(&self) -> &TaskExecution {
        match self {
            Self::Done(e)
            | Self::AlreadyDone(e)
            | Self::ManualRequired(e)
            | Self::Failed(e)
            | Self::Skipped(e) => e,
            Self::Retry { execution, .. } => execution,
        }
    }

    /// Take the execution record
    #[must_use]
    pub fn into_execution(self) -> TaskExecution {
        match self {
            Self::Done(e)
            | Self::AlreadyDone(e)
            | Self::ManualRequired(e)
            | Self::Failed(e)
            | Self::Skipped(e) => e,
            Self::Retry { execution, .. } => execution,
        }
    }

    /// Done now or earlier
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_) | Self::AlreadyDone(_))
    }
}

/// Execution listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    /// Task template
    pub task_id: Option<Uuid>,
    /// Owner
    pub user_id: Option<Uuid>,
    /// State
    pub status: Option<ExecutionStatus>,
}

/// A platform action performed outside any task, e.g. by engagement jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SocialAction {
    /// Follow a user
    Follow {
        /// Target user
        target: String,
    },
    /// Like a post
    Like {
        /// Target post
        post_id: String,
    },
    /// Repost a post
    Recast {
        /// Target post
        post_id: String,
    },
    /// Reply to a post
    Reply {
        /// Target post
        post_id: String,
        /// Reply text
        text: String,
    },
    /// Publish a post
    Post {
        /// Content
        content: PostContent,
    },
}

impl SocialAction {
    /// Short name used in keys and logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Follow { .. } => "follow",
            Self::Like { .. } => "like",
            Self::Recast { .. } => "recast",
            Self::Reply { .. } => "reply",
            Self::Post { .. } => "post",
        }
    }

    /// What the action targets, for audit and dedupe
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Follow { target } => target,
            Self::Like { post_id } | Self::Recast { post_id } | Self::Reply { post_id, .. } => {
                post_id
            }
            Self::Post { content } => &content.text,
        }
    }
}

/// Parameters for [`TaskExecutionEngine::run_action`](super::TaskExecutionEngine::run_action)
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Owner
    pub user_id: Uuid,
    /// Account acting
    pub account_id: Uuid,
    /// Platform
    pub platform: Platform,
    /// What to do
    pub action: SocialAction,
    /// Job the action belongs to
    pub job_id: Option<Uuid>,
    /// Performed at most once per key
    pub idempotency_key: String,
}

/// What a run_action call did
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// The action happened now
    Performed(Proof),
    /// An earlier call with the same key already succeeded
    AlreadyPerformed,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease ttl on wallets and accounts
    pub lock_ttl: Duration,
    /// Longest wait for a contended lease
    pub lock_max_wait: Duration,
    /// Retry backoff base for `execute_with_retry`
    pub retry_base: Duration,
    /// Retry backoff cap
    pub retry_cap: Duration,
    /// Concurrent executions allowed per user
    pub max_concurrent_per_user: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5 * 60),
            lock_max_wait: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(5 * 60),
            max_concurrent_per_user: 10,
        }
    }
}

impl EngineConfig {
    /// Set lease ttl and maximum wait
    #[must_use]
    pub fn with_locks(mut self, ttl: Duration, max_wait: Duration) -> Self {
        self.lock_ttl = ttl;
        self.lock_max_wait = max_wait;
        self
    }

    /// Set retry backoff base and cap
    #[must_use]
    pub fn with_retry_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.retry_base = base;
        self.retry_cap = cap;
        self
    }

    /// Set per-user concurrency
    #[must_use]
    pub fn with_max_concurrent_per_user(mut self, limit: usize) -> Self {
        self.max_concurrent_per_user = limit.max(1);
        self
    }
}

/// Internal row type for database queries
#[derive(FromRow)]
pub(super) struct TaskRow {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    pub description: Option<String>,
    pub task_type: String,
    pub platform: String,
    pub target_url: Option<String>,
    pub target_account: Option<String>,
    pub action_text: Option<String>,
    pub requires_manual: bool,
    pub depends_on: Option<String>,
    pub max_retries: i64,
    pub config: String,
    pub order_index: i64,
}

pub(super) fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ExecutionError::InvalidRow(format!("invalid id {}: {}", raw, e)))
}

fn parse_opt_id(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.as_deref().map(parse_id).transpose()
}

impl TryFrom<TaskRow> for Task {
    type Error = ExecutionError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Task {
            id: parse_id(&row.id)?,
            campaign_id: parse_id(&row.campaign_id)?,
            name: row.name,
            description: row.description,
            task_type: row.task_type.parse()?,
            platform: row
                .platform
                .parse()
                .map_err(|e: PlatformError| ExecutionError::InvalidRow(e.to_string()))?,
            target_url: row.target_url,
            target_account: row.target_account,
            action_text: row.action_text,
            requires_manual: row.requires_manual,
            depends_on: parse_opt_id(row.depends_on)?,
            max_retries: row.max_retries.max(0) as u32,
            config: serde_json::from_str(&row.config)?,
            order_index: row.order_index as i32,
        })
    }
}

/// Internal row type for database queries
#[derive(FromRow)]
pub(super) struct ExecutionRow {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub wallet_id: Option<String>,
    pub account_id: Option<String>,
    pub status: String,
    pub idempotency_key: String,
    pub proof_type: Option<String>,
    pub proof_value: Option<String>,
    pub proof_data: Option<String>,
    pub action_text: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub browser_session_id: Option<String>,
    pub audit_log_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for TaskExecution {
    type Error = ExecutionError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(TaskExecution {
            id: parse_id(&row.id)?,
            task_id: parse_id(&row.task_id)?,
            user_id: parse_id(&row.user_id)?,
            wallet_id: parse_opt_id(row.wallet_id)?,
            account_id: parse_opt_id(row.account_id)?,
            status: row.status.parse()?,
            idempotency_key: row.idempotency_key,
            proof_type: row.proof_type.as_deref().map(str::parse).transpose()?,
            proof_value: row.proof_value,
            proof_data: row
                .proof_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            action_text: row.action_text,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            error_code: row.error_code,
            error_message: row.error_message,
            browser_session_id: row.browser_session_id,
            audit_log_id: parse_opt_id(row.audit_log_id)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
