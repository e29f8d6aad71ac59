//! Scheduler job types and error definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::execution::ExecutionError;
use crate::keyspace::KeyspaceError;
use crate::locks::LockError;
use crate::platform::PlatformError;
use crate::queue::QueueError;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler error types
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Job not found or soft-deleted
    #[error("job not found: {0}")]
    JobNotFound(Uuid),
    /// Cron expression rejected
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron {
        /// The expression
        expr: String,
        /// Parser message
        reason: String,
    },
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Queued payload names a kind without a handler
    #[error("no handler for job kind {0}")]
    NoHandler(String),
    /// Handler-level failure
    #[error("job failed: {0}")]
    Handler(String),
    /// Handler exceeded the job timeout
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    /// Stopped by shutdown
    #[error("job cancelled by shutdown")]
    Cancelled,
    /// The worker no longer holds the queue item or the job lock
    #[error("lease on queue item {0} was lost")]
    LeaseLost(Uuid),
    /// A stored row could not be decoded
    #[error("invalid row: {0}")]
    InvalidRow(String),
    /// Queue error
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Task execution error
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// Lock error
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Keyspace error
    #[error(transparent)]
    Store(#[from] KeyspaceError),
    /// Collaborator error
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl SchedulerError {
    /// Lock contention: the run should be rescheduled, not failed
    #[must_use]
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Lock(e) => e.is_contention(),
            Self::Execution(e) => e.is_contention(),
            _ => false,
        }
    }
}

/// What a job does when it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Publish the posts listed in the job config
    ScheduledPost,
    /// Run each task of a campaign for each actor, in order
    CampaignTask,
    /// Refresh wallet balances
    BalanceSync,
    /// Refresh account profiles
    PlatformSync,
    /// Like, follow, recast or reply to configured targets
    Engagement,
    /// Generate content through the content collaborator
    ContentGenerate,
    /// Campaign fan-out with bounded parallelism
    BulkExecute,
}

impl JobKind {
    /// Every kind
    pub const ALL: [JobKind; 7] = [
        Self::ScheduledPost,
        Self::CampaignTask,
        Self::BalanceSync,
        Self::PlatformSync,
        Self::Engagement,
        Self::ContentGenerate,
        Self::BulkExecute,
    ];

    /// Stored identifier, also the queue payload type
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduledPost => "scheduled_post",
            Self::CampaignTask => "campaign_task",
            Self::BalanceSync => "balance_sync",
            Self::PlatformSync => "platform_sync",
            Self::Engagement => "engagement",
            Self::ContentGenerate => "content_generate",
            Self::BulkExecute => "bulk_execute",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SchedulerError::NoHandler(s.to_string()))
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its next trigger
    #[default]
    Idle,
    /// A worker is running it
    Running,
    /// Never triggered automatically
    Paused,
    /// Last run failed terminally
    Failed,
}

impl JobStatus {
    /// Stored identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            other => Err(SchedulerError::InvalidRow(format!("unknown job status: {}", other))),
        }
    }
}

/// Recurring or one-shot unit of scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: Uuid,
    /// Owner
    pub user_id: Uuid,
    /// Human-readable name
    pub name: String,
    /// Handler selector
    pub kind: JobKind,
    /// Cron expression; `None` for one-shot jobs
    pub cron_expr: Option<String>,
    /// Next due time
    pub next_run_at: Option<DateTime<Utc>>,
    /// Last run start
    pub last_run_at: Option<DateTime<Utc>>,
    /// Whether the job is considered at all
    pub is_active: bool,
    /// Lifecycle status
    pub status: JobStatus,
    /// Kind-specific settings
    pub config: Value,
    /// Wallets the job acts as
    pub wallet_ids: Vec<Uuid>,
    /// Accounts the job acts as
    pub account_ids: Vec<Uuid>,
    /// Campaign for campaign and bulk jobs
    pub campaign_id: Option<Uuid>,
    /// Runs so far
    pub total_runs: i64,
    /// Successful runs
    pub success_runs: i64,
    /// Failed runs
    pub failed_runs: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Soft-delete timestamp
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New active job
    pub fn new(user_id: Uuid, name: impl Into<String>, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            kind,
            cron_expr: None,
            next_run_at: None,
            last_run_at: None,
            is_active: true,
            status: JobStatus::Idle,
            config: Value::Object(Default::default()),
            wallet_ids: Vec::new(),
            account_ids: Vec::new(),
            campaign_id: None,
            total_runs: 0,
            success_runs: 0,
            failed_runs: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Run on a cron schedule
    #[must_use]
    pub fn with_cron(mut self, expr: impl Into<String>) -> Self {
        self.cron_expr = Some(expr.into());
        self
    }

    /// Run once at `at`
    #[must_use]
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// Set kind-specific config
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Act as these wallets
    #[must_use]
    pub fn with_wallets(mut self, wallet_ids: Vec<Uuid>) -> Self {
        self.wallet_ids = wallet_ids;
        self
    }

    /// Act as these accounts
    #[must_use]
    pub fn with_accounts(mut self, account_ids: Vec<Uuid>) -> Self {
        self.account_ids = account_ids;
        self
    }

    /// Attach a campaign
    #[must_use]
    pub fn with_campaign(mut self, campaign_id: Uuid) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    /// Dedupe key used for every enqueue of this job
    #[must_use]
    pub fn dedupe_key(&self) -> String {
        format!("job:{}", self.id)
    }

    /// Whether timers and the checker may enqueue it
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.is_active
            && self.deleted_at.is_none()
            && !matches!(self.status, JobStatus::Paused | JobStatus::Running)
    }
}

/// Outcome of one worker execution of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRunStatus {
    /// In progress
    Running,
    /// Handler succeeded
    Success,
    /// Handler failed
    Failed,
    /// Handler exceeded the job timeout
    Timeout,
}

impl JobRunStatus {
    /// Stored identifier
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl FromStr for JobRunStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(SchedulerError::InvalidRow(format!("unknown run status: {}", other))),
        }
    }
}

/// Run history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Run ID
    pub id: Uuid,
    /// Job
    pub job_id: Uuid,
    /// Queue item that carried the run
    pub queued_job_id: Option<Uuid>,
    /// Start
    pub started_at: DateTime<Utc>,
    /// End
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome
    pub status: JobRunStatus,
    /// Handler summary or error
    pub message: Option<String>,
}

/// Cross-process request to run a job now, published on `jobs:queue`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Job to run
    pub job_id: Uuid,
    /// Requesting user
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

/// Queue payload for a job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Job to run
    pub job_id: Uuid,
    /// Owner
    pub user_id: Uuid,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker tasks
    pub workers: usize,
    /// Idle sleep between dequeue attempts
    pub poll_interval: Duration,
    /// Queue-item lease held by a worker
    pub lease: Duration,
    /// Period of the due-job checker
    pub check_interval: Duration,
    /// Longest a handler may run
    pub job_timeout: Duration,
    /// Delay before retrying a run that hit lock contention
    pub contention_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval: Duration::from_millis(100),
            lease: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(60),
            job_timeout: Duration::from_secs(30 * 60),
            contention_delay: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set worker count
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set worker poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set queue-item lease
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set checker period
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Set handler timeout
    #[must_use]
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Set contention reschedule delay
    #[must_use]
    pub fn with_contention_delay(mut self, delay: Duration) -> Self {
        self.contention_delay = delay;
        self
    }
}

/// Internal row type for database queries
#[derive(FromRow)]
pub(super) struct JobRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub kind: String,
    pub cron_expr: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub status: String,
    pub config: String,
    pub wallet_ids: String,
    pub account_ids: String,
    pub campaign_id: Option<String>,
    pub total_runs: i64,
    pub success_runs: i64,
    pub failed_runs: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| SchedulerError::InvalidRow(format!("invalid id {}: {}", raw, e)))
}

impl TryFrom<JobRow> for Job {
    type Error = SchedulerError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: parse_id(&row.id)?,
            user_id: parse_id(&row.user_id)?,
            name: row.name,
            kind: row.kind.parse()?,
            cron_expr: row.cron_expr,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            is_active: row.is_active,
            status: row.status.parse()?,
            config: serde_json::from_str(&row.config)?,
            wallet_ids: serde_json::from_str(&row.wallet_ids)?,
            account_ids: serde_json::from_str(&row.account_ids)?,
            campaign_id: row.campaign_id.as_deref().map(parse_id).transpose()?,
            total_runs: row.total_runs,
            success_runs: row.success_runs,
            failed_runs: row.failed_runs,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// Internal row type for database queries
#[derive(FromRow)]
pub(super) struct JobRunRow {
    pub id: String,
    pub job_id: String,
    pub queued_job_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub message: Option<String>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = SchedulerError;

    fn try_from(row: JobRunRow) -> Result<Self> {
        Ok(JobRun {
            id: parse_id(&row.id)?,
            job_id: parse_id(&row.job_id)?,
            queued_job_id: row.queued_job_id.as_deref().map(parse_id).transpose()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status: row.status.parse()?,
            message: row.message,
        })
    }
}
