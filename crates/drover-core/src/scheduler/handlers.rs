//! Job handlers, one per [`JobKind`]
//!
//! Handlers read their settings from `Job::config` and act as the job's
//! wallets and accounts. Per-item failures are counted in the returned
//! summary; only infrastructure errors and lock contention fail the run.
//! Contention is surfaced so the worker reschedules the whole run, which
//! is safe because every item is idempotent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{Job, JobKind, Result, SchedulerError};
use crate::execution::{
    ActionOutcome, ActionRequest, ExecuteRequest, ExecutionError, ExecutionOutcome, SocialAction,
    Task, TaskExecutionEngine,
};
use crate::locks::{LockManager, ResourceType};
use crate::platform::{
    AdapterRegistry, ContentGenerator, ContentRequest, Platform, PostContent, WalletService,
};

/// Default fan-out for `bulk_execute`
pub const DEFAULT_MAX_PARALLEL: usize = 3;

/// Default action budget for `engagement`
pub const DEFAULT_MAX_ACTIONS: usize = 10;

/// What a handler sees of the run
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job definition as loaded at run start
    pub job: Job,
    /// Queue item carrying the run
    pub queued_job_id: Uuid,
    /// Fires on shutdown or timeout
    pub cancel: CancellationToken,
}

impl JobContext {
    fn config<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.job.config.clone()).map_err(|e| {
            SchedulerError::InvalidConfig(format!("{} job {}: {}", self.job.kind, self.job.id, e))
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        Ok(())
    }

    /// Key prefix scoping idempotent actions to this run
    fn run_key(&self) -> String {
        format!("job:{}:{}", self.job.id, self.queued_job_id)
    }
}

/// Runs one kind of job
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job, returning a summary stored on the queue item
    async fn handle(&self, ctx: &JobContext) -> Result<Value>;
}

/// Maps job kinds to handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

/// Collaborators the built-in handlers need
#[derive(Clone)]
pub struct HandlerDeps {
    /// Task execution engine
    pub engine: TaskExecutionEngine,
    /// Lease manager for wallet and account locks
    pub locks: LockManager,
    /// Platform adapters
    pub adapters: AdapterRegistry,
    /// Balance refresher; `balance_sync` is unavailable without it
    pub wallets: Option<Arc<dyn WalletService>>,
    /// Text generator; `content_generate` is unavailable without it
    pub content: Option<Arc<dyn ContentGenerator>>,
    /// Lease ttl on wallets and accounts
    pub lock_ttl: Duration,
    /// Default fan-out for `bulk_execute`
    pub bulk_max_parallel: usize,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler the collaborators allow
    pub fn standard(deps: HandlerDeps) -> Self {
        let mut registry = Self::new()
            .with_handler(
                JobKind::CampaignTask,
                Arc::new(CampaignHandler::sequential(deps.engine.clone())),
            )
            .with_handler(
                JobKind::BulkExecute,
                Arc::new(CampaignHandler::parallel(
                    deps.engine.clone(),
                    deps.bulk_max_parallel,
                )),
            )
            .with_handler(
                JobKind::ScheduledPost,
                Arc::new(ScheduledPostHandler {
                    engine: deps.engine.clone(),
                }),
            )
            .with_handler(
                JobKind::Engagement,
                Arc::new(EngagementHandler {
                    engine: deps.engine.clone(),
                }),
            )
            .with_handler(
                JobKind::PlatformSync,
                Arc::new(PlatformSyncHandler {
                    adapters: deps.adapters.clone(),
                    locks: deps.locks.clone(),
                    lock_ttl: deps.lock_ttl,
                }),
            );

        if let Some(wallets) = deps.wallets {
            registry.register(
                JobKind::BalanceSync,
                Arc::new(BalanceSyncHandler {
                    wallets,
                    locks: deps.locks.clone(),
                    lock_ttl: deps.lock_ttl,
                }),
            );
        }
        if let Some(content) = deps.content {
            registry.register(JobKind::ContentGenerate, Arc::new(ContentHandler { content }));
        }
        registry
    }

    /// Add or replace a handler
    #[must_use]
    pub fn with_handler(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Add or replace a handler
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Handler for a kind
    pub fn get(&self, kind: JobKind) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| SchedulerError::NoHandler(kind.to_string()))
    }

    /// Kinds with a handler
    #[must_use]
    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

/// Per-item tally returned by fan-out handlers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Items completed now or earlier
    pub done: u32,
    /// Items waiting for a human
    pub manual: u32,
    /// Items that failed
    pub failed: u32,
    /// Items skipped, cancelled or blocked by a dependency
    pub skipped: u32,
    /// Items that hit contention and will be retried
    pub deferred: u32,
}

impl RunSummary {
    fn record(&mut self, result: std::result::Result<ExecutionOutcome, ExecutionError>) -> Option<ExecutionError> {
        match result {
            Ok(ExecutionOutcome::Done(_)) | Ok(ExecutionOutcome::AlreadyDone(_)) => self.done += 1,
            Ok(ExecutionOutcome::ManualRequired(_)) => self.manual += 1,
            Ok(ExecutionOutcome::Failed(_)) => self.failed += 1,
            Ok(ExecutionOutcome::Skipped(_)) => self.skipped += 1,
            Ok(ExecutionOutcome::Retry { .. }) => self.deferred += 1,
            Err(e) if e.is_contention() => {
                self.deferred += 1;
                return Some(e);
            }
            Err(ExecutionError::DependencyNotMet { .. }) | Err(ExecutionError::MissingActor { .. }) => {
                self.skipped += 1
            }
            Err(e) if e.is_retryable() || matches!(e, ExecutionError::Platform(_)) => {
                self.failed += 1
            }
            Err(e) => return Some(e),
        }
        None
    }
}

#[derive(Debug, Default, Deserialize)]
struct CampaignConfig {
    /// Subset of the campaign's tasks; all of them when absent
    #[serde(default)]
    task_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    max_parallel: Option<usize>,
}

/// `campaign_task` and `bulk_execute`: each task for each actor
struct CampaignHandler {
    engine: TaskExecutionEngine,
    max_parallel: Option<usize>,
}

impl CampaignHandler {
    fn sequential(engine: TaskExecutionEngine) -> Self {
        Self {
            engine,
            max_parallel: None,
        }
    }

    fn parallel(engine: TaskExecutionEngine, max_parallel: usize) -> Self {
        Self {
            engine,
            max_parallel: Some(max_parallel.max(1)),
        }
    }

    async fn tasks(&self, ctx: &JobContext, config: &CampaignConfig) -> Result<Vec<Task>> {
        let store = self.engine.store();
        let mut tasks = match ctx.job.campaign_id {
            Some(campaign) => store.list_tasks(campaign).await?,
            None => Vec::new(),
        };
        if let Some(ids) = &config.task_ids {
            if ctx.job.campaign_id.is_some() {
                tasks.retain(|t| ids.contains(&t.id));
            } else {
                for id in ids {
                    tasks.push(store.get_task(*id).await?);
                }
            }
        }
        Ok(tasks)
    }
}

/// Requests for one task, one per matching actor of the job
fn requests_for(task: &Task, job: &Job) -> Vec<ExecuteRequest> {
    let base = ExecuteRequest::new(task.id, job.user_id);
    let by_account = || {
        job.account_ids
            .iter()
            .map(|id| base.clone().with_account(*id))
            .collect::<Vec<_>>()
    };
    let by_wallet = || {
        job.wallet_ids
            .iter()
            .map(|id| base.clone().with_wallet(*id))
            .collect::<Vec<_>>()
    };

    if task.task_type.is_social() {
        by_account()
    } else if task.task_type.is_onchain() || !job.wallet_ids.is_empty() {
        by_wallet()
    } else if !job.account_ids.is_empty() {
        by_account()
    } else {
        vec![base]
    }
}

#[async_trait]
impl JobHandler for CampaignHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value> {
        let config: CampaignConfig = ctx.config()?;
        let tasks = self.tasks(ctx, &config).await?;
        let requests: Vec<ExecuteRequest> = tasks
            .iter()
            .flat_map(|task| requests_for(task, &ctx.job))
            .collect();

        debug!(job_id = %ctx.job.id, tasks = tasks.len(), executions = requests.len(), "Fanning out campaign");

        let mut summary = RunSummary::default();
        let mut blocking: Option<ExecutionError> = None;

        match config.max_parallel.or(self.max_parallel) {
            None => {
                for request in requests {
                    ctx.check_cancelled()?;
                    let result = self.engine.execute_with_retry(request, &ctx.cancel).await;
                    if let Some(e) = summary.record(result) {
                        if !e.is_contention() {
                            return Err(e.into());
                        }
                        blocking.get_or_insert(e);
                    }
                }
            }
            Some(limit) => {
                let semaphore = Arc::new(Semaphore::new(limit.max(1)));
                let mut set = JoinSet::new();
                let mut cancelled = false;
                for request in requests {
                    let permit = tokio::select! {
                        permit = semaphore.clone().acquire_owned() => permit.ok(),
                        _ = ctx.cancel.cancelled() => None,
                    };
                    let Some(permit) = permit else {
                        cancelled = true;
                        break;
                    };
                    let engine = self.engine.clone();
                    let cancel = ctx.cancel.clone();
                    set.spawn(async move {
                        let _permit = permit;
                        engine.execute_with_retry(request, &cancel).await
                    });
                }

                // Every started execution settles before the run does
                let mut fatal: Option<SchedulerError> = None;
                while let Some(joined) = set.join_next().await {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            fatal.get_or_insert(SchedulerError::Handler(format!(
                                "execution task panicked: {}",
                                e
                            )));
                            continue;
                        }
                    };
                    if let Some(e) = summary.record(result) {
                        if e.is_contention() {
                            blocking.get_or_insert(e);
                        } else {
                            warn!(job_id = %ctx.job.id, error = %e, "Execution failed the run");
                            fatal.get_or_insert(e.into());
                        }
                    }
                }
                if let Some(e) = fatal {
                    return Err(e);
                }
                if cancelled {
                    return Err(SchedulerError::Cancelled);
                }
            }
        }

        info!(
            job_id = %ctx.job.id,
            done = summary.done,
            manual = summary.manual,
            failed = summary.failed,
            deferred = summary.deferred,
            "Campaign run finished"
        );
        if let Some(e) = blocking {
            return Err(e.into());
        }
        Ok(serde_json::to_value(summary)?)
    }
}

#[derive(Debug, Deserialize)]
struct ScheduledPostConfig {
    posts: Vec<PostEntry>,
}

#[derive(Debug, Deserialize)]
struct PostEntry {
    account_id: Uuid,
    platform: Platform,
    #[serde(flatten)]
    content: PostContent,
}

/// `scheduled_post`: publish each entry of `config.posts` once per run
struct ScheduledPostHandler {
    engine: TaskExecutionEngine,
}

#[async_trait]
impl JobHandler for ScheduledPostHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value> {
        let config: ScheduledPostConfig = ctx.config()?;
        let mut posted = Vec::new();
        let mut failed = 0u32;

        for (index, entry) in config.posts.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let request = ActionRequest {
                user_id: ctx.job.user_id,
                account_id: entry.account_id,
                platform: entry.platform,
                action: SocialAction::Post {
                    content: entry.content,
                },
                job_id: Some(ctx.job.id),
                idempotency_key: format!("{}:post:{}", ctx.run_key(), index),
            };
            match self.engine.run_action(request).await {
                Ok(ActionOutcome::Performed(proof)) => posted.push(proof.value),
                Ok(ActionOutcome::AlreadyPerformed) => {}
                Err(e) if e.is_contention() => return Err(e.into()),
                Err(e) => {
                    warn!(job_id = %ctx.job.id, account_id = %entry.account_id, error = %e, "Scheduled post failed");
                    failed += 1;
                }
            }
        }

        Ok(json!({ "posted": posted, "failed": failed }))
    }
}

#[derive(Debug, Deserialize)]
struct EngagementConfig {
    platform: Platform,
    targets: Vec<SocialAction>,
    #[serde(default)]
    max_actions: Option<usize>,
}

/// `engagement`: each target action for each account, up to `max_actions`
struct EngagementHandler {
    engine: TaskExecutionEngine,
}

#[async_trait]
impl JobHandler for EngagementHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value> {
        let config: EngagementConfig = ctx.config()?;
        let budget = config.max_actions.unwrap_or(DEFAULT_MAX_ACTIONS);
        let mut performed = 0usize;
        let mut failed = 0u32;
        let mut deferred = 0u32;

        'accounts: for account_id in &ctx.job.account_ids {
            for action in &config.targets {
                if performed >= budget {
                    break 'accounts;
                }
                ctx.check_cancelled()?;

                let request = ActionRequest {
                    user_id: ctx.job.user_id,
                    account_id: *account_id,
                    platform: config.platform,
                    action: action.clone(),
                    job_id: Some(ctx.job.id),
                    idempotency_key: format!(
                        "engagement:{}:{}:{}:{}",
                        ctx.job.id,
                        account_id,
                        action.name(),
                        action.target()
                    ),
                };
                match self.engine.run_action(request).await {
                    Ok(ActionOutcome::Performed(_)) => performed += 1,
                    Ok(ActionOutcome::AlreadyPerformed) => {}
                    Err(e) if e.is_contention() => {
                        debug!(account_id = %account_id, error = %e, "Engagement action deferred");
                        deferred += 1;
                    }
                    Err(e) => {
                        warn!(account_id = %account_id, action = action.name(), error = %e, "Engagement action failed");
                        failed += 1;
                    }
                }
            }
        }

        Ok(json!({ "performed": performed, "failed": failed, "deferred": deferred }))
    }
}

/// `balance_sync`: refresh each wallet under its wallet lock
struct BalanceSyncHandler {
    wallets: Arc<dyn WalletService>,
    locks: LockManager,
    lock_ttl: Duration,
}

#[async_trait]
impl JobHandler for BalanceSyncHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value> {
        let mut synced = 0u32;
        let mut failed = 0u32;
        let mut busy = 0u32;

        for wallet_id in &ctx.job.wallet_ids {
            ctx.check_cancelled()?;
            let result = self
                .locks
                .with_lock(ResourceType::Wallet, &wallet_id.to_string(), self.lock_ttl, || async {
                    self.wallets
                        .sync_balance(*wallet_id)
                        .await
                        .map_err(SchedulerError::from)
                })
                .await;
            match result {
                Ok(balances) => {
                    debug!(wallet_id = %wallet_id, chains = balances.len(), "Wallet synced");
                    synced += 1;
                }
                Err(e) if e.is_contention() => busy += 1,
                Err(e) => {
                    warn!(wallet_id = %wallet_id, error = %e, "Balance sync failed");
                    failed += 1;
                }
            }
        }

        Ok(json!({ "synced": synced, "failed": failed, "busy": busy }))
    }
}

#[derive(Debug, Deserialize)]
struct PlatformSyncConfig {
    platform: Platform,
}

/// `platform_sync`: refresh each account profile under its account lock
struct PlatformSyncHandler {
    adapters: AdapterRegistry,
    locks: LockManager,
    lock_ttl: Duration,
}

#[async_trait]
impl JobHandler for PlatformSyncHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value> {
        let config: PlatformSyncConfig = ctx.config()?;
        let adapter = self.adapters.get(config.platform)?;
        let mut profiles = Vec::new();
        let mut failed = 0u32;

        for account_id in &ctx.job.account_ids {
            ctx.check_cancelled()?;
            let result = self
                .locks
                .with_lock(ResourceType::Account, &account_id.to_string(), self.lock_ttl, || async {
                    adapter
                        .get_profile(*account_id, None)
                        .await
                        .map_err(SchedulerError::from)
                })
                .await;
            match result {
                Ok(profile) => profiles.push(profile),
                Err(e) => {
                    warn!(account_id = %account_id, error = %e, "Profile sync failed");
                    failed += 1;
                }
            }
        }

        Ok(json!({ "profiles": profiles, "failed": failed }))
    }
}

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct ContentConfig {
    #[serde(flatten)]
    request: ContentRequest,
    #[serde(default = "one")]
    quantity: u32,
}

/// `content_generate`: ask the generator for `quantity` pieces
struct ContentHandler {
    content: Arc<dyn ContentGenerator>,
}

#[async_trait]
impl JobHandler for ContentHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<Value> {
        let config: ContentConfig = ctx.config()?;
        let mut generated = Vec::with_capacity(config.quantity as usize);
        for _ in 0..config.quantity {
            ctx.check_cancelled()?;
            generated.push(self.content.generate(&config.request).await?.text);
        }
        Ok(json!({ "generated": generated }))
    }
}
