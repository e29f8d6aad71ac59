//! Task execution engine
//!
//! Drives one campaign task for one actor through
//! `PENDING -> RUNNING -> {DONE | MANUAL_REQUIRED | PENDING (retry) | FAILED}`.
//!
//! An attempt, in order:
//!
//! 1. the newest execution of the task's prerequisite by the same actor
//!    must be done (unless forced)
//! 2. the idempotency key (task, actor, UTC day) is resolved to at most one
//!    execution; a done execution is returned without side effects
//! 3. tasks that always need a human stop at `MANUAL_REQUIRED`
//! 4. leases on the actor's wallet, account and browser profile are taken in
//!    global order, then the execution is re-read under them
//! 5. platform actions consume one slot of the account's rate-limit window
//! 6. a pending audit entry is written, the action is dispatched and the
//!    entry is finalized exactly once with the result
//!
//! Lock and quota contention return an error and leave the execution
//! `PENDING` without consuming a retry.

mod store;
mod types;

#[cfg(test)]
mod tests;

pub use store::TaskStore;
pub use types::{
    idempotency_key, ActionOutcome, ActionRequest, ContinueInput, EngineConfig, ExecuteRequest,
    ExecutionError, ExecutionFilter, ExecutionOutcome, ExecutionStatus, Proof, ProofType, Result,
    SocialAction, Task, TaskExecution, TaskType,
};

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditError, AuditLogger, AuditResult, Finalization};
use crate::event_bus::{EngineEvent, EventBus};
use crate::locks::{LockManager, ResourceType};
use crate::platform::{
    AdapterRegistry, BrowserAction, BrowserSessionProvider, Platform, PlatformError, PostContent,
    PostResult, TransactionIntent, VerifyKind, WalletSigner,
};
use crate::rate_limit::RateLimiter;
use crate::utils::exponential_backoff;

/// Default page size for [`TaskExecutionEngine::list_executions`]
pub const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 1000;

/// What a dispatched attempt produced
enum Dispatched {
    Completed(Proof),
    Manual {
        action_text: String,
        data: Option<serde_json::Value>,
    },
}

/// Task execution engine
#[derive(Clone)]
pub struct TaskExecutionEngine {
    store: TaskStore,
    locks: LockManager,
    rate_limiter: RateLimiter,
    audit: AuditLogger,
    adapters: AdapterRegistry,
    signer: Option<Arc<dyn WalletSigner>>,
    browser: Option<Arc<dyn BrowserSessionProvider>>,
    events: EventBus,
    config: EngineConfig,
    user_slots: Arc<Mutex<HashMap<Uuid, Arc<Semaphore>>>>,
}

impl TaskExecutionEngine {
    /// Create an engine over its stores and platform adapters
    pub fn new(
        store: TaskStore,
        locks: LockManager,
        rate_limiter: RateLimiter,
        audit: AuditLogger,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            store,
            locks,
            rate_limiter,
            audit,
            adapters,
            signer: None,
            browser: None,
            events: EventBus::default(),
            config: EngineConfig::default(),
            user_slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Prepare transactions with this signer
    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn WalletSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Run browser tasks through this provider
    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn BrowserSessionProvider>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Publish status changes on this bus
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Override configuration
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Task template store
    #[must_use]
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Run one attempt of a task for an actor
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionOutcome> {
        let _permit = self.user_permit(request.user_id).await?;

        let task = self.store.get_task(request.task_id).await?;
        check_actor(&task, &request)?;

        if let (Some(depends_on), false) = (task.depends_on, request.force) {
            let latest = self
                .store
                .latest_status(depends_on, request.user_id, request.account_id, request.wallet_id)
                .await?;
            if latest != Some(ExecutionStatus::Done) {
                return Err(ExecutionError::DependencyNotMet {
                    task_id: task.id,
                    depends_on,
                });
            }
        }

        let key = idempotency_key(
            task.id,
            request.account_id,
            request.wallet_id,
            Utc::now().date_naive(),
        );
        let execution = match self.store.get_by_idempotency_key(&key).await? {
            Some(existing) => existing,
            None => {
                let fresh = TaskExecution::pending(&task, &request, key.clone());
                if self.store.insert_execution(&fresh).await? {
                    debug!(execution_id = %fresh.id, task_id = %task.id, "Execution created");
                    fresh
                } else {
                    // Lost the insert race; the winner's row is authoritative
                    self.store
                        .get_by_idempotency_key(&key)
                        .await?
                        .ok_or_else(|| ExecutionError::InvalidRow(format!("key {} vanished", key)))?
                }
            }
        };

        if let Some(outcome) = self.settled(&execution)? {
            return Ok(outcome);
        }
        self.run(task, execution).await
    }

    /// Execute, sleeping through retryable failures until the execution settles
    ///
    /// Stops early when `cancel` fires, returning the pending retry outcome.
    pub async fn execute_with_retry(
        &self,
        request: ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let mut outcome = self.execute(request).await?;
        loop {
            let ExecutionOutcome::Retry { execution, backoff } = outcome else {
                return Ok(outcome);
            };
            debug!(
                execution_id = %execution.id,
                retry_count = execution.retry_count,
                backoff_ms = backoff.as_millis() as u64,
                "Waiting before next attempt"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => {
                    return Ok(ExecutionOutcome::Retry { execution, backoff });
                }
            }
            outcome = self.resume(execution.id).await?;
        }
    }

    /// Finish a manual execution with the proof a human supplied
    ///
    /// The audit entry is written first; the execution only moves to `DONE`
    /// together with its proof, so a failed write leaves it continuable.
    pub async fn continue_execution(&self, id: Uuid, input: ContinueInput) -> Result<TaskExecution> {
        let execution = self.store.get_execution(id).await?;
        if execution.status != ExecutionStatus::ManualRequired {
            return Err(ExecutionError::InvalidState {
                id,
                status: execution.status,
                expected: "MANUAL_REQUIRED",
            });
        }

        let proof = Proof {
            proof_type: input.proof_type,
            value: input.proof_value,
            data: input.data,
        };
        let attempt_key = self.next_attempt_key(&execution.idempotency_key).await?;
        let pending = self
            .audit
            .log_sync(
                AuditEntry::new(execution.user_id, AuditAction::TaskComplete, AuditResult::Pending)
                    .with_wallet(execution.wallet_id)
                    .with_account(execution.account_id)
                    .with_task_execution(execution.id)
                    .with_resource("task", execution.task_id.to_string())
                    .with_proof(proof.proof_type.as_str(), &proof.value)
                    .with_idempotency_key(attempt_key),
            )
            .await?;

        let started = Instant::now();
        let completed = match self.store.complete_manual(id, &proof, pending.id).await {
            Ok(completed) => completed,
            Err(e) => {
                self.finalize_audit(pending.id, Finalization::failed(e.to_string(), started.elapsed()))
                    .await;
                return Err(e);
            }
        };
        if !completed {
            self.finalize_audit(
                pending.id,
                Finalization::failed("execution left MANUAL_REQUIRED", started.elapsed()),
            )
            .await;
            let current = self.store.get_execution(id).await?;
            return Err(ExecutionError::InvalidState {
                id,
                status: current.status,
                expected: "MANUAL_REQUIRED",
            });
        }
        self.finalize_audit(
            pending.id,
            Finalization::success(started.elapsed()).with_proof(proof.proof_type.as_str(), &proof.value),
        )
        .await;

        let execution = self.store.get_execution(id).await?;
        info!(execution_id = %id, proof_type = proof.proof_type.as_str(), "Manual execution completed");
        self.notify(&execution, None);
        Ok(execution)
    }

    /// Cancel an execution that has not settled
    pub async fn cancel_execution(&self, id: Uuid) -> Result<TaskExecution> {
        let cancellable = [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::ManualRequired,
        ];
        if !self
            .store
            .transition(id, &cancellable, ExecutionStatus::Skipped, Some("cancelled"))
            .await?
        {
            let current = self.store.get_execution(id).await?;
            return Err(ExecutionError::InvalidState {
                id,
                status: current.status,
                expected: "PENDING, RUNNING or MANUAL_REQUIRED",
            });
        }

        let execution = self.store.get_execution(id).await?;
        self.audit
            .log(
                AuditEntry::new(execution.user_id, AuditAction::TaskFail, AuditResult::Skipped)
                    .with_task_execution(id)
                    .with_resource("task", execution.task_id.to_string())
                    .with_error("cancelled"),
            )
            .await?;

        info!(execution_id = %id, "Execution cancelled");
        self.notify(&execution, Some("cancelled".to_string()));
        Ok(execution)
    }

    /// Re-run a failed execution with a fresh retry budget
    pub async fn retry_execution(&self, id: Uuid) -> Result<ExecutionOutcome> {
        let mut execution = self.store.get_execution(id).await?;
        if execution.status != ExecutionStatus::Failed {
            return Err(ExecutionError::InvalidState {
                id,
                status: execution.status,
                expected: "FAILED",
            });
        }

        let _permit = self.user_permit(execution.user_id).await?;
        let task = self.store.get_task(execution.task_id).await?;

        execution.status = ExecutionStatus::Pending;
        execution.retry_count = 0;
        execution.error_code = None;
        execution.error_message = None;
        execution.completed_at = None;
        self.store.update_execution(&mut execution).await?;

        self.audit
            .log(
                AuditEntry::new(execution.user_id, AuditAction::TaskRetry, AuditResult::Success)
                    .with_task_execution(id)
                    .with_resource("task", task.id.to_string()),
            )
            .await?;
        info!(execution_id = %id, "Execution reset for retry");

        self.run(task, execution).await
    }

    /// Get an execution
    pub async fn get_execution(&self, id: Uuid) -> Result<TaskExecution> {
        self.store.get_execution(id).await
    }

    /// Get the execution holding an idempotency key
    pub async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<TaskExecution>> {
        self.store.get_by_idempotency_key(key).await
    }

    /// Filtered page of executions, newest first, plus the unpaged total
    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<(Vec<TaskExecution>, u64)> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        self.store.list_executions(filter, limit, offset.max(0)).await
    }

    /// Perform a platform action outside any task, at most once per key
    ///
    /// Holds the account lease and consumes one rate-limit slot. Attempts are
    /// audited under `<key>:<n>`; once one succeeded, later calls return
    /// [`ActionOutcome::AlreadyPerformed`] without touching the platform.
    pub async fn run_action(&self, request: ActionRequest) -> Result<ActionOutcome> {
        let _permit = self.user_permit(request.user_id).await?;
        let leases = self
            .locks
            .acquire_all(
                vec![(ResourceType::Account, request.account_id.to_string())],
                self.config.lock_ttl,
                self.config.lock_max_wait,
            )
            .await?;

        let result = self.run_action_locked(&request).await;
        leases.release_all().await;
        result
    }

    async fn run_action_locked(&self, request: &ActionRequest) -> Result<ActionOutcome> {
        let history = self.audit.attempt_results(&request.idempotency_key).await?;
        if history.contains(&AuditResult::Success) {
            debug!(key = %request.idempotency_key, "Action already performed");
            return Ok(ActionOutcome::AlreadyPerformed);
        }

        self.rate_limiter
            .try_acquire(request.platform, &request.account_id.to_string())
            .await?;

        let mut entry = AuditEntry::new(
            request.user_id,
            action_audit(&request.action),
            AuditResult::Pending,
        )
        .with_platform(request.platform)
        .with_account(Some(request.account_id))
        .with_resource("target", request.action.target())
        .with_request(serde_json::to_value(&request.action)?)
        .with_idempotency_key(format!("{}:{}", request.idempotency_key, history.len() + 1));
        if let Some(job_id) = request.job_id {
            entry = entry.with_job(job_id);
        }
        let pending = self.audit.log_sync(entry).await?;

        let started = Instant::now();
        match self.perform(request).await {
            Ok(proof) => {
                self.finalize_audit(
                    pending.id,
                    Finalization::success(started.elapsed())
                        .with_proof(proof.proof_type.as_str(), &proof.value),
                )
                .await;
                info!(
                    platform = %request.platform,
                    account_id = %request.account_id,
                    action = request.action.name(),
                    "Action performed"
                );
                Ok(ActionOutcome::Performed(proof))
            }
            Err(e) => {
                self.finalize_audit(pending.id, Finalization::failed(e.to_string(), started.elapsed()))
                    .await;
                warn!(
                    platform = %request.platform,
                    account_id = %request.account_id,
                    action = request.action.name(),
                    error = %e,
                    "Action failed"
                );
                Err(e)
            }
        }
    }

    async fn perform(&self, request: &ActionRequest) -> Result<Proof> {
        let adapter = self.adapters.get(request.platform)?;
        let account = request.account_id;
        let proof = match &request.action {
            SocialAction::Follow { target } => adapter.follow(account, target).await?,
            SocialAction::Like { post_id } => adapter.like(account, post_id).await?,
            SocialAction::Recast { post_id } => adapter.repost(account, post_id).await?,
            SocialAction::Reply { post_id, text } => {
                let result = adapter
                    .reply(account, post_id, &PostContent::text(text.as_str()))
                    .await?;
                post_proof(request.platform, &result)?
            }
            SocialAction::Post { content } => {
                let result = adapter.post(account, content).await?;
                post_proof(request.platform, &result)?
            }
        };
        Ok(proof)
    }

    async fn resume(&self, id: Uuid) -> Result<ExecutionOutcome> {
        let execution = self.store.get_execution(id).await?;
        let _permit = self.user_permit(execution.user_id).await?;
        if let Some(outcome) = self.settled(&execution)? {
            return Ok(outcome);
        }
        let task = self.store.get_task(execution.task_id).await?;
        self.run(task, execution).await
    }

    async fn user_permit(&self, user_id: Uuid) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut slots = self.user_slots.lock().await;
            slots
                .entry(user_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent_per_user)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::Cancelled)
    }

    /// Outcome for an execution that must not run again, if any
    fn settled(&self, execution: &TaskExecution) -> Result<Option<ExecutionOutcome>> {
        let outcome = match execution.status {
            ExecutionStatus::Pending => None,
            ExecutionStatus::Running => {
                // A running attempt older than the lease ttl lost its leases
                let stale = execution.started_at.is_some_and(|started| {
                    (Utc::now() - started).to_std().unwrap_or_default() > self.config.lock_ttl
                });
                if !stale {
                    return Err(ExecutionError::InProgress(execution.id));
                }
                warn!(execution_id = %execution.id, "Resuming stale running execution");
                None
            }
            ExecutionStatus::Done => Some(ExecutionOutcome::AlreadyDone(execution.clone())),
            ExecutionStatus::ManualRequired => {
                Some(ExecutionOutcome::ManualRequired(execution.clone()))
            }
            ExecutionStatus::Failed => Some(ExecutionOutcome::Failed(execution.clone())),
            ExecutionStatus::Skipped => Some(ExecutionOutcome::Skipped(execution.clone())),
        };
        Ok(outcome)
    }

    async fn run(&self, task: Task, mut execution: TaskExecution) -> Result<ExecutionOutcome> {
        if task.requires_manual {
            execution.status = ExecutionStatus::ManualRequired;
            execution.action_text = Some(
                task.action_text
                    .clone()
                    .unwrap_or_else(|| format!("Complete \"{}\" manually", task.name)),
            );
            self.store.update_execution(&mut execution).await?;
            info!(execution_id = %execution.id, task_id = %task.id, "Task requires manual action");
            self.notify(&execution, execution.action_text.clone());
            return Ok(ExecutionOutcome::ManualRequired(execution));
        }

        let leases = match self
            .locks
            .acquire_all(
                lock_targets(&task, &execution),
                self.config.lock_ttl,
                self.config.lock_max_wait,
            )
            .await
        {
            Ok(leases) => leases,
            Err(e) => {
                let err = ExecutionError::from(e);
                self.note_contention(&mut execution, &err).await?;
                return Err(err);
            }
        };

        let result = self.run_locked(&task, execution.id).await;
        leases.release_all().await;
        result
    }

    async fn run_locked(&self, task: &Task, id: Uuid) -> Result<ExecutionOutcome> {
        // Re-read under the leases: a concurrent attempt may have settled it
        let mut execution = self.store.get_execution(id).await?;
        if let Some(outcome) = self.settled(&execution)? {
            return Ok(outcome);
        }

        if let (Some(account), true) = (execution.account_id, task.task_type.is_social()) {
            if let Err(e) = self
                .rate_limiter
                .try_acquire(task.platform, &account.to_string())
                .await
            {
                let err = ExecutionError::from(e);
                self.note_contention(&mut execution, &err).await?;
                return Err(err);
            }
        }

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        execution.error_code = None;
        execution.error_message = None;
        self.store.update_execution(&mut execution).await?;
        self.notify(&execution, None);

        let pending = match self.open_attempt(task, &execution).await {
            Ok(entry) => entry,
            Err(e) => {
                self.abandon_attempt(execution.id, &e).await;
                return Err(e);
            }
        };
        execution.audit_log_id = Some(pending.id);

        let started = Instant::now();
        let dispatched = self.dispatch(task, &mut execution).await;
        let elapsed = started.elapsed();

        match dispatched {
            Ok(Dispatched::Completed(proof)) => {
                execution.apply_proof(&proof);
                execution.status = ExecutionStatus::Done;
                execution.completed_at = Some(Utc::now());
                self.finalize_audit(
                    pending.id,
                    Finalization::success(elapsed).with_proof(proof.proof_type.as_str(), &proof.value),
                )
                .await;
                self.store.update_execution(&mut execution).await?;

                info!(
                    execution_id = %execution.id,
                    task_type = %task.task_type,
                    duration_ms = elapsed.as_millis() as u64,
                    "Task done"
                );
                self.notify(&execution, None);
                Ok(ExecutionOutcome::Done(execution))
            }
            Ok(Dispatched::Manual { action_text, data }) => {
                execution.status = ExecutionStatus::ManualRequired;
                execution.action_text = Some(action_text);
                execution.proof_data = data.clone();
                let mut finalization = Finalization::success(elapsed);
                if let Some(data) = data {
                    finalization = finalization.with_response(data);
                }
                self.finalize_audit(pending.id, finalization).await;
                self.store.update_execution(&mut execution).await?;

                info!(execution_id = %execution.id, task_type = %task.task_type, "Task handed to a human");
                self.notify(&execution, execution.action_text.clone());
                Ok(ExecutionOutcome::ManualRequired(execution))
            }
            Err(err) => {
                self.finalize_audit(pending.id, Finalization::failed(err.to_string(), elapsed))
                    .await;
                self.record_failure(execution, err).await
            }
        }
    }

    /// Pending audit entry for the attempt about to be dispatched
    async fn open_attempt(&self, task: &Task, execution: &TaskExecution) -> Result<AuditEntry> {
        let attempt_key = self.next_attempt_key(&execution.idempotency_key).await?;
        let entry = self
            .audit
            .log_sync(
                AuditEntry::new(execution.user_id, task_audit(task.task_type), AuditResult::Pending)
                    .with_platform(task.platform)
                    .with_wallet(execution.wallet_id)
                    .with_account(execution.account_id)
                    .with_task_execution(execution.id)
                    .with_resource("task", task.id.to_string())
                    .with_request(json!({
                        "task_type": task.task_type,
                        "target": task.target(),
                        "retry_count": execution.retry_count,
                    }))
                    .with_idempotency_key(attempt_key),
            )
            .await?;
        Ok(entry)
    }

    /// Return an attempt that never reached dispatch to `PENDING`
    async fn abandon_attempt(&self, id: Uuid, err: &ExecutionError) {
        match self
            .store
            .transition(id, &[ExecutionStatus::Running], ExecutionStatus::Pending, Some(&err.to_string()))
            .await
        {
            Ok(_) => warn!(execution_id = %id, error = %err, "Attempt abandoned before dispatch"),
            Err(e) => error!(execution_id = %id, error = %e, "Failed to reset abandoned attempt"),
        }
    }

    async fn record_failure(
        &self,
        mut execution: TaskExecution,
        err: ExecutionError,
    ) -> Result<ExecutionOutcome> {
        execution.retry_count += 1;
        execution.error_code = Some(err.code().to_string());
        execution.error_message = Some(err.to_string());

        if err.is_retryable() && execution.retry_count < execution.max_retries {
            execution.status = ExecutionStatus::Pending;
            self.store.update_execution(&mut execution).await?;

            let backoff = exponential_backoff(
                execution.retry_count,
                self.config.retry_base,
                self.config.retry_cap,
            );
            warn!(
                execution_id = %execution.id,
                retry_count = execution.retry_count,
                max_retries = execution.max_retries,
                error = %err,
                "Attempt failed, will retry"
            );
            self.notify(&execution, execution.error_message.clone());
            return Ok(ExecutionOutcome::Retry { execution, backoff });
        }

        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(Utc::now());
        self.store.update_execution(&mut execution).await?;

        error!(
            execution_id = %execution.id,
            retry_count = execution.retry_count,
            code = err.code(),
            error = %err,
            "Task failed"
        );
        self.notify(&execution, execution.error_message.clone());
        Ok(ExecutionOutcome::Failed(execution))
    }

    async fn dispatch(&self, task: &Task, execution: &mut TaskExecution) -> Result<Dispatched> {
        match task.task_type {
            TaskType::Follow
            | TaskType::Like
            | TaskType::Recast
            | TaskType::Reply
            | TaskType::Post
            | TaskType::Verify => {
                let account = execution.account_id.ok_or(ExecutionError::MissingActor {
                    task_type: task.task_type,
                    actor: "account",
                })?;
                let proof = self.dispatch_social(task, account).await?;
                Ok(Dispatched::Completed(proof))
            }
            TaskType::Transaction | TaskType::Claim => {
                let wallet = execution.wallet_id.ok_or(ExecutionError::MissingActor {
                    task_type: task.task_type,
                    actor: "wallet",
                })?;
                let signer = self
                    .signer
                    .as_ref()
                    .ok_or(ExecutionError::MissingCollaborator("wallet signer"))?;
                let intent: TransactionIntent = serde_json::from_value(
                    task.config
                        .get("transaction")
                        .cloned()
                        .unwrap_or_else(|| task.config.clone()),
                )?;
                let prepared = signer.prepare_transaction(wallet, &intent).await?;
                Ok(Dispatched::Manual {
                    action_text: format!("Sign the transaction at {}", prepared.sign_url),
                    data: Some(serde_json::to_value(&prepared)?),
                })
            }
            TaskType::Join | TaskType::Quiz | TaskType::WalletConnect | TaskType::Custom => {
                match (browser_profile(task), self.browser.as_ref()) {
                    (Some(profile), Some(browser)) => {
                        let proof = self
                            .dispatch_browser(browser.as_ref(), profile, task, execution)
                            .await?;
                        Ok(Dispatched::Completed(proof))
                    }
                    _ => Ok(Dispatched::Manual {
                        action_text: task
                            .action_text
                            .clone()
                            .unwrap_or_else(|| format!("Complete \"{}\"", task.name)),
                        data: None,
                    }),
                }
            }
        }
    }

    async fn dispatch_social(&self, task: &Task, account: Uuid) -> Result<Proof> {
        let adapter = self.adapters.get(task.platform)?;
        let target = task.target().ok_or_else(|| {
            PlatformError::InvalidRequest(format!("task {} has no target", task.id))
        });

        let proof = match task.task_type {
            TaskType::Follow => adapter.follow(account, target?).await?,
            TaskType::Like => adapter.like(account, target?).await?,
            TaskType::Recast => adapter.repost(account, target?).await?,
            TaskType::Reply => {
                let result = adapter.reply(account, target?, &task_content(task)?).await?;
                post_proof(task.platform, &result)?
            }
            TaskType::Post => {
                let result = adapter.post(account, &task_content(task)?).await?;
                post_proof(task.platform, &result)?
            }
            _ => {
                let target = target?;
                let kind: VerifyKind = match task.config.get("verify") {
                    Some(kind) => serde_json::from_value(kind.clone())?,
                    None => VerifyKind::Follow,
                };
                if !adapter.verify_action(account, kind, target).await? {
                    return Err(PlatformError::NotFound(format!(
                        "{:?} on {} not observed",
                        kind, target
                    ))
                    .into());
                }
                Proof::new(ProofType::ApiResponse, "verified")
                    .with_data(json!({ "kind": kind, "target": target }))
            }
        };
        Ok(proof)
    }

    async fn dispatch_browser(
        &self,
        browser: &dyn BrowserSessionProvider,
        profile: &str,
        task: &Task,
        execution: &mut TaskExecution,
    ) -> Result<Proof> {
        let steps: Vec<BrowserAction> = match task.config.get("steps") {
            Some(steps) => serde_json::from_value(steps.clone())?,
            None => task
                .target_url
                .iter()
                .map(|url| BrowserAction::Navigate { url: url.clone() })
                .collect(),
        };

        let session = browser.start_session(profile).await?;
        execution.browser_session_id = Some(session.id.clone());
        debug!(session_id = %session.id, steps = steps.len(), "Browser session started");

        let result = async {
            for step in &steps {
                let outcome = browser.execute_action(&session, step).await?;
                if !outcome.success {
                    return Err(PlatformError::Other(format!(
                        "browser step failed: {}",
                        outcome.output.unwrap_or_default()
                    )));
                }
            }
            browser.screenshot(&session).await
        }
        .await;

        if let Err(e) = browser.stop_session(&session).await {
            warn!(session_id = %session.id, error = %e, "Failed to stop browser session");
        }

        let screenshot = result?;
        Ok(Proof::new(ProofType::Screenshot, screenshot).with_data(json!({ "session_id": session.id })))
    }

    async fn note_contention(&self, execution: &mut TaskExecution, err: &ExecutionError) -> Result<()> {
        execution.error_code = Some(err.code().to_string());
        execution.error_message = Some(err.to_string());
        self.store.update_execution(execution).await?;
        debug!(execution_id = %execution.id, code = err.code(), "Attempt deferred");
        Ok(())
    }

    async fn next_attempt_key(&self, base: &str) -> Result<String> {
        let attempts = self.audit.attempt_results(base).await?.len();
        Ok(format!("{}:{}", base, attempts + 1))
    }

    async fn finalize_audit(&self, id: Uuid, finalization: Finalization) {
        match self.audit.finalize(id, finalization).await {
            Ok(_) => {}
            Err(AuditError::AlreadyFinalized(_)) => {
                warn!(audit_id = %id, "Audit entry already finalized");
            }
            Err(e) => error!(audit_id = %id, error = %e, "Failed to finalize audit entry"),
        }
    }

    fn notify(&self, execution: &TaskExecution, message: Option<String>) {
        self.events.publish(EngineEvent::TaskStatus {
            execution_id: execution.id,
            task_id: execution.task_id,
            user_id: execution.user_id,
            status: execution.status,
            message,
        });
    }
}

fn check_actor(task: &Task, request: &ExecuteRequest) -> Result<()> {
    if task.task_type.is_social() && request.account_id.is_none() {
        return Err(ExecutionError::MissingActor {
            task_type: task.task_type,
            actor: "account",
        });
    }
    if task.task_type.is_onchain() && request.wallet_id.is_none() {
        return Err(ExecutionError::MissingActor {
            task_type: task.task_type,
            actor: "wallet",
        });
    }
    Ok(())
}

fn browser_profile(task: &Task) -> Option<&str> {
    task.config.get("browser_profile").and_then(|v| v.as_str())
}

/// Leases an attempt needs, before ordering
fn lock_targets(task: &Task, execution: &TaskExecution) -> Vec<(ResourceType, String)> {
    let mut targets = Vec::new();
    if let Some(wallet) = execution.wallet_id {
        if !task.task_type.is_social() {
            targets.push((ResourceType::Wallet, wallet.to_string()));
        }
    }
    if let Some(account) = execution.account_id {
        if !task.task_type.is_onchain() {
            targets.push((ResourceType::Account, account.to_string()));
        }
    }
    if let Some(profile) = browser_profile(task) {
        targets.push((ResourceType::Browser, profile.to_string()));
    }
    if targets.is_empty() {
        targets.push((ResourceType::Task, format!("{}:{}", task.id, execution.user_id)));
    }
    targets
}

fn task_content(task: &Task) -> Result<PostContent> {
    let text = task.action_text.as_deref().ok_or_else(|| {
        PlatformError::InvalidRequest(format!("task {} has no text to post", task.id))
    })?;
    let mut content = PostContent::text(text);
    content.channel_id = task
        .config
        .get("channel_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Ok(content)
}

fn post_proof(platform: Platform, result: &PostResult) -> Result<Proof> {
    let proof = match platform {
        Platform::Farcaster => Proof::new(ProofType::CastHash, result.post_id.clone()),
        _ => Proof::new(
            ProofType::PostUrl,
            result.url.clone().unwrap_or_else(|| result.post_id.clone()),
        ),
    };
    Ok(proof.with_data(serde_json::to_value(result)?))
}

fn task_audit(task_type: TaskType) -> AuditAction {
    match task_type {
        TaskType::Follow => AuditAction::Follow,
        TaskType::Like => AuditAction::Like,
        TaskType::Recast => AuditAction::Recast,
        TaskType::Reply => AuditAction::Reply,
        TaskType::Post => AuditAction::Post,
        TaskType::Join => AuditAction::Join,
        TaskType::Transaction => AuditAction::Transaction,
        TaskType::Claim => AuditAction::Claim,
        TaskType::WalletConnect => AuditAction::Connect,
        TaskType::Quiz => AuditAction::QuizAnswer,
        TaskType::Verify => AuditAction::TaskComplete,
        TaskType::Custom => AuditAction::BrowserAction,
    }
}

fn action_audit(action: &SocialAction) -> AuditAction {
    match action {
        SocialAction::Follow { .. } => AuditAction::Follow,
        SocialAction::Like { .. } => AuditAction::Like,
        SocialAction::Recast { .. } => AuditAction::Recast,
        SocialAction::Reply { .. } => AuditAction::Reply,
        SocialAction::Post { .. } => AuditAction::Post,
    }
}
