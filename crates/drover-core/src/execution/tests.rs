use super::*;
use crate::audit::{AuditConfig, AuditStore};
use crate::db::Database;
use crate::keyspace::{KeyspaceStore, MemoryKeyspace};
use crate::locks::LockError;
use crate::platform::{PlatformAdapter, PlatformResult, PreparedTransaction};
use crate::rate_limit::{PolicyTable, RatePolicy};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Farcaster adapter that records calls and fails on demand
#[derive(Default)]
struct RecordingAdapter {
    calls: AtomicUsize,
    transient_failures: AtomicUsize,
    suspended: AtomicBool,
}

impl RecordingAdapter {
    fn record(&self) -> PlatformResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.suspended.load(Ordering::SeqCst) {
            return Err(PlatformError::AccountSuspended);
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(PlatformError::Network("connection reset".into()));
        }
        Ok(())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for RecordingAdapter {
    fn platform(&self) -> Platform {
        Platform::Farcaster
    }

    async fn follow(&self, _account_id: Uuid, target_user: &str) -> PlatformResult<Proof> {
        self.record()?;
        Ok(Proof::new(ProofType::ApiResponse, format!("followed {}", target_user)))
    }

    async fn like(&self, _account_id: Uuid, post_id: &str) -> PlatformResult<Proof> {
        self.record()?;
        Ok(Proof::new(ProofType::ApiResponse, format!("liked {}", post_id)))
    }

    async fn post(&self, _account_id: Uuid, _content: &PostContent) -> PlatformResult<PostResult> {
        self.record()?;
        Ok(PostResult {
            post_id: "0xcast".into(),
            url: None,
            posted_at: Utc::now(),
        })
    }
}

struct FakeSigner;

#[async_trait]
impl WalletSigner for FakeSigner {
    async fn prepare_transaction(
        &self,
        wallet_id: Uuid,
        intent: &TransactionIntent,
    ) -> PlatformResult<PreparedTransaction> {
        Ok(PreparedTransaction {
            unsigned_tx: json!({"to": intent.to, "chain_id": intent.chain_id}),
            sign_url: format!("https://sign.example/{}", wallet_id),
        })
    }
}

struct TestContext {
    engine: TaskExecutionEngine,
    adapter: Arc<RecordingAdapter>,
    locks: LockManager,
    audit: AuditLogger,
    events: EventBus,
    db: Database,
    campaign: Uuid,
    user: Uuid,
    account: Uuid,
    _dir: TempDir,
}

impl TestContext {
    async fn task(&self, task: Task) -> Task {
        self.engine.store().save_task(&task).await.unwrap();
        task
    }

    fn follow(&self) -> Task {
        Task::new(self.campaign, "Follow dwr", TaskType::Follow, Platform::Farcaster)
            .with_target_account("dwr")
    }

    fn request(&self, task: &Task) -> ExecuteRequest {
        ExecuteRequest::new(task.id, self.user).with_account(self.account)
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_locks(Duration::from_secs(30), Duration::from_millis(50))
        .with_retry_backoff(Duration::ZERO, Duration::ZERO)
}

async fn create_test_context_with(policies: PolicyTable) -> TestContext {
    let dir = TempDir::new().unwrap();
    let db = Database::from_path(&dir.path().join("engine.db"))
        .await
        .unwrap();
    let keyspace: Arc<dyn KeyspaceStore> = Arc::new(MemoryKeyspace::new());
    let locks = LockManager::new(keyspace.clone());
    let limiter = RateLimiter::new(keyspace).with_policies(policies);
    let audit = AuditLogger::start(AuditStore::new(db.pool().clone()), AuditConfig::default());
    let adapter = Arc::new(RecordingAdapter::default());
    let events = EventBus::new(64);

    let engine = TaskExecutionEngine::new(
        TaskStore::new(db.pool().clone()),
        locks.clone(),
        limiter,
        audit.clone(),
        AdapterRegistry::new().with_adapter(adapter.clone()),
    )
    .with_signer(Arc::new(FakeSigner))
    .with_events(events.clone())
    .with_config(fast_config());

    TestContext {
        engine,
        adapter,
        locks,
        audit,
        events,
        db,
        campaign: Uuid::new_v4(),
        user: Uuid::new_v4(),
        account: Uuid::new_v4(),
        _dir: dir,
    }
}

async fn create_test_context() -> TestContext {
    create_test_context_with(PolicyTable::default()).await
}

#[test]
fn test_idempotency_key_is_stable_per_day() {
    let task = Uuid::new_v4();
    let account = Uuid::new_v4();
    let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    let next = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

    let key = idempotency_key(task, Some(account), None, day);
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(key, idempotency_key(task, Some(account), None, day));
    assert_ne!(key, idempotency_key(task, Some(account), None, next));
    assert_ne!(key, idempotency_key(task, None, Some(account), day));
}

#[tokio::test]
async fn test_manual_task_waits_for_human_proof() {
    let ctx = create_test_context().await;
    let task = ctx
        .task(
            Task::new(ctx.campaign, "Bridge funds", TaskType::Custom, Platform::Onchain)
                .with_action_text("Bridge 0.01 ETH to Base")
                .manual(),
        )
        .await;

    let outcome = ctx
        .engine
        .execute(ExecuteRequest::new(task.id, ctx.user))
        .await
        .unwrap();
    let ExecutionOutcome::ManualRequired(execution) = outcome else {
        panic!("expected manual outcome, got {:?}", outcome);
    };
    assert_eq!(execution.status, ExecutionStatus::ManualRequired);
    assert_eq!(execution.action_text.as_deref(), Some("Bridge 0.01 ETH to Base"));
    assert_eq!(ctx.adapter.calls(), 0);

    let done = ctx
        .engine
        .continue_execution(
            execution.id,
            ContinueInput {
                proof_type: ProofType::TxHash,
                proof_value: "0xabc".into(),
                data: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Done);
    assert_eq!(done.proof_type, Some(ProofType::TxHash));
    assert_eq!(done.proof_value.as_deref(), Some("0xabc"));
    assert!(done.completed_at.is_some());

    let stored = ctx.engine.get_execution(execution.id).await.unwrap();
    assert_eq!(stored, done);

    // Continuing twice is rejected
    let err = ctx
        .engine
        .continue_execution(
            execution.id,
            ContinueInput {
                proof_type: ProofType::TxHash,
                proof_value: "0xdef".into(),
                data: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidState { .. }));
}

#[tokio::test]
async fn test_continue_survives_audit_outage() {
    let ctx = create_test_context().await;
    let task = ctx
        .task(
            Task::new(ctx.campaign, "Bridge funds", TaskType::Custom, Platform::Onchain)
                .with_action_text("Bridge 0.01 ETH to Base")
                .manual(),
        )
        .await;
    let outcome = ctx
        .engine
        .execute(ExecuteRequest::new(task.id, ctx.user))
        .await
        .unwrap();
    let ExecutionOutcome::ManualRequired(execution) = outcome else {
        panic!("expected manual outcome, got {:?}", outcome);
    };
    let input = || ContinueInput {
        proof_type: ProofType::TxHash,
        proof_value: "0xabc".into(),
        data: None,
    };

    ctx.db.block_inserts("audit_logs").await;
    let err = ctx
        .engine
        .continue_execution(execution.id, input())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AUDIT_ERROR");
    let stored = ctx.engine.get_execution(execution.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::ManualRequired);
    assert!(stored.proof_value.is_none());

    ctx.db.unblock_inserts("audit_logs").await;
    let done = ctx
        .engine
        .continue_execution(execution.id, input())
        .await
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Done);
    assert_eq!(done.proof_value.as_deref(), Some("0xabc"));

    let entry = ctx.audit.get(done.audit_log_id.unwrap()).await.unwrap();
    assert_eq!(entry.result, AuditResult::Success);
    assert_eq!(entry.proof_value.as_deref(), Some("0xabc"));
}

#[tokio::test]
async fn test_attempt_without_audit_entry_returns_to_pending() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow()).await;

    ctx.db.block_inserts("audit_logs").await;
    let err = ctx.engine.execute(ctx.request(&task)).await.unwrap_err();
    assert_eq!(err.code(), "AUDIT_ERROR");
    assert_eq!(ctx.adapter.calls(), 0);

    let (executions, _) = ctx
        .engine
        .list_executions(&ExecutionFilter::default(), None, 0)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Pending);

    // The next attempt runs instead of reporting it in progress
    ctx.db.unblock_inserts("audit_logs").await;
    let outcome = ctx.engine.execute(ctx.request(&task)).await.unwrap();
    assert!(outcome.is_done());
    assert_eq!(ctx.adapter.calls(), 1);
}

#[tokio::test]
async fn test_done_execution_is_not_repeated() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow()).await;

    let first = ctx.engine.execute(ctx.request(&task)).await.unwrap();
    let ExecutionOutcome::Done(execution) = &first else {
        panic!("expected done, got {:?}", first);
    };
    assert_eq!(execution.proof_value.as_deref(), Some("followed dwr"));

    let second = ctx.engine.execute(ctx.request(&task)).await.unwrap();
    assert!(matches!(second, ExecutionOutcome::AlreadyDone(ref e) if e.id == execution.id));
    assert_eq!(ctx.adapter.calls(), 1);

    let audit_id = execution.audit_log_id.unwrap();
    let entry = ctx.audit.get(audit_id).await.unwrap();
    assert_eq!(entry.result, AuditResult::Success);
    assert_eq!(entry.action, AuditAction::Follow);
    assert_eq!(entry.task_execution_id, Some(execution.id));
    assert_eq!(
        entry.idempotency_key,
        Some(format!("{}:1", execution.idempotency_key))
    );
}

#[tokio::test]
async fn test_concurrent_executes_run_action_once() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow()).await;

    let (a, b) = tokio::join!(
        ctx.engine.execute(ctx.request(&task)),
        ctx.engine.execute(ctx.request(&task))
    );

    let done = [a, b]
        .into_iter()
        .filter(|r| matches!(r, Ok(o) if o.is_done()))
        .count();
    assert!(done >= 1);
    assert_eq!(ctx.adapter.calls(), 1);
}

#[tokio::test]
async fn test_dependency_must_be_done() {
    let ctx = create_test_context().await;
    let first = ctx.task(ctx.follow()).await;
    let second = ctx
        .task(
            Task::new(ctx.campaign, "Like launch cast", TaskType::Like, Platform::Farcaster)
                .with_target_url("0xlaunch")
                .depends_on(first.id),
        )
        .await;

    let err = ctx.engine.execute(ctx.request(&second)).await.unwrap_err();
    assert!(
        matches!(err, ExecutionError::DependencyNotMet { depends_on, .. } if depends_on == first.id)
    );
    assert_eq!(err.code(), "DEPENDENCY_NOT_MET");
    assert_eq!(ctx.adapter.calls(), 0);

    ctx.engine.execute(ctx.request(&first)).await.unwrap();
    let outcome = ctx.engine.execute(ctx.request(&second)).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Done(_)));
}

#[tokio::test]
async fn test_dependency_is_checked_per_actor() {
    let ctx = create_test_context().await;
    let first = ctx.task(ctx.follow()).await;
    let second = ctx
        .task(
            Task::new(ctx.campaign, "Like launch cast", TaskType::Like, Platform::Farcaster)
                .with_target_url("0xlaunch")
                .depends_on(first.id),
        )
        .await;
    ctx.engine.execute(ctx.request(&first)).await.unwrap();
    assert_eq!(ctx.adapter.calls(), 1);

    // Another account of the same user has not done the prerequisite
    let other = ExecuteRequest::new(second.id, ctx.user).with_account(Uuid::new_v4());
    let err = ctx.engine.execute(other).await.unwrap_err();
    assert!(matches!(err, ExecutionError::DependencyNotMet { .. }));
    assert_eq!(ctx.adapter.calls(), 1);

    let outcome = ctx.engine.execute(ctx.request(&second)).await.unwrap();
    assert!(outcome.is_done());
    assert_eq!(ctx.adapter.calls(), 2);
}

#[tokio::test]
async fn test_dependency_uses_newest_execution() {
    let ctx = create_test_context().await;
    let first = ctx.task(ctx.follow()).await;
    let second = ctx
        .task(
            Task::new(ctx.campaign, "Like launch cast", TaskType::Like, Platform::Farcaster)
                .with_target_url("0xlaunch")
                .depends_on(first.id),
        )
        .await;
    ctx.engine.execute(ctx.request(&first)).await.unwrap();

    // A later failed attempt by the same account supersedes the done one
    let mut later = TaskExecution::pending(&first, &ctx.request(&first), "later-attempt".into());
    later.status = ExecutionStatus::Failed;
    later.created_at = Utc::now() + chrono::Duration::seconds(5);
    assert!(ctx.engine.store().insert_execution(&later).await.unwrap());

    let err = ctx.engine.execute(ctx.request(&second)).await.unwrap_err();
    assert!(matches!(err, ExecutionError::DependencyNotMet { .. }));
    assert_eq!(ctx.adapter.calls(), 1);
}

#[tokio::test]
async fn test_force_skips_dependency_check() {
    let ctx = create_test_context().await;
    let second = ctx
        .task(ctx.follow().depends_on(Uuid::new_v4()))
        .await;

    let outcome = ctx
        .engine
        .execute(ctx.request(&second).forced())
        .await
        .unwrap();
    assert!(outcome.is_done());
}

#[tokio::test]
async fn test_rate_limited_execution_stays_pending() {
    let ctx = create_test_context_with(
        PolicyTable::default().with_policy(
            Platform::Farcaster,
            RatePolicy::new(Duration::from_secs(60), 1, 0),
        ),
    )
    .await;
    let follow = ctx.task(ctx.follow()).await;
    let like = ctx
        .task(
            Task::new(ctx.campaign, "Like", TaskType::Like, Platform::Farcaster)
                .with_target_url("0xpost"),
        )
        .await;

    assert!(ctx.engine.execute(ctx.request(&follow)).await.unwrap().is_done());

    let err = ctx.engine.execute(ctx.request(&like)).await.unwrap_err();
    assert!(matches!(err, ExecutionError::RateLimited { platform: Platform::Farcaster, .. }));
    assert!(err.is_contention());

    let key = idempotency_key(like.id, Some(ctx.account), None, Utc::now().date_naive());
    let execution = ctx.engine.get_by_idempotency_key(&key).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.retry_count, 0);
    assert_eq!(execution.error_code.as_deref(), Some("RATE_LIMITED"));
    assert_eq!(ctx.adapter.calls(), 1);
}

#[tokio::test]
async fn test_held_account_lease_defers_execution() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow()).await;
    let lease = ctx
        .locks
        .acquire(ResourceType::Account, &ctx.account.to_string(), Duration::from_secs(30))
        .await
        .unwrap();

    let err = ctx.engine.execute(ctx.request(&task)).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Lock(LockError::NotAcquired(_))));
    assert_eq!(err.code(), "LOCK_NOT_ACQUIRED");
    assert_eq!(ctx.adapter.calls(), 0);

    ctx.locks.release(&lease).await.unwrap();
    assert!(ctx.engine.execute(ctx.request(&task)).await.unwrap().is_done());
}

#[tokio::test]
async fn test_transient_failures_retry_until_done() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow()).await;
    ctx.adapter.transient_failures.store(2, Ordering::SeqCst);

    let first = ctx.engine.execute(ctx.request(&task)).await.unwrap();
    let ExecutionOutcome::Retry { execution, .. } = &first else {
        panic!("expected retry, got {:?}", first);
    };
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.retry_count, 1);
    assert_eq!(execution.error_code.as_deref(), Some("NETWORK_ERROR"));

    let cancel = CancellationToken::new();
    let outcome = ctx
        .engine
        .execute_with_retry(ctx.request(&task), &cancel)
        .await
        .unwrap();
    let ExecutionOutcome::Done(done) = outcome else {
        panic!("expected done, got {:?}", outcome);
    };
    assert_eq!(done.id, execution.id);
    assert_eq!(done.retry_count, 2);
    assert_eq!(ctx.adapter.calls(), 3);

    // Each attempt has its own audit entry
    let results = ctx.audit.attempt_results(&done.idempotency_key).await.unwrap();
    assert_eq!(
        results,
        vec![AuditResult::Failed, AuditResult::Failed, AuditResult::Success]
    );
}

#[tokio::test]
async fn test_exhausted_retries_fail_then_manual_retry_succeeds() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow().with_max_retries(2)).await;
    ctx.adapter.transient_failures.store(10, Ordering::SeqCst);

    let outcome = ctx
        .engine
        .execute_with_retry(ctx.request(&task), &CancellationToken::new())
        .await
        .unwrap();
    let ExecutionOutcome::Failed(failed) = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.retry_count, 2);
    assert_eq!(ctx.adapter.calls(), 2);

    // A failed execution is terminal for the day
    let again = ctx.engine.execute(ctx.request(&task)).await.unwrap();
    assert!(matches!(again, ExecutionOutcome::Failed(_)));
    assert_eq!(ctx.adapter.calls(), 2);

    ctx.adapter.transient_failures.store(0, Ordering::SeqCst);
    let retried = ctx.engine.retry_execution(failed.id).await.unwrap();
    let ExecutionOutcome::Done(done) = retried else {
        panic!("expected done, got {:?}", retried);
    };
    assert_eq!(done.id, failed.id);
    assert_eq!(done.retry_count, 0);
}

#[tokio::test]
async fn test_non_retryable_failure_fails_immediately() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow()).await;
    ctx.adapter.suspended.store(true, Ordering::SeqCst);

    let outcome = ctx.engine.execute(ctx.request(&task)).await.unwrap();
    let ExecutionOutcome::Failed(failed) = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error_code.as_deref(), Some("ACCOUNT_SUSPENDED"));

    let entry = ctx.audit.get(failed.audit_log_id.unwrap()).await.unwrap();
    assert_eq!(entry.result, AuditResult::Failed);
}

#[tokio::test]
async fn test_retry_requires_failed_status() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow()).await;
    let done = ctx
        .engine
        .execute(ctx.request(&task))
        .await
        .unwrap()
        .into_execution();

    let err = ctx.engine.retry_execution(done.id).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::InvalidState {
            status: ExecutionStatus::Done,
            ..
        }
    ));
}

#[tokio::test]
async fn test_cancel_skips_unsettled_execution() {
    let ctx = create_test_context().await;
    let task = ctx
        .task(
            Task::new(ctx.campaign, "Join Discord", TaskType::Join, Platform::Discord)
                .with_action_text("Join the server"),
        )
        .await;

    let manual = ctx
        .engine
        .execute(ExecuteRequest::new(task.id, ctx.user))
        .await
        .unwrap()
        .into_execution();
    assert_eq!(manual.status, ExecutionStatus::ManualRequired);

    let skipped = ctx.engine.cancel_execution(manual.id).await.unwrap();
    assert_eq!(skipped.status, ExecutionStatus::Skipped);
    assert_eq!(skipped.error_message.as_deref(), Some("cancelled"));

    let err = ctx.engine.cancel_execution(manual.id).await.unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidState { .. }));

    let again = ctx
        .engine
        .execute(ExecuteRequest::new(task.id, ctx.user))
        .await
        .unwrap();
    assert!(matches!(again, ExecutionOutcome::Skipped(_)));
}

#[tokio::test]
async fn test_transaction_is_prepared_for_signing() {
    let ctx = create_test_context().await;
    let wallet = Uuid::new_v4();
    let task = ctx
        .task(
            Task::new(ctx.campaign, "Mint", TaskType::Transaction, Platform::Onchain).with_config(
                json!({"transaction": {"to": "0xcontract", "value": "0", "data": "0x", "chain_id": 8453}}),
            ),
        )
        .await;

    let outcome = ctx
        .engine
        .execute(ExecuteRequest::new(task.id, ctx.user).with_wallet(wallet))
        .await
        .unwrap();
    let ExecutionOutcome::ManualRequired(execution) = outcome else {
        panic!("expected manual, got {:?}", outcome);
    };
    assert_eq!(
        execution.action_text,
        Some(format!("Sign the transaction at https://sign.example/{}", wallet))
    );
    assert_eq!(
        execution.proof_data.as_ref().unwrap()["unsigned_tx"]["chain_id"],
        8453
    );
}

#[tokio::test]
async fn test_social_task_requires_account() {
    let ctx = create_test_context().await;
    let task = ctx.task(ctx.follow()).await;

    let err = ctx
        .engine
        .execute(ExecuteRequest::new(task.id, ctx.user))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::MissingActor { actor: "account", .. }));
}

#[tokio::test]
async fn test_status_changes_are_published() {
    let ctx = create_test_context().await;
    let mut rx = ctx.events.subscribe();
    let task = ctx.task(ctx.follow()).await;

    ctx.engine.execute(ctx.request(&task)).await.unwrap();

    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::TaskStatus { status, .. } = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![ExecutionStatus::Running, ExecutionStatus::Done]);
}

#[tokio::test]
async fn test_list_executions_filters_by_status() {
    let ctx = create_test_context().await;
    let follow = ctx.task(ctx.follow()).await;
    let manual = ctx
        .task(Task::new(ctx.campaign, "Quiz", TaskType::Quiz, Platform::Onchain).manual())
        .await;

    ctx.engine.execute(ctx.request(&follow)).await.unwrap();
    ctx.engine
        .execute(ExecuteRequest::new(manual.id, ctx.user))
        .await
        .unwrap();

    let filter = ExecutionFilter {
        user_id: Some(ctx.user),
        ..Default::default()
    };
    let (all, total) = ctx.engine.list_executions(&filter, None, 0).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(all.len(), 2);

    let filter = ExecutionFilter {
        status: Some(ExecutionStatus::ManualRequired),
        ..filter
    };
    let (manual_only, total) = ctx.engine.list_executions(&filter, None, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(manual_only[0].task_id, manual.id);
}

#[tokio::test]
async fn test_run_action_is_idempotent_per_key() {
    let ctx = create_test_context().await;
    let request = ActionRequest {
        user_id: ctx.user,
        account_id: ctx.account,
        platform: Platform::Farcaster,
        action: SocialAction::Like {
            post_id: "0xfeed".into(),
        },
        job_id: Some(Uuid::new_v4()),
        idempotency_key: "engagement:like:0xfeed".into(),
    };

    let first = ctx.engine.run_action(request.clone()).await.unwrap();
    assert!(matches!(first, ActionOutcome::Performed(ref p) if p.value == "liked 0xfeed"));

    let second = ctx.engine.run_action(request).await.unwrap();
    assert_eq!(second, ActionOutcome::AlreadyPerformed);
    assert_eq!(ctx.adapter.calls(), 1);
}

#[tokio::test]
async fn test_run_action_retries_after_failure() {
    let ctx = create_test_context().await;
    ctx.adapter.transient_failures.store(1, Ordering::SeqCst);
    let request = ActionRequest {
        user_id: ctx.user,
        account_id: ctx.account,
        platform: Platform::Farcaster,
        action: SocialAction::Post {
            content: PostContent::text("gm"),
        },
        job_id: None,
        idempotency_key: "post:gm".into(),
    };

    let err = ctx.engine.run_action(request.clone()).await.unwrap_err();
    assert_eq!(err.code(), "NETWORK_ERROR");

    let outcome = ctx.engine.run_action(request).await.unwrap();
    let ActionOutcome::Performed(proof) = outcome else {
        panic!("expected performed, got {:?}", outcome);
    };
    assert_eq!(proof.proof_type, ProofType::CastHash);
    assert_eq!(proof.value, "0xcast");

    let history = ctx.audit.attempt_results("post:gm").await.unwrap();
    assert_eq!(history, vec![AuditResult::Failed, AuditResult::Success]);
}
