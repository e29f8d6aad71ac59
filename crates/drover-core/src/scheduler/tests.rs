use super::*;
use crate::audit::{AuditConfig, AuditLogger, AuditStore};
use crate::db::Database;
use crate::event_bus::{EngineEvent, EventBus};
use crate::execution::{
    idempotency_key, EngineConfig, ExecuteRequest, ExecutionStatus, Proof, ProofType, Task,
    TaskExecution, TaskExecutionEngine, TaskStore, TaskType,
};
use crate::keyspace::{KeyspaceStore, MemoryKeyspace};
use crate::locks::{LockManager, ResourceType};
use crate::platform::{AdapterRegistry, Platform, PlatformAdapter, PlatformResult};
use crate::queue::{JobQueue, QueueConfig, QueueError, QueuedJobStatus};
use crate::rate_limit::RateLimiter;
use crate::shutdown::ShutdownController;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Handler that counts calls and fails or stalls on demand
#[derive(Default)]
struct ScriptedHandler {
    calls: AtomicUsize,
    fail: bool,
    stall: Option<Duration>,
}

impl ScriptedHandler {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, ctx: &JobContext) -> SchedulerResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stall) = self.stall {
            tokio::select! {
                _ = tokio::time::sleep(stall) => {}
                _ = ctx.cancel.cancelled() => return Err(SchedulerError::Cancelled),
            }
        }
        if self.fail {
            return Err(SchedulerError::Handler("scripted failure".into()));
        }
        Ok(json!({ "job": ctx.job.id }))
    }
}

#[derive(Default)]
struct CountingAdapter {
    calls: AtomicUsize,
}

#[async_trait]
impl PlatformAdapter for CountingAdapter {
    fn platform(&self) -> Platform {
        Platform::Farcaster
    }

    async fn follow(&self, _account_id: Uuid, target_user: &str) -> PlatformResult<Proof> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Proof::new(ProofType::ApiResponse, format!("followed {}", target_user)))
    }

    async fn like(&self, _account_id: Uuid, post_id: &str) -> PlatformResult<Proof> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Proof::new(ProofType::ApiResponse, format!("liked {}", post_id)))
    }
}

struct TestContext {
    scheduler: Scheduler,
    handler: Arc<ScriptedHandler>,
    engine: TaskExecutionEngine,
    adapter: Arc<CountingAdapter>,
    locks: LockManager,
    events: EventBus,
    db: Database,
    user: Uuid,
    _dir: TempDir,
}

impl TestContext {
    fn start(&self) -> (Arc<ShutdownController>, JoinHandle<SchedulerResult<()>>) {
        let shutdown = ShutdownController::with_timeout(Duration::from_secs(5));
        let scheduler = self.scheduler.clone();
        let handle = tokio::spawn({
            let shutdown = Arc::clone(&shutdown);
            async move { scheduler.run(shutdown).await }
        });
        (shutdown, handle)
    }

    async fn job(&self, job: Job) -> Job {
        self.scheduler.create_job(job).await.unwrap()
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_workers(2)
        .with_poll_interval(Duration::from_millis(10))
        .with_lease(Duration::from_secs(30))
        .with_check_interval(Duration::from_secs(3600))
        .with_contention_delay(Duration::from_secs(3600))
}

async fn create_test_context_with(handler: ScriptedHandler, config: SchedulerConfig) -> TestContext {
    let dir = TempDir::new().unwrap();
    let db = Database::from_path(&dir.path().join("scheduler.db"))
        .await
        .unwrap();
    let keyspace: Arc<dyn KeyspaceStore> = Arc::new(MemoryKeyspace::new());
    let locks = LockManager::new(keyspace.clone());
    let queue = JobQueue::new(
        keyspace.clone(),
        locks.clone(),
        QueueConfig::new("test")
            .with_default_max_retries(2)
            .with_backoff(Duration::ZERO, Duration::ZERO),
    );
    let adapter = Arc::new(CountingAdapter::default());
    let adapters = AdapterRegistry::new().with_adapter(adapter.clone());
    let audit = AuditLogger::start(AuditStore::new(db.pool().clone()), AuditConfig::default());
    let events = EventBus::new(64);
    let engine = TaskExecutionEngine::new(
        TaskStore::new(db.pool().clone()),
        locks.clone(),
        RateLimiter::new(keyspace.clone()),
        audit,
        adapters.clone(),
    )
    .with_events(events.clone())
    .with_config(
        EngineConfig::default()
            .with_locks(Duration::from_secs(30), Duration::from_millis(50))
            .with_retry_backoff(Duration::ZERO, Duration::ZERO),
    );

    let handler = Arc::new(handler);
    let handlers = HandlerRegistry::standard(HandlerDeps {
        engine: engine.clone(),
        locks: locks.clone(),
        adapters,
        wallets: None,
        content: None,
        lock_ttl: Duration::from_secs(30),
        bulk_max_parallel: DEFAULT_MAX_PARALLEL,
    })
    .with_handler(JobKind::BalanceSync, handler.clone());

    let scheduler = Scheduler::new(
        JobStore::new(db.pool().clone()),
        queue,
        locks.clone(),
        keyspace,
        handlers,
        config,
    )
    .with_events(events.clone());

    TestContext {
        scheduler,
        handler,
        engine,
        adapter,
        locks,
        events,
        db,
        user: Uuid::new_v4(),
        _dir: dir,
    }
}

async fn create_test_context() -> TestContext {
    create_test_context_with(ScriptedHandler::default(), fast_config()).await
}

const WAIT_ROUNDS: usize = 250;

/// Poll until `check` holds, for up to five seconds
async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..WAIT_ROUNDS {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

impl TestContext {
    async fn wait_for_job(&self, id: Uuid, check: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..WAIT_ROUNDS {
            let job = self.scheduler.get_job(id).await.unwrap();
            if check(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} did not reach the expected state", id);
    }

    async fn wait_for_queue(&self, check: impl Fn(&crate::queue::QueueStats) -> bool) {
        for _ in 0..WAIT_ROUNDS {
            if check(&self.scheduler.queue().stats().await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("queue did not reach the expected state");
    }
}

#[tokio::test]
async fn test_create_job_validates_cron() {
    let ctx = create_test_context().await;

    let job = ctx
        .job(Job::new(ctx.user, "sync", JobKind::BalanceSync).with_cron("*/5 * * * *"))
        .await;
    let next = job.next_run_at.unwrap();
    assert!(next > Utc::now());
    assert!(next <= Utc::now() + ChronoDuration::minutes(5));

    let err = ctx
        .scheduler
        .create_job(Job::new(ctx.user, "bad", JobKind::BalanceSync).with_cron("every minute"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    assert_eq!(ctx.scheduler.list_jobs(Some(ctx.user)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_now_dedupes_outstanding_runs() {
    let ctx = create_test_context().await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;

    let queued = ctx.scheduler.run_now(job.id).await.unwrap();
    assert_eq!(queued.dedupe_key.as_deref(), Some(job.dedupe_key().as_str()));

    let err = ctx.scheduler.run_now(job.id).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Queue(QueueError::DuplicateJob { .. })
    ));
    assert_eq!(ctx.scheduler.queue().stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_run_now_unknown_job() {
    let ctx = create_test_context().await;
    let missing = Uuid::new_v4();
    let err = ctx.scheduler.run_now(missing).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound(id) if id == missing));
}

#[tokio::test]
async fn test_check_due_enqueues_only_schedulable_jobs() {
    let ctx = create_test_context().await;
    let past = Utc::now() - ChronoDuration::minutes(1);

    let due = ctx
        .job(Job::new(ctx.user, "due", JobKind::BalanceSync).at(past))
        .await;
    let paused = ctx
        .job(Job::new(ctx.user, "paused", JobKind::BalanceSync).at(past))
        .await;
    ctx.scheduler.pause_job(paused.id).await.unwrap();
    ctx.job(Job::new(ctx.user, "later", JobKind::BalanceSync).at(Utc::now() + ChronoDuration::hours(1)))
        .await;

    assert_eq!(ctx.scheduler.check_due().await.unwrap(), 1);
    assert_eq!(ctx.scheduler.queue().stats().await.unwrap().pending, 1);

    // One-shot jobs are not due again once enqueued
    let reloaded = ctx.scheduler.get_job(due.id).await.unwrap();
    assert!(reloaded.next_run_at.is_none());
    assert_eq!(ctx.scheduler.check_due().await.unwrap(), 0);
}

#[tokio::test]
async fn test_worker_runs_job_and_records_history() {
    let ctx = create_test_context().await;
    let mut events = ctx.events.subscribe();
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;
    let (shutdown, handle) = ctx.start();

    let queued = ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_job(job.id, |j| j.total_runs == 1).await;

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();

    let job = ctx.scheduler.get_job(job.id).await.unwrap();
    assert_eq!(ctx.handler.calls(), 1);
    assert_eq!(job.success_runs, 1);
    assert_eq!(job.failed_runs, 0);
    assert_eq!(job.status, JobStatus::Idle);
    assert!(job.last_run_at.is_some());

    let runs = ctx.scheduler.job_runs(job.id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, JobRunStatus::Success);
    assert_eq!(runs[0].queued_job_id, Some(queued.id));
    assert!(runs[0].finished_at.is_some());

    let settled = ctx.scheduler.queue().get(queued.id).await.unwrap();
    assert_eq!(settled.result, Some(json!({ "job": job.id })));

    let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, EngineEvent::JobStarted { .. } | EngineEvent::JobCompleted { .. }))
        .map(|e| e.name())
        .collect();
    assert_eq!(names, vec!["job:started", "job:completed"]);
}

#[tokio::test]
async fn test_manual_run_keeps_job_paused() {
    let ctx = create_test_context().await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;
    ctx.scheduler.pause_job(job.id).await.unwrap();
    let (shutdown, handle) = ctx.start();

    ctx.scheduler.run_now(job.id).await.unwrap();
    let job = ctx.wait_for_job(job.id, |j| j.success_runs == 1).await;

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert!(!job.is_schedulable());
}

#[tokio::test]
async fn test_failing_job_retries_then_fails() {
    let ctx = create_test_context_with(
        ScriptedHandler {
            fail: true,
            ..Default::default()
        },
        fast_config(),
    )
    .await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;
    let (shutdown, handle) = ctx.start();

    ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_job(job.id, |j| j.status == JobStatus::Failed).await;

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();

    let job = ctx.scheduler.get_job(job.id).await.unwrap();
    assert_eq!(ctx.handler.calls(), 2);
    assert_eq!(job.total_runs, 2);
    assert_eq!(job.failed_runs, 2);
    assert_eq!(ctx.scheduler.queue().stats().await.unwrap().failed, 1);

    // The dedupe key is released once the run failed for good
    tokio_test::assert_ok!(ctx.scheduler.run_now(job.id).await);
}

#[tokio::test]
async fn test_held_job_lock_defers_run() {
    let ctx = create_test_context().await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;
    let lease = ctx
        .locks
        .acquire(ResourceType::Job, &job.id.to_string(), Duration::from_secs(30))
        .await
        .unwrap();
    let (shutdown, handle) = ctx.start();

    ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_queue(|s| s.scheduled == 1).await;

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
    ctx.locks.release(&lease).await.unwrap();

    assert_eq!(ctx.handler.calls(), 0);
    let job = ctx.scheduler.get_job(job.id).await.unwrap();
    assert_eq!(job.total_runs, 0);
    assert_eq!(job.status, JobStatus::Idle);
}

#[tokio::test]
async fn test_handler_timeout_is_recorded() {
    let ctx = create_test_context_with(
        ScriptedHandler {
            stall: Some(Duration::from_secs(30)),
            ..Default::default()
        },
        fast_config().with_job_timeout(Duration::from_millis(100)),
    )
    .await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;
    let (shutdown, handle) = ctx.start();

    ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_job(job.id, |j| j.status == JobStatus::Failed).await;

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();

    let runs = ctx.scheduler.job_runs(job.id, 10).await.unwrap();
    assert!(!runs.is_empty());
    assert!(runs.iter().all(|r| r.status == JobRunStatus::Timeout));
}

#[tokio::test]
async fn test_worker_that_loses_its_lease_stops_and_leaves_item() {
    let ctx = create_test_context_with(
        ScriptedHandler {
            stall: Some(Duration::from_secs(30)),
            ..Default::default()
        },
        fast_config()
            .with_workers(1)
            .with_lease(Duration::from_millis(90)),
    )
    .await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;
    let (shutdown, handle) = ctx.start();

    let item = ctx.scheduler.run_now(job.id).await.unwrap();
    wait_until(|| ctx.handler.calls() == 1).await;

    // Another worker takes the item over, as after lease recovery
    let queue = ctx.scheduler.queue();
    let owner = queue.get(item.id).await.unwrap().locked_by.unwrap();
    let member = item.id.to_string();
    ctx.locks
        .release_owned(ResourceType::QueueItem, &member, &owner)
        .await
        .unwrap();
    ctx.locks
        .acquire_as(ResourceType::QueueItem, &member, "other-node", Duration::from_secs(30))
        .await
        .unwrap();

    let mut finished = false;
    for _ in 0..WAIT_ROUNDS {
        let runs = ctx.scheduler.job_runs(job.id, 10).await.unwrap();
        if runs.iter().any(|r| r.status == JobRunStatus::Failed) {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(finished, "stale run was not stopped");

    // The item stays with its new holder, untouched
    let stored = queue.get(item.id).await.unwrap();
    assert_eq!(stored.status, QueuedJobStatus::Processing);
    assert_eq!(stored.retry_count, 0);
    assert!(ctx
        .locks
        .is_locked(ResourceType::QueueItem, &member)
        .await
        .unwrap());
    assert_eq!(ctx.handler.calls(), 1);

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_request_over_pubsub() {
    let ctx = create_test_context().await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;
    let (shutdown, handle) = ctx.start();

    // The subscriber may not be listening yet; duplicates are deduped
    for _ in 0..WAIT_ROUNDS {
        ctx.scheduler
            .publish_run_request(job.id, Some(ctx.user))
            .await
            .unwrap();
        if ctx.handler.calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
    assert!(ctx.handler.calls() >= 1);
}

#[tokio::test]
async fn test_run_request_for_other_user_is_ignored() {
    let ctx = create_test_context().await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;
    let (shutdown, handle) = ctx.start();

    for _ in 0..5 {
        ctx.scheduler
            .publish_run_request(job.id, Some(Uuid::new_v4()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
    assert_eq!(ctx.handler.calls(), 0);
    assert_eq!(ctx.scheduler.queue().stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_cron_timer_triggers_job() {
    let ctx = create_test_context().await;
    let (shutdown, handle) = ctx.start();
    wait_until(|| ctx.scheduler.is_running()).await;

    let job = ctx
        .job(Job::new(ctx.user, "every second", JobKind::BalanceSync).with_cron("* * * * * *"))
        .await;
    assert_eq!(ctx.scheduler.scheduled_jobs().await, vec![job.id]);

    wait_until(|| ctx.handler.calls() > 0).await;

    tokio_test::assert_ok!(ctx.scheduler.delete_job(job.id).await);
    assert!(ctx.scheduler.scheduled_jobs().await.is_empty());

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_deleted_job_is_hidden() {
    let ctx = create_test_context().await;
    let job = ctx.job(Job::new(ctx.user, "sync", JobKind::BalanceSync)).await;

    ctx.scheduler.delete_job(job.id).await.unwrap();

    assert!(matches!(
        ctx.scheduler.get_job(job.id).await,
        Err(SchedulerError::JobNotFound(_))
    ));
    assert!(ctx.scheduler.list_jobs(None).await.unwrap().is_empty());
    assert!(matches!(
        ctx.scheduler.delete_job(job.id).await,
        Err(SchedulerError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_missing_collaborator_has_no_handler() {
    let ctx = create_test_context().await;
    let job = ctx
        .job(Job::new(ctx.user, "write", JobKind::ContentGenerate).with_config(json!({"prompt": "gm"})))
        .await;
    let (shutdown, handle) = ctx.start();

    ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_job(job.id, |j| j.status == JobStatus::Failed).await;

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();

    let runs = ctx.scheduler.job_runs(job.id, 10).await.unwrap();
    assert!(runs[0].message.as_deref().unwrap().contains("content_generate"));
}

#[tokio::test]
async fn test_campaign_job_runs_each_task_for_each_account() {
    let ctx = create_test_context().await;
    let campaign = Uuid::new_v4();
    let accounts = vec![Uuid::new_v4(), Uuid::new_v4()];
    let follow = Task::new(campaign, "Follow dwr", TaskType::Follow, Platform::Farcaster)
        .with_target_account("dwr");
    ctx.engine.store().save_task(&follow).await.unwrap();

    let job = ctx
        .job(
            Job::new(ctx.user, "campaign", JobKind::CampaignTask)
                .with_campaign(campaign)
                .with_accounts(accounts.clone()),
        )
        .await;
    let (shutdown, handle) = ctx.start();

    let queued = ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_job(job.id, |j| j.success_runs == 1).await;

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();

    assert_eq!(ctx.adapter.calls.load(Ordering::SeqCst), 2);
    let summary: RunSummary =
        serde_json::from_value(ctx.scheduler.queue().get(queued.id).await.unwrap().result.unwrap())
            .unwrap();
    assert_eq!(summary.done, 2);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_parallel_campaign_settles_siblings_of_a_failing_account() {
    let ctx = create_test_context().await;
    let campaign = Uuid::new_v4();
    let accounts: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    let follow = Task::new(campaign, "Follow dwr", TaskType::Follow, Platform::Farcaster)
        .with_target_account("dwr");
    ctx.engine.store().save_task(&follow).await.unwrap();

    // One account's execution row is unreadable, which fails the run
    let broken = accounts[1];
    let key = idempotency_key(follow.id, Some(broken), None, Utc::now().date_naive());
    let request = ExecuteRequest::new(follow.id, ctx.user).with_account(broken);
    let row = TaskExecution::pending(&follow, &request, key);
    ctx.engine.store().insert_execution(&row).await.unwrap();
    sqlx::query("UPDATE task_executions SET status = 'MISPLACED' WHERE id = ?")
        .bind(row.id.to_string())
        .execute(ctx.db.pool())
        .await
        .unwrap();

    let job = ctx
        .job(
            Job::new(ctx.user, "bulk", JobKind::BulkExecute)
                .with_campaign(campaign)
                .with_accounts(accounts.clone())
                .with_config(json!({ "max_parallel": 4 })),
        )
        .await;
    let (shutdown, handle) = ctx.start();

    ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_job(job.id, |j| j.failed_runs >= 1).await;

    // The healthy accounts finished before the failed run was recorded
    for account in accounts.iter().filter(|a| **a != broken) {
        let key = idempotency_key(follow.id, Some(*account), None, Utc::now().date_naive());
        let execution = ctx.engine.get_by_idempotency_key(&key).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Done);
    }

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
    assert_eq!(ctx.adapter.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_engagement_job_respects_action_budget() {
    let ctx = create_test_context().await;
    let job = ctx
        .job(
            Job::new(ctx.user, "engage", JobKind::Engagement)
                .with_accounts(vec![Uuid::new_v4(), Uuid::new_v4()])
                .with_config(json!({
                    "platform": "farcaster",
                    "targets": [
                        {"action": "like", "post_id": "0xa"},
                        {"action": "follow", "target": "vitalik"}
                    ],
                    "max_actions": 3
                })),
        )
        .await;
    let (shutdown, handle) = ctx.start();

    ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_job(job.id, |j| j.success_runs == 1).await;

    // A second run repeats nothing already performed
    ctx.scheduler.run_now(job.id).await.unwrap();
    ctx.wait_for_job(job.id, |j| j.success_runs == 2).await;

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
    assert_eq!(ctx.adapter.calls.load(Ordering::SeqCst), 4);
}
