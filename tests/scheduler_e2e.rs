//! End-to-end scheduling over the public drover-core API
//!
//! Two scheduler instances share one keyspace and one database, the way two
//! `drover serve` processes share Redis and SQLite.

use async_trait::async_trait;
use drover_core::audit::AuditFilter;
use drover_core::execution::{ExecutionFilter, Proof, ProofType};
use drover_core::platform::PlatformResult;
use drover_core::{
    AdapterRegistry, AuditConfig, AuditLogger, AuditStore, Database, EngineConfig, EngineEvent,
    EventBus, ExecutionStatus, HandlerDeps, HandlerRegistry, Job, JobKind, JobQueue, JobStore,
    KeyspaceStore, LockManager, MemoryKeyspace, Platform, PlatformAdapter, QueueConfig,
    RateLimiter, Scheduler, SchedulerConfig, ShutdownController, Task, TaskExecutionEngine,
    TaskStore, TaskType,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;
use uuid::Uuid;

#[derive(Default)]
struct FollowAdapter {
    follows: AtomicUsize,
}

#[async_trait]
impl PlatformAdapter for FollowAdapter {
    fn platform(&self) -> Platform {
        Platform::Farcaster
    }

    async fn follow(&self, _account_id: Uuid, target_user: &str) -> PlatformResult<Proof> {
        self.follows.fetch_add(1, Ordering::SeqCst);
        Ok(Proof::new(ProofType::ApiResponse, format!("followed {}", target_user)))
    }
}

struct Node {
    scheduler: Scheduler,
    engine: TaskExecutionEngine,
    audit: AuditLogger,
}

fn build_node(
    db: &Database,
    keyspace: Arc<dyn KeyspaceStore>,
    adapter: Arc<FollowAdapter>,
    events: EventBus,
) -> Node {
    let locks = LockManager::new(keyspace.clone());
    let audit = AuditLogger::start(AuditStore::new(db.pool().clone()), AuditConfig::default());
    let adapters = AdapterRegistry::new().with_adapter(adapter);
    let engine = TaskExecutionEngine::new(
        TaskStore::new(db.pool().clone()),
        locks.clone(),
        RateLimiter::new(keyspace.clone()),
        audit.clone(),
        adapters.clone(),
    )
    .with_events(events.clone())
    .with_config(
        EngineConfig::default()
            .with_locks(Duration::from_secs(30), Duration::from_millis(100))
            .with_retry_backoff(Duration::ZERO, Duration::ZERO),
    );
    let queue = JobQueue::new(
        keyspace.clone(),
        locks.clone(),
        QueueConfig::new("e2e").with_backoff(Duration::ZERO, Duration::ZERO),
    );
    let handlers = HandlerRegistry::standard(HandlerDeps {
        engine: engine.clone(),
        locks: locks.clone(),
        adapters,
        wallets: None,
        content: None,
        lock_ttl: Duration::from_secs(30),
        bulk_max_parallel: 2,
    });
    let scheduler = Scheduler::new(
        JobStore::new(db.pool().clone()),
        queue,
        locks,
        keyspace,
        handlers,
        SchedulerConfig::new()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(10))
            .with_check_interval(Duration::from_secs(3600))
            .with_contention_delay(Duration::from_millis(50)),
    )
    .with_events(events);

    Node { scheduler, engine, audit }
}

async fn wait_for_success(scheduler: &Scheduler, id: Uuid, runs: i64) -> Job {
    for _ in 0..250 {
        let job = scheduler.get_job(id).await.unwrap();
        if job.success_runs >= runs {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not reach {} successful runs", id, runs);
}

#[tokio::test]
async fn test_campaign_job_across_two_nodes() {
    let dir = TempDir::new().unwrap();
    let db = Database::from_path(&dir.path().join("drover.db")).await.unwrap();
    let keyspace: Arc<dyn KeyspaceStore> = Arc::new(MemoryKeyspace::new());
    let adapter = Arc::new(FollowAdapter::default());
    let events = EventBus::new(64);
    let mut rx = events.subscribe();

    let a = build_node(&db, keyspace.clone(), adapter.clone(), events.clone());
    let b = build_node(&db, keyspace.clone(), adapter.clone(), events.clone());

    let user = Uuid::new_v4();
    let campaign = Uuid::new_v4();
    let accounts = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let task = Task::new(campaign, "Follow dwr", TaskType::Follow, Platform::Farcaster)
        .with_target_account("dwr");
    a.engine.store().save_task(&task).await.unwrap();

    let job = a
        .scheduler
        .create_job(
            Job::new(user, "follow campaign", JobKind::BulkExecute)
                .with_campaign(campaign)
                .with_accounts(accounts.clone()),
        )
        .await
        .unwrap();

    // The job is stored once and visible from either node
    assert_eq!(b.scheduler.get_job(job.id).await.unwrap().name, "follow campaign");

    // Both nodes request the run; the shared dedupe key admits one
    assert_ok!(a.scheduler.run_now(job.id).await);
    assert!(b.scheduler.run_now(job.id).await.is_err());

    let shutdown_a = ShutdownController::with_timeout(Duration::from_secs(5));
    let shutdown_b = ShutdownController::with_timeout(Duration::from_secs(5));
    let run_a = tokio::spawn({
        let (scheduler, shutdown) = (a.scheduler.clone(), shutdown_a.clone());
        async move { scheduler.run(shutdown).await }
    });
    let run_b = tokio::spawn({
        let (scheduler, shutdown) = (b.scheduler.clone(), shutdown_b.clone());
        async move { scheduler.run(shutdown).await }
    });

    let finished = wait_for_success(&a.scheduler, job.id, 1).await;
    assert_eq!(finished.total_runs, 1);
    assert_eq!(adapter.follows.load(Ordering::SeqCst), 3);

    // A second run finds every execution done and performs nothing new
    assert_ok!(b.scheduler.run_now(job.id).await);
    wait_for_success(&b.scheduler, job.id, 2).await;
    assert_eq!(adapter.follows.load(Ordering::SeqCst), 3);

    shutdown_a.shutdown().await;
    shutdown_b.shutdown().await;
    assert_ok!(run_a.await.unwrap());
    assert_ok!(run_b.await.unwrap());

    let (executions, total) = a
        .engine
        .list_executions(
            &ExecutionFilter {
                user_id: Some(user),
                ..ExecutionFilter::default()
            },
            None,
            0,
        )
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Done));

    a.audit.flush().await;
    b.audit.flush().await;
    let (entries, _) = a.audit.query(&AuditFilter::for_user(user), None, 0).await.unwrap();
    assert!(!entries.is_empty());

    let mut completed = 0;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::JobCompleted { job_id, success, .. } = event {
            assert_eq!(job_id, job.id);
            assert!(success);
            completed += 1;
        }
    }
    assert_eq!(completed, 2);
}
