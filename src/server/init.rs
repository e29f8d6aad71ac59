//! Server initialization and main run loop
//!
//! [`App::build`] wires every component from the loaded configuration;
//! [`run`] starts the scheduler and waits for a shutdown signal.

use super::config::{policy_table, AppConfig, KeyspaceBackend};
use anyhow::{Context, Result};
use drover_core::{
    wait_for_shutdown_signal, AdapterRegistry, AuditLogger, AuditStore, Database, EventBus,
    HandlerDeps, HandlerRegistry, JobQueue, JobStore, KeyspaceStore, LockManager, MemoryKeyspace,
    RateLimiter, RedisKeyspace, Scheduler, ShutdownController, TaskExecutionEngine, TaskStore,
};
use drover_core::platform::TwitterAdapter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Wired components shared by the server and the CLI commands
pub struct App {
    pub config: AppConfig,
    pub audit: AuditLogger,
    pub queue: JobQueue,
    pub scheduler: Scheduler,
}

impl App {
    /// Build every component from `config`
    pub async fn build(config: AppConfig) -> Result<Self> {
        let keyspace = init_keyspace(&config).await;

        let db = Database::from_path(&config.database.path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path.display()))?;
        info!(path = %config.database.path.display(), "Database initialized");

        let events = EventBus::default();
        let locks = LockManager::new(keyspace.clone());
        let limiter = RateLimiter::new(keyspace.clone()).with_policies(policy_table(&config.rate_limits));

        let audit = AuditLogger::start(AuditStore::new(db.pool().clone()), config.audit.to_audit_config());
        info!(
            batch_size = config.audit.batch_size,
            retention_days = config.audit.retention_days,
            "Audit logger started"
        );

        let adapters = AdapterRegistry::new().with_adapter(Arc::new(TwitterAdapter::new()));
        let engine = TaskExecutionEngine::new(
            TaskStore::new(db.pool().clone()),
            locks.clone(),
            limiter,
            audit.clone(),
            adapters.clone(),
        )
        .with_events(events.clone())
        .with_config(config.engine.to_engine_config());

        let queue = JobQueue::new(keyspace.clone(), locks.clone(), config.queue.to_queue_config());

        let handlers = HandlerRegistry::standard(HandlerDeps {
            engine,
            locks: locks.clone(),
            adapters,
            wallets: None,
            content: None,
            lock_ttl: Duration::from_secs(config.engine.lock_ttl_secs),
            bulk_max_parallel: config.engine.bulk_max_parallel,
        });
        info!(kinds = ?handlers.kinds(), "Job handlers registered");

        let lease = Duration::from_secs(config.queue.lease_secs);
        let scheduler = Scheduler::new(
            JobStore::new(db.pool().clone()),
            queue.clone(),
            locks,
            keyspace,
            handlers,
            config.scheduler.to_scheduler_config(lease),
        )
        .with_events(events);

        Ok(Self {
            config,
            audit,
            queue,
            scheduler,
        })
    }
}

async fn init_keyspace(config: &AppConfig) -> Arc<dyn KeyspaceStore> {
    let namespace = config.keyspace.namespace.clone();
    let memory = || -> Arc<dyn KeyspaceStore> {
        match &namespace {
            Some(ns) => Arc::new(MemoryKeyspace::with_namespace(ns.clone())),
            None => Arc::new(MemoryKeyspace::new()),
        }
    };

    if config.keyspace.backend == KeyspaceBackend::Memory {
        info!("In-memory keyspace initialized");
        return memory();
    }

    let redis = RedisKeyspace::new(&config.keyspace.url).map(|store| match &namespace {
        Some(ns) => store.with_namespace(ns.clone()),
        None => store,
    });
    match redis {
        Ok(store) => match store.ping().await {
            Ok(()) => {
                info!("Redis keyspace initialized");
                Arc::new(store)
            }
            Err(e) => {
                warn!("Redis unreachable, using in-memory keyspace: {}", e);
                memory()
            }
        },
        Err(e) => {
            warn!("Redis unavailable, using in-memory keyspace: {}", e);
            memory()
        }
    }
}

/// Run the server until a shutdown signal arrives
pub async fn run(app: App) -> Result<()> {
    info!("Starting Drover v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownController::with_timeout(Duration::from_secs(app.config.shutdown_timeout_secs));
    info!(
        "Shutdown controller initialized (timeout: {}s)",
        app.config.shutdown_timeout_secs
    );

    let scheduler_task = if app.config.scheduler.enabled {
        let scheduler = app.scheduler.clone();
        let controller = shutdown.clone();
        Some(tokio::spawn(async move { scheduler.run(controller).await }))
    } else {
        warn!("Scheduler disabled; serving audit and queue only");
        None
    };

    let retention_task = spawn_retention_task(app.audit.clone(), shutdown.clone());

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    if !shutdown.shutdown().await {
        warn!("Some job runs were still in flight at shutdown");
    }

    if let Some(task) = scheduler_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Scheduler stopped with error: {}", e),
            Err(e) => error!("Scheduler task panicked: {}", e),
        }
    }
    let _ = retention_task.await;

    app.audit.shutdown().await;
    info!("Drover stopped");
    Ok(())
}

/// Daily cleanup of audit entries past retention
fn spawn_retention_task(
    audit: AuditLogger,
    shutdown: Arc<ShutdownController>,
) -> tokio::task::JoinHandle<()> {
    let token = shutdown.token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    match audit.cleanup(audit.retention_days()).await {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "Audit retention cleanup"),
                        Err(e) => warn!("Audit retention cleanup failed: {}", e),
                    }
                }
            }
        }
    })
}
