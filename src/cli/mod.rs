//! CLI module for Drover
//!
//! Provides commands:
//! - `serve`: run the scheduler and workers until interrupted
//! - `jobs`: create, inspect and trigger scheduled jobs
//! - `queue`: queue statistics and maintenance
//! - `audit`: query and prune the audit trail

use crate::server::{App, AppConfig};
use clap::{Args, Parser, Subcommand};
use drover_core::{format_error_for_cli, Error};
use uuid::Uuid;

pub mod audit;
pub mod jobs;
pub mod queue;

/// Drover job scheduler
#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Job scheduling and campaign task execution")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scheduler and worker pool
    Serve,
    /// Manage scheduled jobs
    #[command(subcommand)]
    Jobs(JobCommands),
    /// Inspect the job queue
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Query the audit trail
    #[command(subcommand)]
    Audit(AuditCommands),
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// List jobs
    List {
        /// Only this user's jobs
        #[arg(long)]
        user: Option<Uuid>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a job
    Create(CreateJobArgs),
    /// Show one job and its recent runs
    Show {
        id: Uuid,
        /// Number of runs to show
        #[arg(long, default_value_t = 10)]
        runs: i64,
    },
    /// Run a job as soon as a worker is free
    Run {
        id: Uuid,
        /// Send the request to running servers over the keyspace channel
        #[arg(long)]
        publish: bool,
        /// Requesting user; the request is ignored if it does not own the job
        #[arg(long)]
        user: Option<Uuid>,
    },
    /// Stop scheduling a job
    Pause { id: Uuid },
    /// Resume a paused job
    Resume { id: Uuid },
    /// Delete a job
    Delete { id: Uuid },
}

#[derive(Args, Debug)]
pub struct CreateJobArgs {
    /// Owning user
    #[arg(long)]
    pub user: Uuid,
    /// Display name
    #[arg(long)]
    pub name: String,
    /// Job kind (campaign_task, bulk_execute, scheduled_post, engagement,
    /// balance_sync, platform_sync, content_generate)
    #[arg(long)]
    pub kind: String,
    /// Cron expression, five or six fields
    #[arg(long)]
    pub cron: Option<String>,
    /// One-shot run time (RFC 3339)
    #[arg(long, conflicts_with = "cron")]
    pub at: Option<chrono::DateTime<chrono::Utc>>,
    /// Handler configuration as JSON
    #[arg(long)]
    pub config: Option<String>,
    /// Target wallets
    #[arg(long = "wallet")]
    pub wallets: Vec<Uuid>,
    /// Target accounts
    #[arg(long = "account")]
    pub accounts: Vec<Uuid>,
    /// Campaign whose tasks the job executes
    #[arg(long)]
    pub campaign: Option<Uuid>,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Show queue counts
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Requeue items whose worker lease expired
    Recover,
    /// Drop finished records older than the given number of days
    Purge {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuditCommands {
    /// Query entries, newest first
    Query(AuditQueryArgs),
    /// Delete entries past retention
    Cleanup {
        /// Retention in days (defaults to audit.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Args, Debug)]
pub struct AuditQueryArgs {
    #[arg(long)]
    pub user: Option<Uuid>,
    #[arg(long)]
    pub wallet: Option<Uuid>,
    #[arg(long)]
    pub account: Option<Uuid>,
    #[arg(long)]
    pub execution: Option<Uuid>,
    #[arg(long)]
    pub job: Option<Uuid>,
    /// Action name, e.g. task_complete
    #[arg(long)]
    pub action: Option<String>,
    #[arg(long)]
    pub platform: Option<String>,
    /// success, failed, pending or skipped
    #[arg(long)]
    pub result: Option<String>,
    /// Only entries from the last N hours
    #[arg(long)]
    pub hours: Option<i64>,
    #[arg(long, default_value_t = 50)]
    pub limit: i64,
    #[arg(long, default_value_t = 0)]
    pub offset: i64,
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Serve) => {
            let app = App::build(config).await?;
            crate::server::run(app).await
        }
        Some(Commands::Jobs(cmd)) => jobs::run(cmd, App::build(config).await?).await,
        Some(Commands::Queue(cmd)) => queue::run(cmd, App::build(config).await?).await,
        Some(Commands::Audit(cmd)) => audit::run(cmd, App::build(config).await?).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Render a core error the way users should read it
pub(crate) fn friendly(error: impl Into<Error>) -> anyhow::Error {
    anyhow::anyhow!(format_error_for_cli(&error.into()))
}
