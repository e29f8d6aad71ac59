//! CLI command: `drover jobs`
//!
//! Jobs are read and written through the same SQLite database and keyspace
//! the server uses, so a job created here is picked up by the next due check.

use super::{friendly, CreateJobArgs, JobCommands};
use crate::server::App;
use anyhow::{Context, Result};
use drover_core::scheduler::{Job, JobKind, JobRun};
use uuid::Uuid;

/// Run a jobs subcommand.
pub async fn run(cmd: JobCommands, app: App) -> Result<()> {
    let result = match cmd {
        JobCommands::List { user, json } => list(&app, user, json).await,
        JobCommands::Create(args) => create(&app, args).await,
        JobCommands::Show { id, runs } => show(&app, id, runs).await,
        JobCommands::Run { id, publish, user } => run_job(&app, id, publish, user).await,
        JobCommands::Pause { id } => {
            app.scheduler.pause_job(id).await.map_err(friendly)?;
            println!("Paused {}", id);
            Ok(())
        }
        JobCommands::Resume { id } => {
            app.scheduler.resume_job(id).await.map_err(friendly)?;
            println!("Resumed {}", id);
            Ok(())
        }
        JobCommands::Delete { id } => {
            app.scheduler.delete_job(id).await.map_err(friendly)?;
            println!("Deleted {}", id);
            Ok(())
        }
    };
    app.audit.shutdown().await;
    result
}

async fn list(app: &App, user: Option<Uuid>, json: bool) -> Result<()> {
    let jobs = app.scheduler.list_jobs(user).await.map_err(friendly)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    println!();
    println!(
        "  {:<36}  {:<16} {:<20} {:<8} {:<20} Runs",
        "ID", "Kind", "Name", "Status", "Next Run"
    );
    println!("  {}", "-".repeat(112));
    if jobs.is_empty() {
        println!("  (no jobs)");
    }
    for job in &jobs {
        println!(
            "  {:<36}  {:<16} {:<20} {:<8} {:<20} {}/{}",
            job.id,
            job.kind.as_str(),
            truncate(&job.name, 20),
            job.status.as_str(),
            job.next_run_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            job.success_runs,
            job.total_runs,
        );
    }
    println!();
    Ok(())
}

async fn create(app: &App, args: CreateJobArgs) -> Result<()> {
    let kind: JobKind = args.kind.parse().map_err(friendly)?;
    let mut job = Job::new(args.user, args.name, kind)
        .with_wallets(args.wallets)
        .with_accounts(args.accounts);

    if let Some(expr) = args.cron {
        job = job.with_cron(expr);
    }
    if let Some(at) = args.at {
        job = job.at(at);
    }
    if let Some(campaign) = args.campaign {
        job = job.with_campaign(campaign);
    }
    if let Some(raw) = args.config {
        let config = serde_json::from_str(&raw).context("--config must be valid JSON")?;
        job = job.with_config(config);
    }

    let job = app.scheduler.create_job(job).await.map_err(friendly)?;
    println!("Created {} ({})", job.id, job.kind);
    if let Some(next) = job.next_run_at {
        println!("Next run: {}", next.to_rfc3339());
    }
    Ok(())
}

async fn show(app: &App, id: Uuid, limit: i64) -> Result<()> {
    let job = app.scheduler.get_job(id).await.map_err(friendly)?;
    let runs = app.scheduler.job_runs(id, limit).await.map_err(friendly)?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    println!();
    println!("  Recent runs");
    println!("  {}", "-".repeat(72));
    if runs.is_empty() {
        println!("  (never run)");
    }
    for run in &runs {
        println!("  {}", format_run(run));
    }
    println!();
    Ok(())
}

async fn run_job(app: &App, id: Uuid, publish: bool, user: Option<Uuid>) -> Result<()> {
    if publish {
        app.scheduler
            .publish_run_request(id, user)
            .await
            .map_err(friendly)?;
        println!("Run request for {} published", id);
        return Ok(());
    }

    let queued = app.scheduler.run_now(id).await.map_err(friendly)?;
    println!("Queued {} as {}", id, queued.id);
    Ok(())
}

fn format_run(run: &JobRun) -> String {
    let duration = run
        .finished_at
        .map(|end| format!("{}ms", (end - run.started_at).num_milliseconds()))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<8} {:>10}  {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.status.as_str(),
        duration,
        run.message.as_deref().unwrap_or("")
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("sync", 20), "sync");
        assert_eq!(truncate("abcdefgh", 5), "abcd…");
    }
}
