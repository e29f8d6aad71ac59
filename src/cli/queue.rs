//! CLI command: `drover queue`

use super::{friendly, QueueCommands};
use crate::server::App;
use anyhow::Result;
use chrono::{Duration, Utc};

/// Run a queue subcommand.
pub async fn run(cmd: QueueCommands, app: App) -> Result<()> {
    let result = match cmd {
        QueueCommands::Stats { json } => stats(&app, json).await,
        QueueCommands::Recover => {
            let recovered = app.queue.recover_expired().await.map_err(friendly)?;
            println!("Recovered {} expired item(s)", recovered);
            Ok(())
        }
        QueueCommands::Purge { days } => {
            let cutoff = Utc::now() - Duration::days(days);
            let purged = app.queue.purge_terminal(cutoff).await.map_err(friendly)?;
            println!("Purged {} finished item(s)", purged);
            Ok(())
        }
    };
    app.audit.shutdown().await;
    result
}

async fn stats(app: &App, json: bool) -> Result<()> {
    let stats = app.queue.stats().await.map_err(friendly)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    println!("  Queue '{}'", app.queue.name());
    println!("  {}", "-".repeat(32));
    println!("  {:<12} {:>8}", "pending", stats.pending);
    println!("  {:<12} {:>8}", "scheduled", stats.scheduled);
    println!("  {:<12} {:>8}", "processing", stats.processing);
    println!("  {:<12} {:>8}", "completed", stats.completed);
    println!("  {:<12} {:>8}", "failed", stats.failed);
    println!();
    Ok(())
}
