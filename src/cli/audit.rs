//! CLI command: `drover audit`
//!
//! `drover audit query`: filtered, paginated entries
//! `drover audit cleanup`: delete entries past retention

use super::{friendly, AuditCommands, AuditQueryArgs};
use crate::server::App;
use anyhow::Result;
use chrono::{Duration, Utc};
use drover_core::audit::{AuditEntry, AuditFilter};

/// Run an audit subcommand.
pub async fn run(cmd: AuditCommands, app: App) -> Result<()> {
    let result = match cmd {
        AuditCommands::Query(args) => query(&app, args).await,
        AuditCommands::Cleanup { days } => {
            let days = days.unwrap_or_else(|| app.audit.retention_days());
            let deleted = app.audit.cleanup(days).await.map_err(friendly)?;
            println!("Deleted {} entries older than {} days", deleted, days);
            Ok(())
        }
    };
    app.audit.shutdown().await;
    result
}

fn build_filter(args: &AuditQueryArgs) -> Result<AuditFilter> {
    Ok(AuditFilter {
        user_id: args.user,
        wallet_id: args.wallet,
        account_id: args.account,
        task_execution_id: args.execution,
        job_id: args.job,
        action: args.action.as_deref().map(str::parse).transpose().map_err(friendly)?,
        platform: args.platform.as_deref().map(str::parse).transpose().map_err(friendly)?,
        result: args.result.as_deref().map(str::parse).transpose().map_err(friendly)?,
        since: args.hours.map(|h| Utc::now() - Duration::hours(h)),
        until: None,
    })
}

async fn query(app: &App, args: AuditQueryArgs) -> Result<()> {
    let filter = build_filter(&args)?;
    let (entries, total) = app
        .audit
        .query(&filter, Some(args.limit), args.offset)
        .await
        .map_err(friendly)?;

    if args.json {
        let body = serde_json::json!({ "total": total, "entries": entries });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!();
    println!("  {} of {} entries", entries.len(), total);
    println!("  {}", "-".repeat(96));
    for entry in &entries {
        println!("  {}", format_entry(entry));
    }
    println!();
    Ok(())
}

fn format_entry(entry: &AuditEntry) -> String {
    let mut line = format!(
        "{}  {:<18} {:<8} {:<10} {:>6}ms",
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.action.as_str(),
        entry.result.as_str(),
        entry.platform.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        entry.duration_ms,
    );
    if let Some(error) = &entry.error_message {
        line.push_str("  ");
        line.push_str(error);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::audit::{AuditAction, AuditResult};
    use drover_core::platform::Platform;

    fn args() -> AuditQueryArgs {
        AuditQueryArgs {
            user: None,
            wallet: None,
            account: None,
            execution: None,
            job: None,
            action: None,
            platform: None,
            result: None,
            hours: None,
            limit: 50,
            offset: 0,
            json: false,
        }
    }

    #[test]
    fn test_filter_parses_enums() {
        let mut a = args();
        a.action = Some(AuditAction::TaskComplete.as_str().to_string());
        a.platform = Some("farcaster".to_string());
        a.result = Some("failed".to_string());
        a.hours = Some(2);

        let filter = build_filter(&a).unwrap();
        assert_eq!(filter.action, Some(AuditAction::TaskComplete));
        assert_eq!(filter.platform, Some(Platform::Farcaster));
        assert_eq!(filter.result, Some(AuditResult::Failed));
        assert!(filter.since.is_some());
    }

    #[test]
    fn test_filter_rejects_unknown_action() {
        let mut a = args();
        a.action = Some("teleport".to_string());
        assert!(build_filter(&a).is_err());
    }
}
