//! Drover - job scheduling and campaign task execution
//!
//! CLI entry point for the Drover server.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod server;

use server::{LogFormat, LoggingSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = server::load_config()?;
    let _guard = init_tracing(&config.logging);

    let cli = cli::Cli::parse();
    cli::run(cli, config).await
}

/// Console output plus an optional daily rolling file.
///
/// The returned guard flushes the file writer on drop and must outlive `main`.
fn init_tracing(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "drover=info,drover_core=info".into());

    let (file_writer, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "drover.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let json = settings.format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(filter)
        .with((!json).then(fmt::layer))
        .with(json.then(|| fmt::layer().json()))
        .with(file_writer.map(|writer| fmt::layer().json().with_ansi(false).with_writer(writer)))
        .init();

    guard
}
