//! medprofile: Patient medication profiles from the command line.
//!
//! Main entry point. Reads configuration from the environment, opens the
//! configured backend and prints the result of one command as JSON.

mod cli;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use medprofile::adapters::sanitize::SanitizingMakeWriter;
use medprofile::adapters::{RestTables, SqliteTables};
use medprofile::config::{Backend, Config, LogConfig};

/// Install the tracing subscriber; the guard must outlive the program.
fn init_logging(log: &LogConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    // stdout carries the JSON result, so interactive runs log to a file
    // and pipelines (`docker logs`, CI) log to stderr.
    let interactive = std::io::stdout().is_terminal();

    let (writer, guard) = if log.use_file(interactive) {
        if let Some(parent) = log.file.parent() {
            // Best-effort: don't fail startup just because the directory is missing.
            let _ = std::fs::create_dir_all(parent);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.file)?;
        tracing_appender::non_blocking(file)
    } else {
        tracing_appender::non_blocking(std::io::stderr())
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(SanitizingMakeWriter::new(writer)))
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_logging(&config.log)?;
    config.log_warnings();

    tracing::debug!(backend = ?config.backend, "Starting medprofile");

    let output = match &config.backend {
        Backend::Sqlite { path } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tables = Arc::new(SqliteTables::new(path)?);
            cli::run(tables, cli.command, &config).await?
        }
        Backend::Rest { url, api_key } => {
            let tables = Arc::new(RestTables::new(url.as_str(), api_key.as_str())?);
            cli::run(tables, cli.command, &config).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
