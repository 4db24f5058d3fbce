//! Shelf Mirror maintenance tool
//!
//! Opens the offline store described by the configuration and runs one maintenance command.

use shelf_mirror::core::config::{CliArgs, Command, Config};
use shelf_mirror::core::{Logger, OfflineStore};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration (CLI args, env vars and config file)
    let config = match Config::load(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting Shelf Mirror v{}", env!("CARGO_PKG_VERSION"));
    info!(path = ?config.database.path, "Database configuration");

    let store = OfflineStore::open_detached(&config.database, &config.offline)
        .context("Failed to open offline store")?;

    match args.command {
        Command::Summary { instance } => {
            store.instance(&instance).await?;
            let summary = store.download_queue_summary(&instance).await?;
            let queue = store.pending_downloads(&instance, Some(20)).await?;
            let outbox = store.pending_progress_count(Some(&instance)).await?;
            print_json(&serde_json::json!({
                "instance": instance,
                "queue": summary,
                "next": queue.iter().map(|s| &s.book_id).collect::<Vec<_>>(),
                "pendingProgress": outbox,
            }))?;
        }
        Command::Repair { instance } => {
            store.instance(&instance).await?;
            let report = store.repair(&instance).await?;
            info!(instance_id = %instance, series = report.series, read_lists = report.read_lists, "Repair finished");
            print_json(&report)?;
        }
        Command::Outbox { instance, limit } => {
            let entries = store.drain_pending_progress(instance.as_deref(), limit).await?;
            print_json(&entries)?;
        }
        Command::Purge { instance } => {
            let registered = store.instance(&instance).await?;
            info!(instance_id = %registered.id, server_url = %registered.server_url, "Purging instance");
            let removed = store.purge_instance(&instance).await?;
            print_json(&serde_json::json!({ "instance": instance, "removed": removed }))?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
