use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use rookery::config::Config;
use rookery::feed;
use rookery::storage::{Database, DatabaseError};
use rookery::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "rookery", version, about = "Self-hosted feed aggregator")]
struct Args {
    /// Config file (TOML)
    #[arg(long, value_name = "FILE", default_value = "rookery.toml")]
    config: PathBuf,

    /// Database file, overriding the config file
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Seconds between refreshes (0 = manual only), overriding config and stored settings
    #[arg(long, value_name = "SECS")]
    refresh_interval: Option<u64>,

    /// Number of feeds fetched concurrently
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Import subscriptions from an OPML file
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Refresh every feed once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(workers) = args.workers {
        config.worker_pool_size = workers;
    }

    let db_path = config
        .database_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of rookery appears to be using {}. Please close it and try again.",
                db_path
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    // Precedence: command line, then the stored setting (minutes), then the file
    let settings = db.get_settings().await.context("Failed to load settings")?;
    let interval_secs = args
        .refresh_interval
        .or(settings.refresh_rate.map(|minutes| minutes.saturating_mul(60)))
        .unwrap_or(config.refresh_interval_secs);

    let worker = Worker::new(
        db,
        config.worker_config(Duration::from_secs(interval_secs)),
    )
    .context("Failed to create refresh worker")?;

    if let Some(import_file) = &args.import {
        // SEC-008: Canonicalize to resolve symlinks and reject non-files
        let canonical = import_file
            .canonicalize()
            .with_context(|| format!("Failed to resolve import file: {}", import_file.display()))?;
        if !std::fs::metadata(&canonical)?.is_file() {
            anyhow::bail!("Import path must be a regular file");
        }
        let path = canonical
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in import path"))?;

        let feeds = feed::parse_file(path, config.url_policy())
            .await
            .context("Failed to parse OPML file")?;
        if feeds.is_empty() {
            eprintln!("Warning: No valid feeds found in OPML file");
        }
        let summary = worker
            .import_feeds(&feeds)
            .await
            .context("Failed to import feeds")?;
        println!(
            "Imported {} feeds into {} folders from {}",
            summary.feeds,
            summary.folders,
            canonical.display()
        );
    }

    if args.once {
        let queued = worker.refresh_all().await.context("Failed to start refresh")?;
        worker.wait_idle().await;

        let errors = worker.feed_errors().await?;
        println!("Refreshed {} feeds, {} failing", queued, errors.len());
        let mut failing: Vec<_> = errors.into_iter().collect();
        failing.sort_unstable();
        for (feed_id, error) in failing {
            println!("  feed {}: {}", feed_id, error);
        }
        return Ok(());
    }

    tracing::info!(
        interval_secs,
        workers = config.worker_pool_size,
        "Starting refresh worker"
    );
    worker.refresh_feeds();
    let ticker = worker.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received SIGINT, shutting down gracefully");

    // Soft stop: no new ticks, in-flight fetches finish or time out
    worker.shutdown();
    if let Err(e) = ticker.await {
        tracing::warn!(error = %e, "Ticker task ended abnormally");
    }

    println!("Goodbye!");
    Ok(())
}
