use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use futures::stream::{self, StreamExt};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pubsync_cli::{Command, Config, OutputFormat};
use pubsync_client::HttpPageFetcher;
use pubsync_core::config::keys;
use pubsync_core::{
    load_sources_config, BatchSyncSummary, DbConfig, HttpConfig, MemoryRunLock, MemoryStore,
    ObjectStore, RunLock, SourceEntry, SyncConfig, SyncError, SyncRunOrchestrator, SyncRunReport,
};
use pubsync_db::{PgObjectStore, PgRunLock};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenv().ok();

    let config = Config::parse();

    if let Err(e) = init_logging(config.verbose) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        match e.downcast_ref::<SyncError>() {
            Some(sync_error) => eprintln!("Error: {}", sync_error.user_message()),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

/// Logs go to stderr to keep stdout clean for reports.
fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install the log subscriber")
}

async fn run(config: Config) -> anyhow::Result<()> {
    match config.command {
        Command::Sync {
            ref source,
            concurrency,
            dry_run,
            format,
        } => {
            sync(&config, source.as_deref(), concurrency, dry_run, format).await
        }
        Command::Sources => list_sources(config.config.as_deref()),
        Command::Stats => {
            let store = PgObjectStore::new(connect(&config).await?);
            show_stats(&store).await
        }
        Command::Migrate => {
            let store = PgObjectStore::new(connect(&config).await?);
            store.migrate().await?;
            info!("Migrations applied");
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set (use --database-url or a .env file)")?;

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(DbConfig::default().max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")?;
    Ok(pool)
}

/// Synchronize one or all enabled sources
async fn sync(
    config: &Config,
    source: Option<&str>,
    concurrency: usize,
    dry_run: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let sources = load_sources_config(config.config.as_deref())?;

    let entries: Vec<&SourceEntry> = match source {
        Some(name) => vec![sources
            .find_source(name)
            .with_context(|| format!("Source `{}` is not declared in the sources file", name))?],
        None => sources.enabled_sources().collect(),
    };

    if entries.is_empty() {
        warn!("No enabled sources found in the sources file");
        return Ok(());
    }

    let (store, lock): (Arc<dyn ObjectStore>, Arc<dyn RunLock>) = if dry_run {
        info!("Dry run: using an in-memory store");
        (Arc::new(MemoryStore::new()), Arc::new(MemoryRunLock::new()))
    } else {
        let pool = connect(config).await?;
        (
            Arc::new(PgObjectStore::new(pool.clone())),
            Arc::new(PgRunLock::new(pool, SyncConfig::default().lock_ttl)),
        )
    };

    let fetcher = Arc::new(HttpPageFetcher::new(HttpConfig::default())?);
    let orchestrator = SyncRunOrchestrator::from_sources_config(&sources, fetcher, store, lock);

    info!(
        "Synchronizing {} source(s), {} at a time",
        entries.len(),
        concurrency.max(1)
    );

    let reports: Vec<SyncRunReport> = stream::iter(entries)
        .map(|entry| {
            let orchestrator = orchestrator.clone();
            let run_config = entry.to_configuration();
            async move { orchestrator.run(&run_config).await }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut summary = BatchSyncSummary::new();
    for report in reports {
        print_report(&report, format)?;
        summary.add(report);
    }

    if format == OutputFormat::Text {
        print_summary(&summary);
    }

    if summary.failed_count() > 0 {
        anyhow::bail!(
            "{} of {} run(s) failed",
            summary.failed_count(),
            summary.reports.len()
        );
    }
    Ok(())
}

fn print_report(report: &SyncRunReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(report)?);
        }
        OutputFormat::Text => {
            let stats = &report.result.stats;
            let status = if report.success { "ok" } else { "FAILED" };
            println!(
                "{} [{}] fetched {} | created {} | updated {} | unchanged {} | skipped {} | failed {} | deleted {} ({:.1}s)",
                report.partition,
                status,
                report.result.fetched,
                stats.created,
                stats.updated,
                stats.unchanged,
                stats.skipped,
                stats.failed,
                stats.deleted,
                report.elapsed.as_secs_f64()
            );
            if let Some(state) = report.failure_state() {
                println!("   state: {}", state);
            }
            if let Some(error) = &report.error {
                println!("   error: {}", error);
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &BatchSyncSummary) {
    println!();
    println!("Sync summary");
    println!("  Runs:          {}", summary.reports.len());
    println!("  Successful:    {}", summary.successful_count());
    println!("  Failed:        {}", summary.failed_count());
    println!("  Synchronized:  {}", summary.total_synced());
    println!("  Deleted:       {}", summary.total_deleted());
    println!();
}

/// List sources from the sources file, flagging incomplete ones
fn list_sources(path: Option<&Path>) -> anyhow::Result<()> {
    let sources = load_sources_config(path)?;

    if sources.sources.is_empty() {
        println!("No sources declared.");
        return Ok(());
    }

    println!();
    for entry in &sources.sources {
        let run_config = entry.to_configuration();
        let enabled = if entry.enabled { "enabled" } else { "disabled" };
        println!("{} ({})", entry.name, enabled);
        println!("  schema:    {}", entry.schema);
        println!("  mapping:   {}", entry.mapping);
        if let Some(category) = &entry.category {
            println!("  category:  {}", category);
        }
        println!("  base url:  {}", entry.connection.base_url);
        match run_config.endpoint() {
            Ok(endpoint) => println!("  endpoint:  {}", endpoint),
            Err(_) => println!("  endpoint:  (missing {})", keys::SOURCE_ENDPOINT),
        }
        if let Err(e) = run_config.check_required() {
            println!("  problem:   {}", e);
        }
        println!();
    }

    Ok(())
}

/// Show store statistics
async fn show_stats(store: &PgObjectStore) -> anyhow::Result<()> {
    let stats = store.get_stats().await?;
    let partitions = store.partition_counts().await?;

    println!("\nStore Statistics\n");
    println!("  Canonical objects:     {}", stats.total_objects);
    println!("  Sync records:          {}", stats.total_records);
    println!("  Attachments:           {}", stats.total_attachments);
    println!("  Sources:               {}", stats.total_sources);
    if let Some(last_sync) = stats.last_sync {
        println!("  Last sync:             {}", last_sync);
    }

    if !partitions.is_empty() {
        println!("\n  Per source:");
        for p in partitions {
            println!("    {}/{}: {} object(s)", p.source_ref, p.schema_ref, p.objects);
        }
    }
    println!();

    Ok(())
}
