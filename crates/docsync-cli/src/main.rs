use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docsync_storage::DocumentStore;
use docsync_sync::{
    build_scheduler, connect_store, run_sync_once, SyncConfig, SyncPipeline, SyncReport,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "docsync")]
#[command(about = "Upsert a remote JSON collection into a document store, keyed by content hash")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Source collection (http(s):// or file:// URL). Overrides DOCSYNC_API_URL.
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Overrides DOCSYNC_DATABASE.
    #[arg(long, global = true)]
    database: Option<String>,

    /// Overrides DOCSYNC_COLLECTION.
    #[arg(long, global = true)]
    collection: Option<String>,

    /// Print the run summary as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// -v for debug, -vv for trace. RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Fetch the collection once and upsert every record (default).
    Sync,
    /// Create the collection table if it is missing.
    Migrate,
    /// Print how many documents the collection holds.
    Status,
    /// Run full syncs on the DOCSYNC_SYNC_CRON schedule until interrupted.
    Schedule,
}

impl Cli {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(api_url) = &self.api_url {
            config.api_url = api_url.clone();
        }
        if let Some(database_url) = &self.database_url {
            config.database_url = database_url.clone();
        }
        if let Some(database) = &self.database {
            config.database = Some(database.clone());
        }
        if let Some(collection) = &self.collection {
            config.collection = collection.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config();
    let result = match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => sync(&config, cli.json).await,
        Commands::Migrate => migrate(&config).await,
        Commands::Status => status(&config).await,
        Commands::Schedule => schedule(&config).await,
    };

    exit_code(result)
}

fn exit_code(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Per-record failures are reported, not fatal. A cancelled run left records untouched.
fn run_outcome(report: &SyncReport, fetched: usize) -> Result<()> {
    if report.cancelled {
        bail!(
            "run cancelled with {} of {} records left untouched",
            report.skipped,
            fetched
        );
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("info,sqlx=warn"),
            1 => EnvFilter::new("debug,sqlx=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; no further upserts will start");
            cancel.cancel();
        }
    });
}

async fn sync(config: &SyncConfig, json: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = run_sync_once(config, &cancel).await.context("sync run failed")?;
    let report = &summary.report;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serializing run summary")?
        );
    } else {
        println!(
            "sync complete: run_id={} source={} fetched={} inserted={} updated={} failed={}",
            summary.run_id, summary.source, summary.fetched, report.inserted, report.updated, report.failed
        );
        if let Some(path) = &summary.report_path {
            println!("report: {path}");
        }
    }

    run_outcome(report, summary.fetched)
}

async fn migrate(config: &SyncConfig) -> Result<()> {
    config.validate()?;
    let store = connect_store(config).await?;
    let result = store.ensure_schema().await;
    store.close().await;
    result.context("creating collection table")?;
    println!("collection {} is ready", config.collection);
    Ok(())
}

async fn status(config: &SyncConfig) -> Result<()> {
    config.validate()?;
    let store = connect_store(config).await?;
    let result = store.count().await;
    store.close().await;
    let count = result.context("counting documents")?;
    println!("collection {} holds {count} documents", config.collection);
    Ok(())
}

async fn schedule(config: &SyncConfig) -> Result<()> {
    config.validate()?;
    let store = Arc::new(connect_store(config).await?);
    let pipeline = Arc::new(SyncPipeline::from_config(config, store.clone())?);
    let cancel = CancellationToken::new();

    let mut sched = build_scheduler(pipeline, config, cancel.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    cancel.cancel();
    sched.shutdown().await.context("stopping scheduler")?;
    store.close().await;
    Ok(())
}
