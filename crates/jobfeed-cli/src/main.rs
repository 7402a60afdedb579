use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jobfeed_storage::{MemoryJobStore, PgJobStore};
use jobfeed_sync::{CycleReport, IngestionOrchestrator, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobfeed-cli")]
#[command(about = "Job feed ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle over every active feed.
    Sync {
        /// Write into an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the liveness route and run scheduled cycles when enabled.
    Serve,
}

fn print_summary(report: &CycleReport) {
    println!(
        "sync complete: cycle_id={} feeds={} completed={} failed={} unmapped={}",
        report.cycle_id,
        report.outcomes.len(),
        report.completed(),
        report.failed(),
        report.unmapped.len()
    );
    for outcome in &report.outcomes {
        println!(
            "  {} {} status={:?} seen={} inserted={} updated={} failed={} skipped={}{}",
            outcome.client_id,
            outcome.feed_url,
            outcome.status,
            outcome.seen,
            outcome.inserted,
            outcome.updated,
            outcome.failed,
            outcome.skipped,
            outcome
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let report = if dry_run {
                let config = SyncConfig::from_env();
                let store = Arc::new(MemoryJobStore::new());
                let orchestrator = IngestionOrchestrator::from_config(&config, store.clone())?;
                let report = orchestrator.run_cycle().await?;
                println!("dry run: {} rows held in memory", store.row_count());
                report
            } else {
                jobfeed_sync::run_cycle_from_env().await?
            };
            print_summary(&report);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgJobStore::connect(&config.database_url, 1).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            jobfeed_web::serve_from_env().await?;
        }
    }

    Ok(())
}
