use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crmsync_core::EntityKind;
use crmsync_storage::MemoryStore;
use crmsync_sync::{maybe_build_scheduler, SyncConfig, SyncService};
use crmsync_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crmsync")]
#[command(about = "Mirror CRM reference data into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the sync jobs once; exits with status 1 if any job failed.
    Sync {
        /// Restrict the run to these entities (comma separated).
        #[arg(long, value_delimiter = ',')]
        only: Vec<EntityKind>,
        /// Write to an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve the HTTP trigger, with the cron scheduler when enabled.
    Serve {
        #[arg(long, env = "PORT", default_value_t = 5000)]
        port: u16,
    },
}

fn init_tracing() {
    let fallback = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        only: Vec::new(),
        dry_run: false,
    }) {
        Commands::Sync { only, dry_run } => {
            let service = if dry_run {
                SyncService::with_store(&config, Arc::new(MemoryStore::new()))?
            } else {
                SyncService::from_config(&config)?
            }
            .only(only);

            let report = service.run_once().await;
            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(result) => println!(
                        "{}: processed={} unchanged={} skipped={} children={} child_skipped={}",
                        outcome.entity,
                        result.processed_count,
                        result.unchanged_count,
                        result.error_count,
                        result.children_processed,
                        result.children_errors
                    ),
                    Err(failure) => eprintln!("{failure}"),
                }
            }

            if report.is_success() {
                println!("sync complete: run_id={}", report.run_id);
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("sync failed: run_id={}", report.run_id);
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Serve { port } => {
            let service = Arc::new(SyncService::from_config(&config)?);
            let scheduler = maybe_build_scheduler(&config, Arc::clone(&service)).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "sync scheduler started");
            }
            crmsync_web::serve(AppState::new(service), port).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
