use clap::{Parser, Subcommand};
use env_logger::Env;
use penfold::config::DbConfig;
use penfold::events::PgEventPublisher;
use penfold::ingest::{BatchProcessor, IngestOptions};
use penfold::storage::postgres::{connect_pool, run_migrations};
use penfold::storage::PgIngestStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "penfold", about = "Bulk email ingest and mention resolution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest an .eml file or a directory tree of them.
    Ingest {
        /// File or directory to ingest.
        path: PathBuf,
        /// Tenant id; "default" maps to the default tenant.
        #[arg(long, default_value = "default")]
        tenant: String,
        /// Parse and count without persisting anything.
        #[arg(long)]
        dry_run: bool,
        /// Worker count for the ingest pool.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Resume an existing job by id.
        #[arg(long)]
        resume: Option<Uuid>,
        /// Labels attached to every ingested email. Repeatable.
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Truncate stored bodies to this many bytes, 0 for unlimited.
        #[arg(long, default_value_t = 0)]
        max_body_size: usize,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Ingest {
            path,
            tenant,
            dry_run,
            concurrency,
            resume,
            labels,
            max_body_size,
        } => {
            let db_config = DbConfig::from_env();
            let pool = connect_pool(&db_config).await?;
            run_migrations(&pool).await?;
            log::info!("connected to {}:{}/{}", db_config.host, db_config.port, db_config.database);

            let store = Arc::new(PgIngestStore::new(pool.clone()));
            let events = Arc::new(PgEventPublisher::new(pool));

            let processor = Arc::new(BatchProcessor::new(
                store,
                events,
                IngestOptions {
                    tenant,
                    concurrency: concurrency.max(1),
                    dry_run,
                    resume_job_id: resume,
                    labels,
                    max_body_size,
                },
            )?);

            let cancel = CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("interrupt received, cancelling ingest");
                    signal_token.cancel();
                }
            });

            let report = processor.process(&path, cancel).await?;

            log::info!(
                "job {} finished: {} total, {} imported, {} skipped, {} failed",
                report.job_id,
                report.total,
                report.imported,
                report.skipped,
                report.failed
            );
            for error in &report.errors {
                log::warn!("  {}: {}", error.file_path, error.message);
            }

            if !report.success {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}
