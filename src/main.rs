use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use session_replicator::config::{Config, SourceKind};
use session_replicator::pipeline::{RunMode, RunReport, Scheduler, Stage};
use session_replicator::storage::SqliteDocumentStore;
use session_replicator::{fixtures, logging, metrics};

#[derive(Parser)]
#[command(name = "session_replicator")]
#[command(about = "Replicates user session documents into a relational warehouse")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "replicator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once
    Run {
        /// Stream records in chunks instead of handing whole batches between stages
        #[arg(long)]
        streaming: bool,
    },
    /// Run the pipeline on the configured schedule until interrupted
    Schedule {
        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<usize>,
    },
    /// Run a single stage against the hand-off data of an earlier run
    Stage {
        /// extract, transform or load
        stage: Stage,
        /// Run whose hand-off data to read and write
        #[arg(long)]
        run_id: String,
    },
    /// Fill the source collection with generated sessions
    Seed {
        #[arg(long, default_value_t = fixtures::DEFAULT_SEED_COUNT)]
        count: usize,
    },
}

fn print_report(report: &RunReport) {
    println!("\n📊 Run {} ({:?}):", report.run_id, report.mode);
    println!("   Extracted: {}", report.extracted);
    println!("   Transformed: {}", report.transformed);
    println!("   Rejected: {}", report.rejected);
    println!("   Rows upserted: {}", report.rows_affected);
    for (stage, attempts) in &report.attempts {
        println!("   {} attempts: {}", stage, attempts);
    }
    println!(
        "   Took: {:.2}s",
        (report.completed_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let (config, from_file) = Config::load_or_default(&cli.config)?;
    let _log_guard = logging::init_logging(&config.observability.log_dir);
    if from_file {
        info!("Loaded configuration from {}", cli.config.display());
    } else {
        warn!("Config file {} not found, using defaults", cli.config.display());
    }
    metrics::init_metrics(config.observability.metrics_addr);

    match cli.command {
        Commands::Run { streaming } => {
            let mode = if streaming { RunMode::Streaming } else { config.pipeline.mode };
            let orchestrator = config.build_orchestrator()?;
            println!("🔄 Running session replication ({:?})...", mode);
            match orchestrator.run(mode).await {
                Ok(report) => print_report(&report),
                Err(e) => {
                    error!("Run failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Commands::Schedule { max_runs } => {
            let schedule = config.schedule()?;
            let orchestrator = Arc::new(config.build_orchestrator()?);
            println!("⏰ Scheduling session replication {}", schedule);
            let runs = Scheduler::new(orchestrator, schedule)
                .with_mode(config.pipeline.mode)
                .with_max_runs(max_runs)
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for ctrl-c: {}", e);
                        std::future::pending::<()>().await;
                    }
                })
                .await;
            println!("✅ Scheduler stopped after {} runs", runs);
        }
        Commands::Stage { stage, run_id } => {
            if config.pipeline.handoff_dir.is_none() {
                warn!("No pipeline.handoff_dir configured; stage output will not outlive this process");
            }
            let orchestrator = config.build_orchestrator()?;
            let report = orchestrator
                .run_stage(stage, &run_id)
                .await
                .with_context(|| format!("{} stage of run {} failed", stage, run_id))?;
            println!(
                "✅ {} for run {}: {} produced, {} rejected, {} attempts",
                stage, run_id, report.produced, report.rejected, report.attempts
            );
        }
        Commands::Seed { count } => {
            if config.source.kind != SourceKind::Sqlite {
                anyhow::bail!("seeding needs a sqlite source; the memory source seeds itself");
            }
            let store = SqliteDocumentStore::open(&config.source.path)?;
            let inserted = fixtures::seed(&store, &config.source.collection, count)?;
            info!("Seeded {} into {}", config.source.path.display(), config.source.collection);
            println!("🌱 Inserted {} sessions into {}", inserted, config.source.collection);
        }
    }

    Ok(())
}
