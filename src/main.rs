// ABOUTME: CLI entry point for watermark-sync
// ABOUTME: Loads settings, wires the run log backend and runs one synchronization cycle

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use watermark_sync::config::{RunLogBackend, SyncSettings};
use watermark_sync::postgres::ConnectionFactory;
use watermark_sync::sync::{
    CycleReport, PostgresChangeSource, PostgresMergeTarget, PostgresRunLog, RunLogEntry,
    RunLogStore, SqliteRunLog, SyncOrchestrator,
};

#[derive(Parser)]
#[command(name = "watermark-sync")]
#[command(about = "Incremental watermark-based table synchronization into PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the settings file
    #[arg(
        long,
        global = true,
        env = "WATERMARK_SYNC_CONFIG",
        default_value = "watermark-sync.toml"
    )]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronization cycle over all configured tables (default)
    Run {
        /// Compute inserts and updates without writing to the destination
        #[arg(long)]
        dry_run: bool,
    },
    /// Show recent run log entries
    History {
        /// Only show runs for this table
        #[arg(long)]
        table: Option<String>,
        /// Maximum number of entries
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create the run log table if it does not exist
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut settings = SyncSettings::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    let command = cli.command.unwrap_or(Commands::Run { dry_run: false });
    if let Commands::Run { dry_run: true } = command {
        settings.dry_run = true;
    }
    settings
        .validate_connections()
        .context("Invalid connection settings")?;

    match settings.run_log.backend {
        RunLogBackend::Postgres => {
            let connections =
                ConnectionFactory::new(&settings.destination_url, settings.command_timeout())?;
            tracing::debug!("Run log stored in {}", connections.display_url());
            let run_log = PostgresRunLog::new(
                connections,
                &settings.destination_schema,
                &settings.run_log.table,
                settings.stale_run_after(),
            );
            dispatch(command, settings, run_log).await
        }
        RunLogBackend::Sqlite => {
            let run_log = SqliteRunLog::open(&settings.run_log.path, settings.stale_run_after())
                .with_context(|| {
                    format!(
                        "Failed to open run log {}",
                        settings.run_log.path.display()
                    )
                })?;
            tracing::debug!("Run log stored in {}", run_log.path().display());
            dispatch(command, settings, run_log).await
        }
    }
}

async fn dispatch<L: RunLogStore>(command: Commands, settings: SyncSettings, run_log: L) -> Result<()> {
    match command {
        Commands::Init => {
            run_log
                .initialize()
                .await
                .context("Failed to create run log table")?;
            tracing::info!("Run log is ready");
            Ok(())
        }
        Commands::History { table, limit, json } => {
            let entries = run_log
                .recent_runs(table.as_deref(), limit)
                .await
                .context("Failed to read run log")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_history(&entries);
            }
            Ok(())
        }
        Commands::Run { .. } => {
            // Table failures live in the run log; they do not fail the process.
            let report = run(settings, run_log).await?;
            print_summary(&report);
            Ok(())
        }
    }
}

async fn run<L: RunLogStore>(settings: SyncSettings, run_log: L) -> Result<CycleReport> {
    // An unreachable run log fails each table inside the cycle, so the
    // outcome still shows up per table in the summary.
    if let Err(e) = run_log.initialize().await {
        tracing::error!("Failed to prepare run log table: {}", e);
    }

    let source_connections =
        ConnectionFactory::new(settings.effective_source_url(), settings.command_timeout())?;
    let target_connections =
        ConnectionFactory::new(&settings.destination_url, settings.command_timeout())?;
    tracing::info!(
        "Reading {} schema {} into {} schema {}",
        source_connections.display_url(),
        settings.source_schema,
        target_connections.display_url(),
        settings.destination_schema
    );

    let source = PostgresChangeSource::new(
        source_connections,
        &settings.source_schema,
        settings.initial_lookback(),
    );
    let target = PostgresMergeTarget::new(target_connections, &settings.destination_schema);
    let orchestrator = SyncOrchestrator::new(settings, run_log, source, target)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal, cancelling sync cycle");
            trigger.cancel();
        }
    });

    Ok(orchestrator.run_cycle(&cancel).await)
}

fn print_summary(report: &CycleReport) {
    println!();
    println!(
        "{:<32} {:<8} {:>8} {:>8} {:>8} {:>8}",
        "TABLE", "STATUS", "SCANNED", "INSERTED", "UPDATED", "ATTEMPTS"
    );
    for outcome in &report.tables {
        println!(
            "{:<32} {:<8} {:>8} {:>8} {:>8} {:>8}",
            outcome.table,
            outcome.status.as_str(),
            outcome.records_scanned,
            outcome.records_inserted,
            outcome.records_updated,
            outcome.attempts
        );
        if let Some(error) = &outcome.error {
            println!("  error: {}", error);
        }
        if !outcome.recorded {
            println!("  warning: outcome was not written to the run log");
        }
    }
    println!();
    if report.cancelled {
        println!("Cycle cancelled after {}ms", report.duration_ms);
    } else {
        println!(
            "Cycle finished in {}ms: {} inserted, {} updated, {} failed",
            report.duration_ms,
            report.rows_inserted(),
            report.rows_updated(),
            report.failures().count()
        );
    }
}

fn print_history(entries: &[RunLogEntry]) {
    if entries.is_empty() {
        println!("No runs recorded");
        return;
    }
    println!(
        "{:>8} {:<28} {:<8} {:<25} {:>8} {:>8} {:>8} {:>3}  WATERMARK",
        "RUN", "TABLE", "STATUS", "STARTED", "SCANNED", "INSERTED", "UPDATED", "TRY"
    );
    for entry in entries {
        println!(
            "{:>8} {:<28} {:<8} {:<25} {:>8} {:>8} {:>8} {:>3}  {}",
            entry.run_id,
            entry.table_name,
            entry.status.as_str(),
            entry.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            entry.records_scanned,
            entry.records_inserted,
            entry.records_updated,
            entry.attempts,
            entry.watermark
        );
        if let Some(error) = &entry.error_message {
            println!("{:>8} {}", "", error);
        }
    }
}
