//! delta-migrate CLI - incremental legacy-to-platform data sync.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use delta_migrate::resolve::ManualReviewQueue;
use delta_migrate::{
    Config, DetectionReport, ExecutionResult, MigrateError, RunStatus, StatusReport, SyncService,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code for runs that finished with failed or deferred records.
const EXIT_PARTIAL: u8 = 5;

#[derive(Parser)]
#[command(name = "delta-migrate")]
#[command(about = "Incremental, resumable legacy-to-platform data sync")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Keep run state in a signed JSON file instead of the target database.
    /// Deferred review items go to a `.review.jsonl` file beside it.
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect changes since a baseline without applying them
    Detect {
        /// Entity types to analyze (default: all configured entities)
        #[arg(long = "entity")]
        entities: Vec<String>,

        /// Baseline timestamp (RFC 3339); only later source changes are considered
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,
    },

    /// Detect changes and apply them in a new run
    Run {
        /// Entity types to sync (default: all configured entities)
        #[arg(long = "entity")]
        entities: Vec<String>,

        /// Baseline timestamp (RFC 3339); only later source changes are considered
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,

        /// Detect and plan only; do not create a run
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a paused, failed or force-cancelled run
    Resume {
        /// Run id or checkpoint id
        id: String,
    },

    /// Show run status, or list recent runs when no id is given
    Status {
        /// Run id or checkpoint id
        id: Option<String>,

        /// Number of runs to list
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Ask a run executing elsewhere to pause at its next batch boundary
    Pause {
        /// Run id or checkpoint id
        id: String,
    },

    /// Cancel a run
    Cancel {
        /// Run id or checkpoint id
        id: String,

        /// Keep the run resumable
        #[arg(long)]
        force: bool,
    },

    /// List records deferred by the manual conflict policy
    Review {
        /// Only items deferred by this run
        #[arg(long)]
        run: Option<String>,
    },

    /// Remove audit checkpoints older than the retention window
    Cleanup,

    /// Test database connections
    HealthCheck,
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let service = SyncService::connect(&config, cli.state_file.as_deref()).await?;

    match cli.command {
        Commands::Detect { entities, since } => {
            let report = service.detect_changes(&entities, since).await;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_detection(&report);
            }
            if !report.errors.is_empty() {
                return Ok(ExitCode::from(1));
            }
        }

        Commands::Run {
            entities,
            since,
            dry_run,
        } => {
            let report = service.detect_changes(&entities, since).await;
            if !report.errors.is_empty() {
                print_detection(&report);
                return Err(MigrateError::State(format!(
                    "detection failed for {} entities",
                    report.errors.len()
                )));
            }
            let tasks = service.plan_tasks(&report.results)?;
            if dry_run {
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_detection(&report);
                    println!("\nDry run: {} tasks planned, nothing applied", tasks.len());
                }
                return Ok(ExitCode::SUCCESS);
            }

            let run_id = service.submit_run(tasks).await?;
            info!(run_id = %run_id, "Run started");
            let result = drive(&service, &run_id, cli.progress).await?;
            print_result(&result, cli.output_json, "Sync")?;
            return Ok(exit_for(&result));
        }

        Commands::Resume { id } => {
            let run_id = service.resume(&id).await?;
            let result = drive(&service, &run_id, cli.progress).await?;
            print_result(&result, cli.output_json, "Resumed sync")?;
            return Ok(exit_for(&result));
        }

        Commands::Status { id: Some(id), .. } => {
            let status = service.get_status(&id).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Commands::Status { id: None, limit } => {
            let runs = service.list_runs(limit).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs recorded");
            } else {
                for run in &runs {
                    println!(
                        "{}  {:<10} {:>8}/{:<8} {}",
                        run.run_id,
                        run.status().as_str(),
                        run.total_processed(),
                        run.total_records(),
                        run.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }

        Commands::Pause { id } => {
            service.pause(&id).await?;
            println!("Pause requested for {}", id);
        }

        Commands::Cancel { id, force } => {
            service.cancel(&id, force).await?;
            if force {
                println!("Cancel requested for {} (resumable)", id);
            } else {
                println!("Cancel requested for {}", id);
            }
        }

        Commands::Review { run } => {
            let items: Vec<_> = service
                .review_queue()
                .pending()
                .await?
                .into_iter()
                .filter(|item| run.as_deref().map_or(true, |r| item.run_id == r))
                .collect();
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("No records waiting for review");
            } else {
                for item in &items {
                    println!(
                        "{}  {:<20} {:<10} {:<12} {}",
                        item.queued_at.format("%Y-%m-%d %H:%M:%S"),
                        item.entity_type,
                        item.change_type.as_str(),
                        item.record_id,
                        item.run_id
                    );
                }
            }
        }

        Commands::Cleanup => {
            let removed = service.cleanup_checkpoints().await?;
            if cli.output_json {
                println!("{}", serde_json::json!({ "checkpoints_removed": removed }));
            } else {
                println!(
                    "Removed {} checkpoints older than {} days",
                    removed,
                    config.sync.get_checkpoint_retention_days()
                );
            }
        }

        Commands::HealthCheck => {
            let healthy = match service.health_check().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Health check failed: {}", e);
                    false
                }
            };
            if cli.output_json {
                println!("{}", serde_json::json!({ "healthy": healthy }));
            } else {
                println!(
                    "Overall: {}",
                    if healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }
            if !healthy {
                return Err(MigrateError::Connection("Health check failed".to_string()));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Wait for a background run, pausing it on SIGINT/SIGTERM.
async fn drive(
    service: &SyncService,
    run_id: &str,
    progress: bool,
) -> Result<ExecutionResult, MigrateError> {
    let shutdown = setup_signal_handler()?;
    if let Some(control) = service.control(run_id) {
        control.pause_on(shutdown);
    }

    if progress {
        let mut updates = service.subscribe(run_id);
        tokio::spawn(async move {
            while let Ok(snapshot) = updates.recv().await {
                if let Ok(line) = serde_json::to_string(&snapshot) {
                    eprintln!("{}", line);
                }
                if snapshot.status.is_terminal() {
                    break;
                }
            }
        });
    }

    service.wait(run_id).await
}

fn exit_for(result: &ExecutionResult) -> ExitCode {
    match result.status {
        RunStatus::Partial => ExitCode::from(EXIT_PARTIAL),
        RunStatus::Failed => ExitCode::from(1),
        RunStatus::Cancelled => ExitCode::from(130),
        RunStatus::Completed | RunStatus::Paused | RunStatus::Queued | RunStatus::Running => {
            ExitCode::SUCCESS
        }
    }
}

fn print_detection(report: &DetectionReport) {
    println!("Change detection:");
    for result in &report.results {
        println!(
            "  {:<20} new: {:>6}  modified: {:>6}  deleted: {:>6}  analyzed: {:>8}  ({}ms)",
            result.entity_type,
            result.summary.new,
            result.summary.modified,
            result.summary.deleted,
            result.total_records_analyzed,
            result.performance.duration_ms
        );
        if let Some(baseline) = result.next_baseline {
            println!("  {:<20} next baseline: {}", "", baseline.to_rfc3339());
        }
    }
    for (entity, error) in &report.errors {
        println!("  {:<20} FAILED: {}", entity, error);
    }
    println!("  Total changes: {}", report.total_changes());
}

fn print_result(result: &ExecutionResult, json: bool, label: &str) -> Result<(), MigrateError> {
    if json {
        println!("{}", result.to_json()?);
        return Ok(());
    }

    println!("\n{} {}", label, result.status.as_str());
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Records: {}/{} ({} failed, {} deferred)",
        result.records_processed, result.records_total, result.records_failed, result.records_deferred
    );
    println!("  Throughput: {:.0} records/sec", result.records_per_second);
    for entity in &result.entities {
        println!(
            "    {:<20} {:<9} +{} ~{} -{} ={} !{}",
            entity.entity_type,
            format!("{:?}", entity.state).to_lowercase(),
            entity.inserted,
            entity.updated,
            entity.deleted,
            entity.skipped,
            entity.failed
        );
        if let Some(error) = &entity.error {
            println!("      error: {}", error);
        }
    }
    if let Some(recovery) = &result.recovery {
        println!("  Recovery: {:?}: {}", recovery.recommended_action, recovery.message);
        if let Some(checkpoint) = &recovery.checkpoint_id {
            println!("    checkpoint: {}", checkpoint);
        }
    }
    Ok(())
}

fn print_status(status: &StatusReport) {
    println!("Run {}", status.run_id);
    println!("  Status: {}", status.status.as_str());
    println!(
        "  Progress: {:.1}% ({}/{} records, {} failed)",
        status.progress.percent_complete,
        status.progress.records_processed,
        status.progress.records_total,
        status.progress.records_failed
    );
    if let Some(eta) = status.progress.eta_seconds {
        println!("  ETA: {:.0}s at {:.1} records/sec", eta, status.progress.throughput);
    }
    println!(
        "  Entities: {} pending, {} running, {} completed, {} failed",
        status.sets.pending.len(),
        status.sets.running.len(),
        status.sets.completed.len(),
        status.sets.failed.len()
    );
    if let Some(lease) = &status.lease {
        println!("  Lease: {} until {}", lease.owner, lease.expires_at.to_rfc3339());
    }
    for alert in &status.progress.alerts {
        println!("  Alert: {}", alert.message);
    }
    if let Some(recovery) = &status.result.recovery {
        println!("  Recovery: {:?}: {}", recovery.recommended_action, recovery.message);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> anyhow::Result<()> {
    // RUST_LOG, when set, overrides --verbosity.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
    } else {
        subscriber.try_init().map_err(|e| anyhow::anyhow!(e))?;
    }

    Ok(())
}

fn default_directives(verbosity: &str) -> String {
    let level = match verbosity.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    // Driver chatter stays at warn unless asked for explicitly.
    format!("{},tokio_postgres=warn,deadpool_postgres=warn", level)
}

/// Cancelled on SIGINT (Ctrl-C) or SIGTERM (orchestrator shutdown).
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Pausing at the next batch boundary..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Pausing at the next batch boundary..."),
        }
        token.cancel();
    });

    Ok(cancel_token)
}

#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Pausing at the next batch boundary...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
