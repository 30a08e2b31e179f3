//! cedar-replay
//!
//! Replays recorded fuel-price updates into a SQLite price store, pacing
//! commits by the gaps between historical timestamps.
//!
//! # Usage
//!
//! ```bash
//! # replay at 60x into ./prices.db, resuming from what it already holds
//! cargo run --release -- --price-folder ./data/prices --db ./prices.db --speed 60 run
//!
//! # what is in the store
//! cargo run --release -- --db ./prices.db status
//!
//! # which partitions a run would open
//! cargo run --release -- --price-folder ./data/prices --db ./prices.db plan
//! ```
//!
//! Every flag can also come from the environment (`CEDAR_PRICE_FOLDER`,
//! `CEDAR_DB_PATH`, `CEDAR_SPEED_FACTOR`, `CEDAR_RESUME_AT`), a `.env` file, or
//! a TOML file given with `--config`. Flags win over the file.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Unexpected error
//! - 2: Configuration or validation error
//! - 3: Malformed record in a partition
//! - 4: Out-of-order timestamps in the source
//! - 5: Price store unavailable (cannot open or read the high-water mark)
//! - 6: A batch commit failed
//! - 7: Price folder or partition file unreadable
//! - 130: Cancelled with Ctrl-C

use anyhow::{Context, Result};
use cedar_replay::replay::clock::format_nanos;
use cedar_replay::replay::{
    plan, replay, MemorySink, ReplayConfig, ReplayError, ReplayOptions, SinkError, SpeedFactor,
    SqliteSink,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CANCELLED: i32 = 130;

// =============================================================================
// CLI ARGUMENTS
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "cedar-replay")]
#[command(about = "Replay historical fuel-price updates into a price store")]
struct Args {
    /// TOML file with replay settings
    #[arg(long, env = "CEDAR_CONFIG")]
    config: Option<PathBuf>,

    /// Folder searched recursively for YYYY-MM-DD-prices.csv files
    #[arg(short = 'p', long, env = "CEDAR_PRICE_FOLDER")]
    price_folder: Option<PathBuf>,

    /// Path to the SQLite price store
    #[arg(long = "db", env = "CEDAR_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Historical seconds replayed per real second
    #[arg(short = 's', long = "speed", env = "CEDAR_SPEED_FACTOR")]
    speed_factor: Option<f64>,

    /// Start strictly after this instant instead of the store's high-water mark
    #[arg(long, env = "CEDAR_RESUME_AT")]
    resume_at: Option<String>,

    /// Max wait for the database write lock, in milliseconds
    #[arg(long, env = "CEDAR_BUSY_TIMEOUT_MS")]
    busy_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay from the resume point to the end of the data
    Run,

    /// Show row count and time coverage of the price store
    Status,

    /// Show the resume point and the partitions a run would open
    Plan,
}

impl Args {
    /// File settings first, then flags and environment on top.
    fn resolve_config(&self) -> Result<ReplayConfig> {
        let mut config = match &self.config {
            Some(path) => ReplayConfig::from_toml_file(path)?,
            None => ReplayConfig::default(),
        };

        if let Some(folder) = &self.price_folder {
            config.price_folder = folder.clone();
        }
        if let Some(db) = &self.db_path {
            config.db_path = db.clone();
        }
        if let Some(speed) = self.speed_factor {
            config.speed_factor = SpeedFactor::new(speed)?;
        }
        if let Some(resume_at) = &self.resume_at {
            config.resume_at = Some(resume_at.clone());
        }
        if let Some(ms) = self.busy_timeout_ms {
            config.busy_timeout_ms = ms;
        }

        Ok(config)
    }
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialise logging: {:#}", e);
    }

    let code = match execute(args).await {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code(&e);
            error!(code, "{:#}", e);
            code
        }
    };

    std::process::exit(code);
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cedar_replay=info".parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn execute(args: Args) -> Result<i32> {
    let config = args.resolve_config()?;
    let options = config.to_options()?;

    match args.command {
        Commands::Run => run(&config, &options).await,
        Commands::Status => status(&config).map(|()| 0),
        Commands::Plan => show_plan(&config, &options).await.map(|()| 0),
    }
}

/// Map a failure to the documented exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ReplayError>() {
        Some(ReplayError::Config(_)) => 2,
        Some(ReplayError::MalformedRecord { .. }) => 3,
        Some(ReplayError::OutOfOrder { .. }) => 4,
        Some(ReplayError::CheckpointUnavailable { .. }) => 5,
        Some(ReplayError::Commit { .. }) => 6,
        Some(ReplayError::Discovery { .. }) => 7,
        Some(ReplayError::Stopped) | None => 1,
    }
}

fn open_store(config: &ReplayConfig) -> Result<SqliteSink, ReplayError> {
    let path = config.db_path.to_string_lossy();
    SqliteSink::open(&path, config.busy_timeout()).map_err(|e| ReplayError::CheckpointUnavailable {
        source: SinkError::new(format!("{:#}", e)),
    })
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn run(config: &ReplayConfig, options: &ReplayOptions) -> Result<i32> {
    let mut store = open_store(config)?;

    info!(
        folder = %options.price_folder.display(),
        db = %store.path(),
        speed = %options.speed,
        "Starting replay"
    );

    tokio::select! {
        result = replay(&mut store, options) => {
            let report = result?;
            info!(
                committed = report.events_committed,
                batches = report.batches_committed,
                skipped = report.events_skipped,
                partitions = report.partitions_read,
                "Replay complete"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        () = interrupted(tokio::signal::ctrl_c()) => {
            warn!("Interrupted; the next run resumes from the store's high-water mark");
            Ok(EXIT_CANCELLED)
        }
    }
}

/// Resolves once the signal fires. If the handler cannot be installed the
/// run continues without Ctrl-C support.
async fn interrupted<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(error = %e, "Cannot listen for Ctrl-C; the run can only be stopped by killing it");
        std::future::pending::<()>().await;
    }
}

fn status(config: &ReplayConfig) -> Result<()> {
    let path = config.db_path.to_string_lossy();
    let store = SqliteSink::open_read_only(&path).map_err(|e| ReplayError::CheckpointUnavailable {
        source: SinkError::new(format!("{:#}", e)),
    })?;
    let status = store.status().context("Failed to read price store")?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[derive(Serialize)]
struct PlanSummary {
    boundary: Option<String>,
    partitions: Vec<String>,
}

async fn show_plan(config: &ReplayConfig, options: &ReplayOptions) -> Result<()> {
    let planned = if config.db_path.exists() {
        let path = config.db_path.to_string_lossy();
        let store = SqliteSink::open_read_only(&path).map_err(|e| ReplayError::CheckpointUnavailable {
            source: SinkError::new(format!("{:#}", e)),
        })?;
        plan(&store, options).await?
    } else {
        // nothing committed yet
        plan(&MemorySink::new(), options).await?
    };

    let summary = PlanSummary {
        boundary: planned.boundary.resume_at().map(format_nanos),
        partitions: planned.sequencer.iter().map(|p| p.name().to_string()).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_file_defaults() {
        let args = parse(&["cedar-replay", "-p", "/data", "--speed", "120", "run"]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.price_folder, PathBuf::from("/data"));
        assert_eq!(config.speed_factor.get(), 120.0);
        assert!(matches!(args.command, Commands::Run));
    }

    #[test]
    fn test_exit_codes() {
        let err = anyhow::Error::new(ReplayError::Config("bad".into()));
        assert_eq!(exit_code(&err), 2);

        let err = anyhow::Error::new(ReplayError::CheckpointUnavailable {
            source: SinkError::new("locked"),
        });
        assert_eq!(exit_code(&err), 5);

        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_handler_failure_does_not_cancel() {
        let broken = async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no handler")) };
        let waited = tokio::time::timeout(std::time::Duration::from_secs(3600), interrupted(broken)).await;
        assert!(waited.is_err());

        let fired = async { Ok(()) };
        let waited = tokio::time::timeout(std::time::Duration::from_secs(1), interrupted(fired)).await;
        assert!(waited.is_ok());
    }
}
