//! Patient sync daemon.
//!
//! Drives one source (snapshot or CDC) into the consolidated patient store.
//! Run one process per source; each keeps its own checkpoints.
//!
//! # Usage
//!
//! ```bash
//! # Long-running sync of the CDC source
//! patient-sync --config /etc/patient-sync/config.toml --source cdc
//!
//! # One cycle of the snapshot source, JSON logs
//! patient-sync --config config.toml --source snapshot --once --json-logs
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT and SIGTERM set a shutdown flag. The current record finishes, the
//! checkpoint for the work done so far is saved, and the process exits.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use patient_sync_core::{ShutdownToken, SyncConfig, SyncDaemon};
use tracing_subscriber::EnvFilter;

/// Patient record sync daemon.
#[derive(Parser, Debug)]
#[command(name = "patient-sync")]
#[command(about = "Sync hospital patient records into the consolidated store")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(long, short, default_value = "patient-sync.toml")]
    config: PathBuf,

    /// Source to sync: `snapshot` or `cdc`
    #[arg(long, short)]
    source: String,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,patient_sync_core=info"))
        .context("Invalid log filter")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config = SyncConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    let shutdown = ShutdownToken::new();
    let handle = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping after the current record...");
        handle.trigger();
    })
    .context("Failed to set signal handler")?;

    let mut daemon = SyncDaemon::from_config(&args.source, &config, shutdown)
        .with_context(|| format!("Failed to start sync for source '{}'", args.source))?;

    if args.once {
        let status = daemon.run_cycle();
        tracing::info!(
            operation = ?status.operation,
            success = status.success,
            processed = status.processed,
            errors = status.errors,
            "Single cycle finished"
        );
        if !status.success {
            anyhow::bail!(
                "cycle failed: {}",
                status.message.unwrap_or_else(|| format!("{} errors", status.errors))
            );
        }
    } else {
        daemon.run();
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = init_tracing(args.json_logs) {
        eprintln!("patient-sync: {:#}", e);
        std::process::exit(2);
    }

    tracing::info!(source = %args.source, config = %args.config.display(), "Patient sync starting");
    if let Err(e) = run(args) {
        tracing::error!(error = %format!("{:#}", e), "Patient sync failed");
        std::process::exit(1);
    }
    tracing::info!("Patient sync stopped");
}
