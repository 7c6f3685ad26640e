//! Rollup Server Binary
//!
//! Runs the in-memory rollup pipeline until interrupted, optionally
//! ingesting a batch of points at start-up.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use clap::Parser;
use rollup_common::{DefaultPolicyMode, Result, RollupConfig};
use rollup_server::Pipeline;
use rollup_streaming::parse_batch;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;

#[derive(Parser)]
#[command(name = "rollup-server")]
#[command(about = "Time-series rollup ingestion pipeline")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file with hot-reloadable BATCH_SIZE and SLEEP_TIME
    #[arg(short, long)]
    parameters: Option<String>,

    /// Prefix for table and stream names
    #[arg(long)]
    table_prefix: Option<String>,

    /// Create default policies for unknown series
    #[arg(long)]
    add_default: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// JSON points file ({"series": [[time, value], ...]}) to ingest at start-up
    #[arg(short, long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let debug = args.debug || std::env::var_os("DEBUG_LOGS").is_some();
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Rollup server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<RollupConfig> {
    let mut config = match &args.config {
        Some(path) => RollupConfig::from_file(path)?,
        None => RollupConfig::default(),
    }
    .with_env()?;

    if let Some(prefix) = &args.table_prefix {
        config = config.with_table_prefix(prefix.clone());
    }
    if args.add_default {
        config = config.with_default_policy(DefaultPolicyMode::Create);
    }
    if let Some(parameters) = &args.parameters {
        config = config.with_parameters_file(parameters.clone());
    }
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    tracing::debug!("Configuration: {:?}", config);

    let mut pipeline = Pipeline::new(config)?;
    pipeline.start().await?;

    if let Some(path) = &args.input {
        let content = tokio::fs::read_to_string(path).await?;
        let batch = parse_batch(&content)?;
        match pipeline.ingest(&batch).await {
            Ok(count) => tracing::info!("Ingested {} points from {}", count, path.display()),
            Err(e) => tracing::error!("Cannot ingest {}: {}", path.display(), e),
        }
    }

    tracing::info!("Rollup server running, press Ctrl-C to stop");
    signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping workers");

    let report = pipeline.shutdown().await?;
    for exit in &report.workers {
        tracing::info!(
            "{}: {} records, {} written, {} applied, {} rejected, {} dropped",
            exit.shard,
            exit.stats.records,
            exit.stats.written,
            exit.stats.applied,
            exit.stats.rejected,
            exit.stats.dropped
        );
    }
    tracing::info!(
        "Change feed: {} changes in {} batches, {} events published",
        report.pump.changes,
        report.pump.batches,
        report.pump.published
    );
    Ok(())
}
