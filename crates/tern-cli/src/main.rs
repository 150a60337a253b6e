//! tern CLI - self-healing replicated file mesh

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tern_config::TernConfig;
use tern_telemetry::{init_logging, LogConfig, LogLevel, LogOutput};

mod cluster;
mod commands;

#[derive(Parser)]
#[command(name = "tern")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster with live heartbeat, refresh and validate loops
    Run {
        /// Number of storage nodes
        #[arg(short, long, default_value = "4")]
        nodes: usize,
        /// Files to add once the cluster is up
        #[arg(short, long, default_value = "3")]
        files: usize,
        /// How long to keep the cluster running, in seconds
        #[arg(short, long, default_value = "60")]
        duration: u64,
        /// Persist node indexes and blobs under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Step a simulated cluster through failures and print every repair
    Sim {
        /// Number of storage nodes (at least 4)
        #[arg(short, long, default_value = "5")]
        nodes: usize,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TernConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let mut log = LogConfig::from_names(&config.logging.level, &config.logging.format)
        .context("Invalid logging settings")?;
    // Command output owns stdout
    log.output = LogOutput::Stderr;
    if cli.verbose > 0 {
        log.level = LogLevel::from_verbosity(cli.verbose);
    }
    init_logging(&log).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Run {
            nodes,
            files,
            duration,
            data_dir,
        } => commands::run::execute(&config, nodes, files, duration, data_dir.as_deref()).await,
        Commands::Sim { nodes, json } => commands::sim::execute(&config, nodes, json).await,
        Commands::CheckConfig => commands::check_config::execute(&config),
    }
}
