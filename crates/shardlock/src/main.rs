//! Shardlock - partitioned session state store
//!
//! Main entry point for the shardlock operator CLI.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use shardlock_config::{LoadedConfig, LoggingSection};
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{expired, inspect, route, sweep};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Shardlock - partitioned session state store
#[derive(Parser)]
#[command(name = "shardlock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: $SHARDLOCK_CONFIG, then ./shardlock.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Also write daily-rolling JSON logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show which partition a session id routes to
    Route(route::RouteArgs),

    /// Show the lock state of a session
    Inspect(inspect::InspectArgs),

    /// List sessions waiting to be swept
    Expired(expired::ExpiredArgs),

    /// Run the expiration sweeper
    Sweep(sweep::SweepArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

const VERBOSE_FILTER: &str = "shardlock=debug,shardlock_store=debug,shardlock_config=debug,info";
const DEFAULT_FILTER: &str = "shardlock=info,shardlock_store=info,shardlock_config=info,warn";
const FILE_FILTER: &str = "shardlock=trace,shardlock_store=trace,shardlock_config=trace,info";

/// Console logs go to stderr so `--json` output stays parseable. The
/// returned guard must live until exit to flush the file writer.
fn init_logging(cli: &Cli, logging: &LoggingSection) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let console_filter = if cli.verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(logging.level.as_deref().unwrap_or(DEFAULT_FILTER))
        })
    };
    let console = if logging.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed()
    };

    let log_dir = cli.log_dir.clone().or_else(|| logging.dir.clone());
    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "shardlock.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(FILE_FILTER));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let LoadedConfig { config, origin } =
        shardlock_config::load_config(cli.config.as_deref()).context("loading configuration")?;
    let _guard = init_logging(&cli, &config.logging);
    match origin.path() {
        Some(path) => tracing::debug!(path = %path.display(), "Configuration loaded"),
        None => tracing::debug!("Using default configuration"),
    }

    let ctx = commands::Context {
        config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Route(args) => route::run(args, &ctx),
        Commands::Inspect(args) => inspect::run(args, &ctx),
        Commands::Expired(args) => expired::run(args, &ctx),
        Commands::Sweep(args) => sweep::run(args, &ctx).await,
    }
}
