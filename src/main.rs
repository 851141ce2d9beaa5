use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{self, EnvFilter};

mod catalog;
mod cli;
mod config;
mod derived;
mod error;
mod expr;
mod frame;
mod partition;
mod status;
mod stitcher;
mod window;

use cli::commands::{ChannelsCommand, FetchCommand, ResolveCommand, StatusCommand};
use config::{Config, SourceKind};

#[derive(Parser)]
#[command(name = "wel-data")]
#[command(about = "Stitch WEL heat-pump telemetry into one dataset and evaluate channel expressions")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML config file (defaults to $WEL_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured data source
    #[arg(short, long, value_enum, global = true)]
    source: Option<SourceKind>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the channels of the loaded window
    Channels(ChannelsCommand),
    /// Evaluate channel names or expressions over a window
    Resolve(ResolveCommand),
    /// Show decoded status channels stacked by level
    Status(StatusCommand),
    /// Download monthly archive files into the local cache
    Fetch(FetchCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Keep polars from grabbing every core on small telemetry frames
    let max_polars_threads = std::cmp::min(4, num_cpus::get());
    std::env::set_var("POLARS_MAX_THREADS", max_polars_threads.to_string());

    let base_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let quiet_deps = "reqwest=warn,rustls=error,hyper=error,hyper_util=error,h2=error";

    tracing_subscriber::fmt()
        .with_max_level(base_level)
        .with_env_filter(EnvFilter::new(format!(
            "wel_data={},{}",
            if cli.verbose { "debug" } else { "info" },
            quiet_deps
        )))
        .init();

    info!("Starting wel-data v{}", env!("CARGO_PKG_VERSION"));
    info!("🧵 Limited Polars to {} threads", max_polars_threads);

    let mut config = Config::discover(cli.config.as_deref())?;
    if let Some(source) = cli.source {
        config.source = source;
    }

    match cli.command {
        Commands::Channels(cmd) => cmd.execute(config),
        Commands::Resolve(cmd) => cmd.execute(config),
        Commands::Status(cmd) => cmd.execute(config),
        Commands::Fetch(cmd) => cmd.execute(config),
    }
}
