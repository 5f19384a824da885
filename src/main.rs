//! CLI entry point for streamfetch.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};

mod app_config;
mod cli;
mod commands;
mod progress;

use cli::{Cli, Command};
use commands::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let loaded = app_config::load_default_file_config()?;
    match (&loaded.path, loaded.config.is_some()) {
        (Some(path), true) => info!(path = %path.display(), "Loaded config file"),
        (Some(path), false) => debug!(path = %path.display(), "No config file"),
        (None, _) => debug!("No config directory known"),
    }
    let ctx = AppContext::new(&cli, loaded.config.as_ref());

    match &cli.command {
        Command::Resolve(args) => commands::run_resolve_command(&ctx, args).await,
        Command::Variants(args) => commands::run_variants_command(&ctx, args).await,
        Command::Download(args) => commands::run_download_command(&ctx, args).await,
        Command::Records(args) => commands::run_records_command(&ctx, args).await,
        Command::Search(args) => commands::run_search_command(&ctx, args).await,
    }
}
