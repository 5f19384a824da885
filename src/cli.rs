//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use streamfetch_core::QualityPreference;

/// Resolve and download streams exposed by scraping modules.
///
/// Modules are read from a directory of `<id>.json` manifests, each next to
/// its script. Downloads run through a bounded queue and are recorded so the
/// same source is never fetched twice.
#[derive(Parser, Debug)]
#[command(name = "streamfetch")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding module manifests and scripts
    #[arg(long, global = true, value_name = "DIR")]
    pub modules: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve the stream URLs of an episode page
    Resolve(ResolveArgs),
    /// List the quality variants of an HLS master playlist
    Variants(VariantsArgs),
    /// Download media files or resolved episodes
    Download(DownloadArgs),
    /// Show or edit the download records
    Records(RecordsArgs),
    /// Search a module's catalogue
    Search(SearchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// Module id
    pub module: String,

    /// Episode page URL or reference understood by the module
    pub episode: String,

    /// Keep soft subtitles the module returns
    #[arg(long)]
    pub softsub: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct VariantsArgs {
    /// Master playlist URL
    pub url: String,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Mark the variant this preference selects
    #[arg(long, value_parser = parse_quality)]
    pub quality: Option<QualityPreference>,

    /// Print the variants as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Media URLs, or episode references when `--module` is given
    #[arg(required = true)]
    pub sources: Vec<String>,

    /// Resolve each source through this module first
    #[arg(short, long)]
    pub module: Option<String>,

    /// Title used for the file name (defaults to the URL's file stem)
    #[arg(short, long)]
    pub title: Option<String>,

    /// Show title; makes the jobs episode downloads
    #[arg(long)]
    pub show: Option<String>,

    /// Season number
    #[arg(long, requires = "show")]
    pub season: Option<u32>,

    /// Episode number of the first source; later sources count up from it
    #[arg(long, requires = "show")]
    pub episode: Option<u32>,

    /// Poster image saved next to the media file
    #[arg(long, value_name = "URL")]
    pub poster: Option<String>,

    /// Subtitle file downloaded after the media
    #[arg(long, value_name = "URL")]
    pub subtitle: Option<String>,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Output directory (overrides the configured download directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Download record file (overrides the configured path)
    #[arg(long, value_name = "FILE")]
    pub records: Option<PathBuf>,

    /// Quality preference for adaptive streams
    #[arg(long, value_parser = parse_quality)]
    pub quality: Option<QualityPreference>,

    /// Maximum simultaneous transfers (1-20)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=20))]
    pub concurrency: Option<u8>,

    /// Maximum retry attempts per transfer (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub max_retries: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct RecordsArgs {
    /// Download record file (overrides the configured path)
    #[arg(long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Remove the record with this id
    #[arg(long, value_name = "ID")]
    pub remove: Option<uuid::Uuid>,

    /// Print the records as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Module id
    pub module: String,

    /// Search text
    pub query: String,

    /// Also list the episodes of the first result
    #[arg(long)]
    pub episodes: bool,

    /// Print the results as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_quality(raw: &str) -> Result<QualityPreference, String> {
    raw.parse()
}
