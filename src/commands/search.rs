//! Search command handler: query a module's catalogue.

use anyhow::{Context, Result};
use serde::Serialize;
use streamfetch_core::catalog::{EpisodeLink, MediaDetails, SearchItem};
use streamfetch_core::script::CatalogError;
use tracing::warn;

use super::AppContext;
use crate::cli::SearchArgs;

#[derive(Debug, Serialize)]
struct SearchOutput {
    results: Vec<SearchItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<MediaDetails>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    episodes: Vec<EpisodeLink>,
}

pub async fn run_search_command(ctx: &AppContext, args: &SearchArgs) -> Result<()> {
    let http = ctx.http()?;
    let session = ctx.load_module(&args.module, &http)?;

    let results = session
        .search(&args.query)
        .await
        .with_context(|| format!("Search for '{}' failed", args.query))?;

    let mut output = SearchOutput {
        results,
        details: None,
        episodes: Vec::new(),
    };

    if args.episodes
        && let Some(first) = output.results.first()
    {
        let href = first.href.clone();
        output.details = match session.details(&href).await {
            Ok(details) => details.into_iter().next(),
            Err(CatalogError::Unsupported { .. }) => None,
            Err(e) => {
                warn!(error = %e, "could not load details");
                None
            }
        };
        output.episodes = session
            .episodes(&href)
            .await
            .with_context(|| format!("Failed to list episodes of '{href}'"))?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }
    print!("{}", render_output(&output));
    Ok(())
}

fn render_output(output: &SearchOutput) -> String {
    if output.results.is_empty() {
        return "No results.\n".to_string();
    }
    let mut out = String::new();
    for (index, item) in output.results.iter().enumerate() {
        out.push_str(&format!("{:>3}. {}\n     {}\n", index + 1, item.title, item.href));
    }
    if let Some(details) = &output.details
        && !details.description.is_empty()
    {
        out.push_str(&format!("\n{}\n", details.description));
    }
    if !output.episodes.is_empty() {
        out.push('\n');
        for episode in &output.episodes {
            let number = episode
                .whole_number()
                .map_or_else(|| episode.number.to_string(), |n| n.to_string());
            out.push_str(&format!("  Episode {number}: {}\n", episode.href));
        }
    }
    out
}
