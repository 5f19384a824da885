//! Resolve command handler: run a module's stream extraction for one episode.

use anyhow::{Context, Result};
use streamfetch_core::resolver::StreamResolutionResult;
use tracing::info;

use super::AppContext;
use crate::cli::ResolveArgs;

pub async fn run_resolve_command(ctx: &AppContext, args: &ResolveArgs) -> Result<()> {
    let http = ctx.http()?;
    let session = ctx.load_module(&args.module, &http)?;
    let resolver = ctx.resolver(&http);

    let result = resolver
        .resolve(&session, &args.episode, args.softsub)
        .await
        .with_context(|| format!("Failed to resolve '{}'", args.episode))?;
    info!(
        streams = result.variants.len(),
        subtitles = result.subtitles.len(),
        "resolution complete"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", render_result(&result));
    }
    Ok(())
}

fn render_result(result: &StreamResolutionResult) -> String {
    let mut out = String::new();
    for (index, variant) in result.variants.iter().enumerate() {
        match &variant.title {
            Some(title) => out.push_str(&format!("[{}] {title}: {}\n", index + 1, variant.url)),
            None => out.push_str(&format!("[{}] {}\n", index + 1, variant.url)),
        }
        for (name, value) in &variant.headers {
            out.push_str(&format!("      {name}: {value}\n"));
        }
    }
    for subtitle in &result.subtitles {
        out.push_str(&format!("subtitle: {}\n", subtitle.url));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamfetch_core::resolver::{PayloadKind, StreamVariant, SubtitleTrack};

    #[test]
    fn test_render_result_lists_streams_headers_and_subtitles() {
        let mut first = StreamVariant::new("https://cdn.example/sub.m3u8");
        first.title = Some("SUB".to_string());
        first
            .headers
            .insert("Referer".to_string(), "https://site.example/".to_string());
        let result = StreamResolutionResult {
            variants: vec![first, StreamVariant::new("https://cdn.example/dub.m3u8")],
            subtitles: vec![SubtitleTrack {
                url: "https://cdn.example/en.vtt".to_string(),
            }],
            payload_kind: PayloadKind::Object,
        };

        assert_eq!(
            render_result(&result),
            "[1] SUB: https://cdn.example/sub.m3u8\n      Referer: https://site.example/\n[2] https://cdn.example/dub.m3u8\nsubtitle: https://cdn.example/en.vtt\n"
        );
    }
}
