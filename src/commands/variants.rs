//! Variants command handler: list the qualities of a master playlist.

use anyhow::Result;
use streamfetch_core::manifest::{ManifestVariant, fetch_variants, select_variant};
use streamfetch_core::preferences::QualityPreference;

use super::{AppContext, header_map};
use crate::cli::VariantsArgs;

pub async fn run_variants_command(ctx: &AppContext, args: &VariantsArgs) -> Result<()> {
    let http = ctx.http()?;
    let variants = fetch_variants(&http, &args.url, &header_map(&args.headers)).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&variants)?);
        return Ok(());
    }
    print!("{}", render_variants(&variants, args.quality));
    Ok(())
}

fn render_variants(variants: &[ManifestVariant], quality: Option<QualityPreference>) -> String {
    let selected = quality
        .and_then(|preference| select_variant(variants, preference))
        .map(|variant| variant.url.as_str());
    let width = variants.iter().map(|v| v.label.len()).max().unwrap_or(0);

    let mut out = String::new();
    for variant in variants {
        let marker = if selected == Some(variant.url.as_str()) { '*' } else { ' ' };
        out.push_str(&format!("{marker} {:<width$}  {}\n", variant.label, variant.url));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamfetch_core::manifest::parse_manifest;

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:RESOLUTION=1920x1080
1080.m3u8
#EXT-X-STREAM-INF:RESOLUTION=1280x720
720.m3u8
";

    #[test]
    fn test_render_marks_selected_variant() {
        let variants = parse_manifest(MASTER, "https://cdn.example/master.m3u8");
        let out = render_variants(&variants, Some(QualityPreference::High));
        assert_eq!(
            out,
            "  Auto         https://cdn.example/master.m3u8\n  1080p (FHD)  https://cdn.example/1080.m3u8\n* 720p (HD)    https://cdn.example/720.m3u8\n"
        );
    }

    #[test]
    fn test_render_without_preference_marks_nothing() {
        let variants = vec![ManifestVariant::auto("https://cdn.example/a.m3u8")];
        assert_eq!(
            render_variants(&variants, None),
            "  Auto  https://cdn.example/a.m3u8\n"
        );
    }
}
