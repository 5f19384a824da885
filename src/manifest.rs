//! Adaptive-bitrate manifest parsing and quality selection.
//!
//! A master playlist lists variant streams as `#EXT-X-STREAM-INF` lines
//! followed by the variant URL. [`parse_manifest`] turns those into
//! [`ManifestVariant`]s, always seeded with an "Auto" entry pointing at the
//! manifest itself, and [`select_variant`] picks one for a
//! [`QualityPreference`].

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::download::{DownloadError, HttpClient, RequestHeaders};
use crate::preferences::QualityPreference;

/// Label of the entry that plays the manifest itself.
pub const AUTO_LABEL: &str = "Auto";

const STREAM_INF_MARKER: &str = "#EXT-X-STREAM-INF";

#[allow(clippy::expect_used)]
static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RESOLUTION=(\d+)x(\d+)").expect("valid regex"));

/// Manifest failures. Callers usually degrade to the Auto-only list instead.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest {url} lists no variant streams")]
    NoVariants { url: String },

    #[error("could not fetch manifest {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: DownloadError,
    },
}

/// One selectable playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestVariant {
    pub label: String,
    /// `None` for the Auto entry.
    pub height: Option<u32>,
    pub url: String,
}

impl ManifestVariant {
    #[must_use]
    pub fn auto(manifest_url: &str) -> Self {
        Self {
            label: AUTO_LABEL.to_string(),
            height: None,
            url: manifest_url.to_string(),
        }
    }

    #[must_use]
    pub fn is_auto(&self) -> bool {
        self.height.is_none()
    }
}

/// Display label for a vertical resolution.
#[must_use]
pub fn quality_label(height: u32) -> String {
    match height {
        1080.. => format!("{height}p (FHD)"),
        720..=1079 => format!("{height}p (HD)"),
        480..=719 => format!("{height}p (SD)"),
        _ => format!("{height}p"),
    }
}

/// Parses a master playlist.
///
/// The result starts with the Auto entry, followed by the variants sorted by
/// height, highest first. Variants sharing a label keep the first one seen.
/// Relative variant URLs are resolved against `manifest_url`.
#[must_use]
pub fn parse_manifest(content: &str, manifest_url: &str) -> Vec<ManifestVariant> {
    let base = Url::parse(manifest_url).ok();
    let mut variants: Vec<ManifestVariant> = Vec::new();
    let mut lines = content.lines().map(str::trim);

    while let Some(line) = lines.next() {
        if !line.starts_with(STREAM_INF_MARKER) {
            continue;
        }
        let Some(height) = RESOLUTION_RE
            .captures(line)
            .and_then(|caps| caps.get(2))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        else {
            continue;
        };
        let Some(uri) = lines.by_ref().find(|l| !l.is_empty()) else {
            break;
        };
        if uri.starts_with('#') {
            debug!(line = uri, "variant tag without a URL line, skipping");
            continue;
        }

        let label = quality_label(height);
        if variants.iter().any(|v| v.label == label) {
            continue;
        }
        variants.push(ManifestVariant {
            label,
            height: Some(height),
            url: resolve(base.as_ref(), uri),
        });
    }

    variants.sort_by(|a, b| b.height.cmp(&a.height));
    let mut result = Vec::with_capacity(variants.len() + 1);
    result.push(ManifestVariant::auto(manifest_url));
    result.extend(variants);
    result
}

fn resolve(base: Option<&Url>, uri: &str) -> String {
    base.and_then(|base| base.join(uri).ok())
        .map_or_else(|| uri.to_string(), String::from)
}

/// Fetches and parses a manifest.
///
/// # Errors
///
/// Returns [`ManifestError::Fetch`] if the request fails and
/// [`ManifestError::NoVariants`] if the manifest lists no variants.
#[instrument(skip(http, headers), fields(url = %manifest_url))]
pub async fn try_fetch_variants(
    http: &HttpClient,
    manifest_url: &str,
    headers: &RequestHeaders,
) -> Result<Vec<ManifestVariant>, ManifestError> {
    let content = http
        .fetch_text(manifest_url, headers)
        .await
        .map_err(|source| ManifestError::Fetch {
            url: manifest_url.to_string(),
            source,
        })?;
    let variants = parse_manifest(&content, manifest_url);
    if variants.len() <= 1 {
        return Err(ManifestError::NoVariants {
            url: manifest_url.to_string(),
        });
    }
    debug!(count = variants.len() - 1, "manifest variants parsed");
    Ok(variants)
}

/// Like [`try_fetch_variants`], degrading to the Auto-only list on any failure.
pub async fn fetch_variants(
    http: &HttpClient,
    manifest_url: &str,
    headers: &RequestHeaders,
) -> Vec<ManifestVariant> {
    match try_fetch_variants(http, manifest_url, headers).await {
        Ok(variants) => variants,
        Err(ManifestError::NoVariants { .. }) => vec![ManifestVariant::auto(manifest_url)],
        Err(e) => {
            warn!(error = %e, "manifest unavailable, using Auto");
            vec![ManifestVariant::auto(manifest_url)]
        }
    }
}

/// Picks the variant to play for `preference`.
///
/// Expects the ordering produced by [`parse_manifest`]. Returns `None` only
/// for an empty slice.
#[must_use]
pub fn select_variant(
    variants: &[ManifestVariant],
    preference: QualityPreference,
) -> Option<&ManifestVariant> {
    let auto = variants.iter().find(|v| v.is_auto());
    let mut ranked: Vec<&ManifestVariant> = variants.iter().filter(|v| !v.is_auto()).collect();
    ranked.sort_by(|a, b| b.height.cmp(&a.height));

    let in_band = |low: u32, high: u32| {
        ranked
            .iter()
            .copied()
            .find(|v| v.height.is_some_and(|h| (low..high).contains(&h)))
    };

    let chosen = match preference {
        QualityPreference::Best => ranked.first().copied(),
        QualityPreference::High => in_band(720, 1080).or_else(|| ranked.first().copied()),
        QualityPreference::Medium => {
            in_band(480, 720).or_else(|| ranked.get(ranked.len() / 2).copied())
        }
        QualityPreference::Low => ranked.last().copied(),
        QualityPreference::Auto | QualityPreference::Unknown => None,
    };
    chosen.or(auto).or_else(|| variants.first())
}
