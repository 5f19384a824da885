//! Segment-concatenating transport for HLS playlists.
//!
//! A master playlist is narrowed to one media playlist with the quality
//! selector; the media playlist's segments are then fetched in order and
//! appended to a single `.ts` file.

use std::path::Path;

use async_trait::async_trait;
use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

use super::client::{HttpClient, RequestHeaders};
use super::error::DownloadError;
use super::job::DownloadJob;
use super::naming::partial_path;
use super::transport::{
    Transport, TransportKind, TransportProgress, discard_partial, finalize, prepare_parent,
};
use crate::manifest::{parse_manifest, select_variant};
use crate::preferences::{PreferenceStore, QualityPreference, SharedPreferences};

/// Downloads adaptive playlists segment by segment.
#[derive(Debug, Clone)]
pub struct AdaptiveTransport {
    http: HttpClient,
    preferences: SharedPreferences,
}

impl AdaptiveTransport {
    #[must_use]
    pub fn new(http: HttpClient, preferences: SharedPreferences) -> Self {
        Self { http, preferences }
    }

    async fn fetch_playlist(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<(Playlist, String), DownloadError> {
        let text = self.http.fetch_text(url, headers).await?;
        let playlist = m3u8_rs::parse_playlist_res(text.as_bytes())
            .map_err(|_| DownloadError::decode(url, "not a valid HLS playlist"))?;
        Ok((playlist, text))
    }

    /// Resolves `url` to a media playlist and the URL its segments are relative to.
    async fn media_playlist(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<(MediaPlaylist, String), DownloadError> {
        match self.fetch_playlist(url, headers).await? {
            (Playlist::MediaPlaylist(media), _) => Ok((media, url.to_string())),
            (Playlist::MasterPlaylist(master), text) => {
                let variant_url = self.choose_variant(url, &text).or_else(|| {
                    master
                        .variants
                        .iter()
                        .find(|v| !v.is_i_frame)
                        .map(|v| join(url, &v.uri))
                });
                let Some(variant_url) = variant_url else {
                    return Err(DownloadError::unsupported(
                        url,
                        "master playlist has no variant streams",
                    ));
                };
                debug!(variant = %variant_url, "selected variant playlist");
                match self.fetch_playlist(&variant_url, headers).await? {
                    (Playlist::MediaPlaylist(media), _) => Ok((media, variant_url)),
                    (Playlist::MasterPlaylist(_), _) => Err(DownloadError::unsupported(
                        &variant_url,
                        "variant playlist is itself a master playlist",
                    )),
                }
            }
        }
    }

    /// Applies the quality preference; Auto means the best concrete variant here.
    fn choose_variant(&self, manifest_url: &str, text: &str) -> Option<String> {
        let variants = parse_manifest(text, manifest_url);
        let preference = match self.preferences.quality_preference() {
            QualityPreference::Auto | QualityPreference::Unknown => QualityPreference::Best,
            other => other,
        };
        select_variant(&variants, preference)
            .filter(|variant| !variant.is_auto())
            .map(|variant| variant.url.clone())
    }
}

fn join(base: &str, uri: &str) -> String {
    Url::parse(base)
        .and_then(|base| base.join(uri))
        .map_or_else(|_| uri.to_string(), String::from)
}

#[async_trait]
impl Transport for AdaptiveTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Adaptive
    }

    #[instrument(skip(self, job, progress), fields(job_id = %job.id, path = %destination.display()))]
    async fn transfer(
        &self,
        job: &DownloadJob,
        destination: &Path,
        progress: TransportProgress,
    ) -> Result<u64, DownloadError> {
        let (media, media_url) = self.media_playlist(&job.source_url, &job.headers).await?;
        if media.segments.is_empty() {
            return Err(DownloadError::unsupported(
                &media_url,
                "media playlist has no segments",
            ));
        }
        if media
            .segments
            .iter()
            .filter_map(|segment| segment.key.as_ref())
            .any(|key| key.method != KeyMethod::None)
        {
            return Err(DownloadError::unsupported(
                &media_url,
                "encrypted segments are not supported",
            ));
        }

        prepare_parent(destination).await?;
        let partial = partial_path(destination);
        let result = self
            .write_segments(&media, &media_url, &job.headers, &partial, &progress)
            .await;

        match result {
            Ok(bytes) => {
                if let Err(e) = finalize(&partial, destination).await {
                    discard_partial(&partial).await;
                    return Err(e);
                }
                info!(bytes, segments = media.segments.len(), "adaptive transfer complete");
                Ok(bytes)
            }
            Err(e) => {
                discard_partial(&partial).await;
                Err(e)
            }
        }
    }
}

impl AdaptiveTransport {
    async fn write_segments(
        &self,
        media: &MediaPlaylist,
        media_url: &str,
        headers: &RequestHeaders,
        partial: &Path,
        progress: &TransportProgress,
    ) -> Result<u64, DownloadError> {
        let file = File::create(partial)
            .await
            .map_err(|e| DownloadError::io(partial, e))?;
        let mut writer = BufWriter::new(file);
        let total = media.segments.len();
        let mut written = 0u64;

        for (index, segment) in media.segments.iter().enumerate() {
            let segment_url = join(media_url, &segment.uri);
            written += self
                .http
                .append_to_writer(&segment_url, headers, &mut writer, partial)
                .await?;
            #[allow(clippy::cast_precision_loss)]
            progress((index + 1) as f64 / total as f64);
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(partial, e))?;
        Ok(written)
    }
}
