//! Output path derivation for downloaded media.

use std::path::{Component, Path, PathBuf};

use super::job::{DownloadJob, JobKind};
use super::transport::TransportKind;

/// Replaces characters that are invalid on common filesystems.
///
/// Separators, control characters, and `: * ? " < > |` become `_`; a name
/// made only of dots (or empty) becomes `_`.
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    let sanitized: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }
    if is_safe_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// File extension for a transport.
#[must_use]
pub(crate) fn extension_for(kind: TransportKind, source_url: &str) -> &'static str {
    match kind {
        TransportKind::Adaptive => "ts",
        TransportKind::Progressive => {
            let path = url::Url::parse(source_url)
                .map(|u| u.path().to_ascii_lowercase())
                .unwrap_or_default();
            if path.ends_with(".mkv") {
                "mkv"
            } else if path.ends_with(".webm") {
                "webm"
            } else {
                "mp4"
            }
        }
    }
}

/// Final location of a job's media file under `root`.
///
/// Episodes go to `<show>/S<ss>E<ee> - <title>.<ext>`, movies to `<title>.<ext>`.
#[must_use]
pub fn output_path(root: &Path, job: &DownloadJob, kind: TransportKind) -> PathBuf {
    let ext = extension_for(kind, &job.source_url);
    let metadata = &job.metadata;
    let title = sanitize_component(&metadata.title);

    match job.kind {
        JobKind::Movie => root.join(format!("{title}.{ext}")),
        JobKind::Episode => {
            let show = metadata
                .show_title
                .as_deref()
                .map_or_else(|| title.clone(), sanitize_component);
            let season = metadata.season.unwrap_or(1);
            let episode = metadata.episode.unwrap_or(0);
            root.join(show)
                .join(format!("S{season:02}E{episode:02} - {title}.{ext}"))
        }
    }
}

/// Path of the in-progress file for `final_path`.
#[must_use]
pub(crate) fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

/// Path used for a subtitle that accompanies `media_path`.
#[must_use]
pub(crate) fn subtitle_path(media_path: &Path, subtitle_url: &str) -> PathBuf {
    let ext = url::Url::parse(subtitle_url)
        .ok()
        .and_then(|u| {
            u.path()
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
        })
        .filter(|ext| matches!(ext.as_str(), "vtt" | "srt" | "ass"))
        .unwrap_or_else(|| "vtt".to_string());
    media_path.with_extension(ext)
}
