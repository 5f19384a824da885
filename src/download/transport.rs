//! Transfer strategies for a single job.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::error::DownloadError;
use super::job::DownloadJob;
use crate::script::StreamType;

/// Progress callback receiving the completed fraction in `[0, 1]`.
pub type TransportProgress = Arc<dyn Fn(f64) + Send + Sync>;

/// How a job's bytes are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Segmented playlist (`.m3u8`), concatenated into one file.
    Adaptive,
    /// One streaming GET of a plain media file.
    Progressive,
}

impl TransportKind {
    /// Chooses the transport from the URL, then the declared stream type.
    ///
    /// Unrecognized URLs without a declared type use [`Self::Adaptive`].
    #[must_use]
    pub fn select(url: &str, declared: Option<StreamType>) -> Self {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());

        if path.ends_with(".m3u8") {
            return Self::Adaptive;
        }
        if [".mp4", ".mkv", ".webm", ".m4v"]
            .iter()
            .any(|ext| path.ends_with(ext))
        {
            return Self::Progressive;
        }
        match declared {
            Some(StreamType::Mp4 | StreamType::Direct) => Self::Progressive,
            Some(StreamType::Hls) | None => Self::Adaptive,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adaptive => "adaptive",
            Self::Progressive => "progressive",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Moves a job's media into `destination`.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Downloads `job` to `destination`, returning the bytes written.
    ///
    /// Data is written to a `.part` sibling and renamed into place on
    /// success; a failed transfer leaves no file at `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for network, playlist, or disk failures.
    async fn transfer(
        &self,
        job: &DownloadJob,
        destination: &Path,
        progress: TransportProgress,
    ) -> Result<u64, DownloadError>;
}

/// Creates the parent directory of `path`.
pub(crate) async fn prepare_parent(path: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }
    Ok(())
}

/// Renames a finished `.part` file to its final name.
pub(crate) async fn finalize(partial: &Path, destination: &Path) -> Result<(), DownloadError> {
    tokio::fs::rename(partial, destination)
        .await
        .map_err(|e| DownloadError::io(destination, e))?;
    debug!(path = %destination.display(), "transfer finalized");
    Ok(())
}

/// Removes a leftover `.part` file, ignoring errors.
pub(crate) async fn discard_partial(partial: &Path) {
    if tokio::fs::remove_file(partial).await.is_ok() {
        debug!(path = %partial.display(), "removed partial file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_prefers_url_extension() {
        assert_eq!(
            TransportKind::select("https://cdn.example/a/master.m3u8?token=1", Some(StreamType::Mp4)),
            TransportKind::Adaptive
        );
        assert_eq!(
            TransportKind::select("https://cdn.example/a/ep1.MP4", Some(StreamType::Hls)),
            TransportKind::Progressive
        );
    }

    #[test]
    fn test_select_uses_declared_type_then_falls_back() {
        assert_eq!(
            TransportKind::select("https://cdn.example/play?id=7", Some(StreamType::Direct)),
            TransportKind::Progressive
        );
        assert_eq!(
            TransportKind::select("https://cdn.example/play?id=7", None),
            TransportKind::Adaptive
        );
    }
}
