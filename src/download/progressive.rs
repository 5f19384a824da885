//! Single-request transport for plain media files.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::client::HttpClient;
use super::error::DownloadError;
use super::job::DownloadJob;
use super::naming::partial_path;
use super::transport::{
    Transport, TransportKind, TransportProgress, discard_partial, finalize, prepare_parent,
};

/// Streams the source URL straight to disk.
#[derive(Debug, Clone)]
pub struct ProgressiveTransport {
    http: HttpClient,
}

impl ProgressiveTransport {
    #[must_use]
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for ProgressiveTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Progressive
    }

    #[instrument(skip(self, job, progress), fields(job_id = %job.id, path = %destination.display()))]
    async fn transfer(
        &self,
        job: &DownloadJob,
        destination: &Path,
        progress: TransportProgress,
    ) -> Result<u64, DownloadError> {
        prepare_parent(destination).await?;
        let partial = partial_path(destination);

        let report = move |written: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|t| *t > 0) {
                #[allow(clippy::cast_precision_loss)]
                progress((written as f64 / total as f64).min(1.0));
            }
        };
        let bytes = self
            .http
            .download_to_path(&job.source_url, &job.headers, &partial, &report)
            .await?;

        if let Err(e) = finalize(&partial, destination).await {
            discard_partial(&partial).await;
            return Err(e);
        }
        info!(bytes, "progressive transfer complete");
        Ok(bytes)
    }
}
