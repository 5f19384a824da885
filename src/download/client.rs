//! HTTP client wrapper shared by manifest fetches, transports, and caches.
//!
//! Every request carries the module-supplied headers for the stream, runs
//! under bounded connect/read timeouts, and maps failures into
//! [`DownloadError`] with the URL attached.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::error::DownloadError;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default User-Agent sent when a module does not override it.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15";

/// Request headers supplied by a module for one stream.
pub type RequestHeaders = BTreeMap<String, String>;

/// Progress callback: `(bytes_written, total_bytes_if_known)`.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// A response returned as-is, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: RequestHeaders,
    pub body: String,
}

/// HTTP client with connection pooling; cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    /// Optional per-request timeout for small text/metadata fetches.
    fetch_timeout: Option<Duration>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
        .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::TransferFailed`] if the client cannot be built.
    pub fn with_timeouts(connect: Duration, read: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(connect)
            .timeout(read)
            .gzip(true)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| DownloadError::transfer_failed("<client>", e.to_string()))?;
        Ok(Self {
            client,
            fetch_timeout: None,
        })
    }

    /// Bounds text and byte fetches (manifests, documents, artwork) by `timeout`.
    ///
    /// Streaming downloads keep the client's read timeout.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Fetches a document as text.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for invalid URLs, network failures,
    /// timeouts, non-success statuses, and undecodable bodies.
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn fetch_text(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<String, DownloadError> {
        let response = self.send(url, headers, self.fetch_timeout).await?;
        response
            .text()
            .await
            .map_err(|e| DownloadError::decode(url, e.to_string()))
    }

    /// Fetches a document as raw bytes.
    ///
    /// # Errors
    ///
    /// Same as [`fetch_text`](Self::fetch_text).
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn fetch_bytes(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<Vec<u8>, DownloadError> {
        let response = self.send(url, headers, self.fetch_timeout).await?;
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| DownloadError::network(url, e))
    }

    /// Sends an arbitrary request on behalf of a module script.
    ///
    /// Non-success statuses are returned, not raised, so the script can
    /// inspect them.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for invalid URLs or methods, invalid
    /// headers, network failures, and timeouts.
    #[instrument(skip(self, headers, body), fields(url = %url, method = %method))]
    pub async fn fetch_response(
        &self,
        method: &str,
        url: &str,
        headers: &RequestHeaders,
        body: Option<String>,
    ) -> Result<RawResponse, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let method = reqwest::Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| DownloadError::transfer_failed(url, format!("invalid method '{method}'")))?;

        let mut request = self
            .client
            .request(method, url)
            .headers(build_header_map(url, headers)?);
        if let Some(body) = body {
            request = request.body(body);
        }
        if let Some(timeout) = self.fetch_timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::decode(url, e.to_string()))?;
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    /// Streams `url` into `file_path`, reporting progress after each chunk.
    ///
    /// A failed transfer removes the partially written file.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when writing fails, otherwise the same
    /// errors as [`fetch_text`](Self::fetch_text).
    #[instrument(skip(self, headers, progress), fields(url = %url, path = %file_path.display()))]
    pub async fn download_to_path(
        &self,
        url: &str,
        headers: &RequestHeaders,
        file_path: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64, DownloadError> {
        let response = self.send(url, headers, None).await?;
        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let file = File::create(file_path)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        let result = stream_to_file(file, response, url, file_path, total, progress).await;
        if result.is_err() {
            debug!(path = %file_path.display(), "cleaning up partial file after error");
            let _ = tokio::fs::remove_file(file_path).await;
        }
        result
    }

    /// Appends the body of `url` to an already open writer, returning bytes written.
    ///
    /// # Errors
    ///
    /// Same as [`download_to_path`](Self::download_to_path).
    pub async fn append_to_writer(
        &self,
        url: &str,
        headers: &RequestHeaders,
        writer: &mut BufWriter<File>,
        file_path: &Path,
    ) -> Result<u64, DownloadError> {
        let response = self.send(url, headers, None).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::network(url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(file_path, e))?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    async fn send(
        &self,
        url: &str,
        headers: &RequestHeaders,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut request = self.client.get(url).headers(build_header_map(url, headers)?);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }
        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Converts module-supplied headers into a [`HeaderMap`].
///
/// # Errors
///
/// Returns [`DownloadError::InvalidHeader`] for names or values that are not valid HTTP.
pub fn build_header_map(url: &str, headers: &RequestHeaders) -> Result<HeaderMap, DownloadError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| DownloadError::invalid_header(url, name))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| DownloadError::invalid_header(url, name))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    total: Option<u64>,
    progress: ByteProgress<'_>,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;
        bytes_written += chunk.len() as u64;
        progress(bytes_written, total);
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}
