//! Error types for the download module.
//!
//! Network failures (timeouts, bad statuses, undecodable bodies) and transfer
//! failures (segment playlists, disk writes) share one enum so the retry
//! classifier sees every failure a transport can produce.

use std::path::PathBuf;

use thiserror::Error;

use crate::retry::FailureType;

/// Errors that can occur while fetching or transferring media.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Response body could not be decoded as expected.
    #[error("could not decode response from {url}: {reason}")]
    Decode {
        /// The URL whose body was invalid.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// File system error while writing media to disk.
    #[error("disk write failed for {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A transfer could not complete for a reason other than the network.
    #[error("transfer failed for {url}: {reason}")]
    TransferFailed {
        /// The source URL of the transfer.
        url: String,
        /// Why the transfer failed.
        reason: String,
    },

    /// The source is well formed but uses a feature this downloader does not
    /// handle, such as encrypted segments. Retrying cannot help.
    #[error("unsupported source {url}: {reason}")]
    Unsupported {
        /// The URL of the offending resource.
        url: String,
        /// What is not supported.
        reason: String,
    },

    /// A header name or value supplied by a module is not valid HTTP.
    #[error("invalid header '{name}' for {url}")]
    InvalidHeader {
        /// The request URL.
        url: String,
        /// The offending header name.
        name: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, mapping timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a decode error.
    pub fn decode(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO (disk write) error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a transfer failure.
    pub fn transfer_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unsupported source error.
    pub fn unsupported(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid header error.
    pub fn invalid_header(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self::InvalidHeader {
            url: url.into(),
            name: name.into(),
        }
    }
}

/// Classifies a download error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Timeout, Network | Transient |
/// | HTTP 408, 5xx | Transient |
/// | HTTP 429 | RateLimited |
/// | other HTTP 4xx | Permanent |
/// | Decode, TransferFailed | Transient |
/// | Io, InvalidUrl, Unsupported, InvalidHeader | Permanent |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. }
        | DownloadError::Network { .. }
        | DownloadError::Decode { .. }
        | DownloadError::TransferFailed { .. } => FailureType::Transient,
        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::Unsupported { .. }
        | DownloadError::InvalidHeader { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,   // Request Timeout
        429 => FailureType::RateLimited, // Too Many Requests
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}
