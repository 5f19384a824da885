//! Streamfetch Core Library
//!
//! Hosts third-party scraping modules, resolves the stream URLs they expose,
//! and downloads the results through a bounded queue.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`script`] - Module loading, entrypoint lookup, and completion normalization
//! - [`resolver`] - Fixed-priority stream resolution with request deduplication
//! - [`manifest`] - Adaptive-bitrate manifest parsing and quality selection
//! - [`download`] - Download queue, transports, and the HTTP client
//! - [`records`] - Persisted records of completed downloads
//! - [`retry`] - Shared exponential-backoff combinator
//! - [`fetch_cache`] - Deduplicated, cached metadata fetches
//! - [`preferences`] / [`logging`] - Collaborator interfaces

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod download;
pub mod fetch_cache;
pub mod flight;
pub mod logging;
pub mod manifest;
pub mod preferences;
pub mod records;
pub mod resolver;
pub mod retry;
pub mod script;

// Re-export commonly used types
pub use download::{
    DownloadError, DownloadEvent, DownloadJob, HttpClient, JobKind, JobMetadata, JobRequest,
    Orchestrator, OrchestratorError, OrchestratorHandle, QueueStatus,
};
pub use logging::{LogSink, Severity, SharedLogSink};
pub use manifest::{ManifestVariant, fetch_variants, select_variant};
pub use preferences::{Preferences, QualityPreference, SharedPreferences};
pub use records::{DownloadRecord, RecordStore};
pub use resolver::{ResolveError, StreamResolutionResult, StreamResolver};
pub use retry::{RetryError, RetryPolicy};
pub use script::{Module, ModuleSession, ScriptError, ScriptHost};
