//! Download queue, transports, and HTTP plumbing.
//!
//! A resolved stream becomes a [`DownloadJob`] admitted to the
//! [`Orchestrator`], which runs at most `max_concurrent_downloads` transfers
//! at once. Each transfer picks a [`Transport`]: segment concatenation for
//! adaptive playlists or a single streaming GET for progressive files.
//!
//! # Example
//!
//! ```no_run
//! use streamfetch_core::download::{JobKind, JobMetadata, JobRequest, Orchestrator};
//! use streamfetch_core::preferences::{Preferences, SharedPreferences};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let prefs = SharedPreferences::new(Preferences::default());
//! let handle = Orchestrator::builder(prefs).spawn().await?;
//! let id = handle
//!     .enqueue(JobRequest::new(
//!         "https://cdn.example/movie.mp4",
//!         JobKind::Movie,
//!         JobMetadata::titled("Movie"),
//!     ))
//!     .await?;
//! println!("queued {id}");
//! # Ok(())
//! # }
//! ```

mod adaptive;
mod client;
mod error;
mod job;
mod naming;
mod orchestrator;
mod progressive;
mod transport;

pub use adaptive::AdaptiveTransport;
pub use client::{
    ByteProgress, CONNECT_TIMEOUT_SECS, DEFAULT_USER_AGENT, HttpClient, READ_TIMEOUT_SECS,
    RawResponse, RequestHeaders, build_header_map,
};
pub use error::{DownloadError, classify_error};
pub use job::{DownloadJob, JobId, JobKind, JobMetadata, JobRequest, QueueStatus};
pub use naming::{output_path, sanitize_component};
pub use orchestrator::{
    DownloadEvent, FailureEntry, Orchestrator, OrchestratorBuilder, OrchestratorError,
    OrchestratorHandle,
};
pub use progressive::ProgressiveTransport;
pub use transport::{Transport, TransportKind, TransportProgress};
