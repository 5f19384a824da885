//! Stream resolution: from an episode reference to playable stream URLs.
//!
//! # Architecture
//!
//! - [`StreamResolver`] runs the fixed-priority method loop for one request
//!   and deduplicates concurrent requests by [`ResolutionRequest::fingerprint`]
//! - [`classify_payload`] normalizes whatever the module returned into a
//!   [`StreamResolutionResult`]
//! - [`ResolveError`] is the only error that leaves this module; per-method
//!   failures advance the loop instead of surfacing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamfetch_core::download::HttpClient;
//! use streamfetch_core::logging::default_sink;
//! use streamfetch_core::resolver::StreamResolver;
//! use streamfetch_core::script::{Module, ModuleFlags, NativeEngine, ScriptHost};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let host = ScriptHost::new(Arc::new(NativeEngine::new()), HttpClient::new(), default_sink());
//! let session = host.load(Module::new("demo", "demo", ModuleFlags::default()))?;
//! let resolver = StreamResolver::new(HttpClient::new(), default_sink());
//! let result = resolver.resolve(&session, "https://site.example/ep/1", false).await?;
//! println!("{} stream(s)", result.variants.len());
//! # Ok(())
//! # }
//! ```

mod classify;
mod error;
mod protocol;

pub use classify::{UNRESOLVED_FUTURE_PLACEHOLDER, classify_payload, decode_payload};
pub use error::{ClassificationError, ResolveError};
pub use protocol::{ResolutionMethod, StreamResolver};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::download::RequestHeaders;

/// One playable stream URL with the headers needed to fetch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamVariant {
    pub url: String,
    pub headers: RequestHeaders,
    /// Label supplied by the module, e.g. `SUB` or `1080p`.
    pub title: Option<String>,
}

impl StreamVariant {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: RequestHeaders::new(),
            title: None,
        }
    }
}

/// A soft-subtitle file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtitleTrack {
    pub url: String,
}

/// Shape of the raw payload a result was classified from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    SingleString,
    Array,
    Object,
}

/// Normalized output of a module's stream extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamResolutionResult {
    /// In module order.
    pub variants: Vec<StreamVariant>,
    pub subtitles: Vec<SubtitleTrack>,
    pub payload_kind: PayloadKind,
}

impl StreamResolutionResult {
    /// Returns true when no stream variant was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// First variant, which callers play or download by default.
    #[must_use]
    pub fn primary(&self) -> Option<&StreamVariant> {
        self.variants.first()
    }
}

/// Identity of a resolution request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionRequest {
    pub module_id: String,
    /// Load generation of the session issuing the request.
    pub generation: u64,
    pub episode_ref: String,
    pub softsub: bool,
}

impl ResolutionRequest {
    #[must_use]
    pub fn new(
        module_id: impl Into<String>,
        generation: u64,
        episode_ref: impl Into<String>,
        softsub: bool,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            generation,
            episode_ref: episode_ref.into(),
            softsub,
        }
    }

    /// Hex SHA-256 over the module id, session generation, episode
    /// reference, and soft-sub flag.
    ///
    /// Sessions from different loads never share a fingerprint, so a request
    /// made after a reload cannot join a flight bound to the replaced session.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.module_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.generation.to_be_bytes());
        hasher.update(self.episode_ref.as_bytes());
        hasher.update([0u8, u8::from(self.softsub)]);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = ResolutionRequest::new("mod", 1, "https://site.example/ep/1", false);
        let b = ResolutionRequest::new("mod", 1, "https://site.example/ep/1", false);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        assert!(a.fingerprint().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_distinguishes_fields() {
        let base = ResolutionRequest::new("mod", 1, "ep", false);
        assert_ne!(
            base.fingerprint(),
            ResolutionRequest::new("mod", 1, "ep", true).fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            ResolutionRequest::new("mo", 1, "dep", false).fingerprint()
        );
    }

    #[test]
    fn test_fingerprint_changes_with_generation() {
        let before = ResolutionRequest::new("mod", 1, "ep", false);
        let after = ResolutionRequest::new("mod", 2, "ep", false);
        assert_ne!(before.fingerprint(), after.fingerprint());
    }
}
