//! Error types for stream resolution.
//!
//! Errors surfaced to callers follow the What/Why/Fix pattern used across
//! the project; classification errors stay internal to the fallback loop
//! and to catalogue parsing.

use thiserror::Error;

/// Why a payload could not be turned into streams or catalogue entries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    /// The payload was null, empty, or an empty string.
    #[error("module returned an empty payload")]
    EmptyPayload,

    /// The payload is the string form of a future that was never awaited.
    #[error("module returned an unresolved future ({placeholder})")]
    UnresolvedFuture {
        /// The placeholder text found in the payload.
        placeholder: String,
    },

    /// The payload has an unexpected shape.
    #[error("module returned a malformed payload: {reason}")]
    Malformed {
        /// What was wrong with it.
        reason: String,
    },
}

impl ClassificationError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Errors returned by [`StreamResolver::resolve`](super::StreamResolver::resolve).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The module does not define `extractStreamUrl`.
    #[error(
        "module '{module}' cannot extract streams\n  Suggestion: Use a module that defines extractStreamUrl"
    )]
    Unsupported {
        /// The module id.
        module: String,
    },

    /// Every applicable method ran and none produced a stream.
    #[error(
        "stream not found for '{episode}' with module '{module}': tried {tried_count} method(s){}\n  Suggestion: The episode may be unavailable; try another module",
        failure_suffix(.last_failure)
    )]
    Exhausted {
        /// The module id.
        module: String,
        /// The episode reference.
        episode: String,
        /// Number of methods that were tried.
        tried_count: usize,
        /// Description of the last method failure.
        last_failure: Option<String>,
    },

    /// The module was replaced while the request was running.
    #[error("module session (generation {generation}) was replaced during resolution")]
    Discarded {
        /// Generation of the discarded session.
        generation: u64,
    },

    /// The resolution task ended without a result.
    #[error("resolution for '{episode}' was aborted")]
    Aborted {
        /// The episode reference.
        episode: String,
    },
}

fn failure_suffix(last_failure: &Option<String>) -> String {
    last_failure
        .as_deref()
        .map(|f| format!(", last failure: {f}"))
        .unwrap_or_default()
}

impl ResolveError {
    #[must_use]
    pub fn unsupported(module: &str) -> Self {
        Self::Unsupported {
            module: module.to_string(),
        }
    }

    #[must_use]
    pub fn exhausted(
        module: &str,
        episode: &str,
        tried_count: usize,
        last_failure: Option<String>,
    ) -> Self {
        Self::Exhausted {
            module: module.to_string(),
            episode: episode.to_string(),
            tried_count,
            last_failure,
        }
    }

    #[must_use]
    pub fn aborted(episode: &str) -> Self {
        Self::Aborted {
            episode: episode.to_string(),
        }
    }

    /// Returns true if no stream was found (as opposed to a host-side failure).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Unsupported { .. })
    }
}
