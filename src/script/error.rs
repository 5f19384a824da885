//! Error types for module script execution.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or calling a module script.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// The module does not define the requested entrypoint.
    #[error("entrypoint '{name}' is not defined by the module")]
    NotFound {
        /// The entrypoint name.
        name: String,
    },

    /// The entrypoint threw or its future rejected.
    #[error("module raised an exception in '{name}': {message}")]
    Exception {
        /// The entrypoint name.
        name: String,
        /// Message reported by the script.
        message: String,
    },

    /// No completion arrived before the watchdog fired.
    #[error("'{name}' did not complete within {}ms", after.as_millis())]
    Timeout {
        /// The entrypoint name.
        name: String,
        /// The watchdog duration.
        after: Duration,
    },

    /// Script evaluation failed while loading the module.
    #[error("module script could not be loaded: {reason}")]
    Invalid {
        /// Why evaluation failed.
        reason: String,
    },

    /// The call targeted an environment that has since been replaced.
    #[error("module environment (generation {generation}) was discarded")]
    Discarded {
        /// Generation of the discarded environment.
        generation: u64,
    },
}

impl ScriptError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn exception(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exception {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn timeout(name: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            name: name.into(),
            after,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn discarded(generation: u64) -> Self {
        Self::Discarded { generation }
    }
}
