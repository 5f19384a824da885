//! Write-only logging sink used for module output and user-facing notices.
//!
//! Sink calls are fire-and-forget: nothing returned from a sink can influence
//! resolution or download control flow.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

/// Severity attached to a sink message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Returns the stable lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for `(message, severity)` pairs.
pub trait LogSink: fmt::Debug + Send + Sync {
    /// Records a message. Must not block or panic.
    fn log(&self, message: &str, severity: Severity);
}

/// Default sink forwarding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Debug => debug!(target: "streamfetch::sink", "{message}"),
            Severity::Info => info!(target: "streamfetch::sink", "{message}"),
            Severity::Warning => warn!(target: "streamfetch::sink", "{message}"),
            Severity::Error => error!(target: "streamfetch::sink", "{message}"),
        }
    }
}

/// Sink that keeps every message in memory. Useful for tests and for
/// surfacing recent notices to a front end.
#[derive(Debug, Default, Clone)]
pub struct MemoryLogSink {
    entries: Arc<Mutex<Vec<(String, Severity)>>>,
}

impl MemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded messages.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Severity)> {
        self.entries
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Returns true if any recorded message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.entries().iter().any(|(msg, _)| msg.contains(needle))
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, message: &str, severity: Severity) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.push((message.to_string(), severity));
        }
    }
}

/// Shared handle type used across components.
pub type SharedLogSink = Arc<dyn LogSink>;

/// Returns the default tracing-backed sink.
#[must_use]
pub fn default_sink() -> SharedLogSink {
    Arc::new(TracingLogSink)
}
