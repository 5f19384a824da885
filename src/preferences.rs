//! Runtime preferences read by the resolver and the download orchestrator.
//!
//! The preference store is an external collaborator; this module only
//! defines the values it exposes and a shared, updatable in-process store.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of simultaneous transfers.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Upper bound accepted for the concurrency preference.
pub const MAX_CONCURRENT_DOWNLOADS_LIMIT: usize = 20;

/// Default resolution watchdog.
pub const DEFAULT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay before a failed job row is dismissed.
pub const DEFAULT_FAILURE_GRACE_DELAY: Duration = Duration::from_secs(5);

/// Preferred playback quality used when choosing a manifest variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreference {
    #[default]
    Best,
    High,
    Medium,
    Low,
    Auto,
    /// Any unrecognized stored value.
    Unknown,
}

impl QualityPreference {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Auto => "auto",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a stored preference; unrecognized values map to [`Self::Unknown`].
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for QualityPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" => Ok(Self::Best),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "auto" => Ok(Self::Auto),
            other => Err(format!("invalid quality preference: {other}")),
        }
    }
}

/// Plain preference values.
#[derive(Debug, Clone)]
pub struct Preferences {
    pub quality_preference: QualityPreference,
    pub max_concurrent_downloads: usize,
    /// Retries after the initial attempt.
    pub max_retry_attempts: u32,
    pub initial_retry_delay: Duration,
    pub resolution_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub failure_grace_delay: Duration,
    pub download_dir: PathBuf,
    pub records_path: PathBuf,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            quality_preference: QualityPreference::default(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_retry_attempts: crate::retry::DEFAULT_MAX_RETRIES,
            initial_retry_delay: crate::retry::DEFAULT_INITIAL_DELAY,
            resolution_timeout: DEFAULT_RESOLUTION_TIMEOUT,
            connect_timeout: Duration::from_secs(crate::download::CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(crate::download::READ_TIMEOUT_SECS),
            failure_grace_delay: DEFAULT_FAILURE_GRACE_DELAY,
            download_dir: PathBuf::from("downloads"),
            records_path: PathBuf::from("downloads").join("records.json"),
        }
    }
}

/// Read-only view of the preference store.
pub trait PreferenceStore: Send + Sync {
    fn quality_preference(&self) -> QualityPreference;
    fn max_concurrent_downloads(&self) -> usize;
}

impl PreferenceStore for Preferences {
    fn quality_preference(&self) -> QualityPreference {
        self.quality_preference
    }

    fn max_concurrent_downloads(&self) -> usize {
        self.max_concurrent_downloads
    }
}

/// Cloneable store whose values can change while the process runs.
#[derive(Debug, Clone, Default)]
pub struct SharedPreferences {
    inner: Arc<RwLock<Preferences>>,
}

impl SharedPreferences {
    #[must_use]
    pub fn new(preferences: Preferences) -> Self {
        Self {
            inner: Arc::new(RwLock::new(preferences)),
        }
    }

    /// Returns a copy of the current values.
    #[must_use]
    pub fn snapshot(&self) -> Preferences {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn set_quality_preference(&self, preference: QualityPreference) {
        if let Ok(mut guard) = self.inner.write() {
            guard.quality_preference = preference;
        }
    }

    /// Updates the concurrency preference, clamped to `1..=MAX_CONCURRENT_DOWNLOADS_LIMIT`.
    pub fn set_max_concurrent_downloads(&self, value: usize) {
        if let Ok(mut guard) = self.inner.write() {
            guard.max_concurrent_downloads = value.clamp(1, MAX_CONCURRENT_DOWNLOADS_LIMIT);
        }
    }
}

impl PreferenceStore for SharedPreferences {
    fn quality_preference(&self) -> QualityPreference {
        self.snapshot().quality_preference
    }

    fn max_concurrent_downloads(&self) -> usize {
        self.snapshot().max_concurrent_downloads
    }
}
