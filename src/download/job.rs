//! Download job types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::RequestHeaders;
use crate::script::StreamType;

/// Identifier of a download job.
pub type JobId = Uuid;

/// Status of a job in the orchestrator queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a free transfer slot.
    Queued,
    /// Transfer in progress.
    Downloading,
    /// Transfer finished and recorded.
    Completed,
    /// Failed after the retry budget was exhausted.
    Failed,
}

impl QueueStatus {
    /// Returns the stable string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for statuses that never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only transitions: `queued → downloading → {completed | failed}`.
    #[must_use]
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Downloading)
                | (Self::Downloading, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid queue status: {s}")),
        }
    }
}

/// What kind of media a job downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Movie,
    Episode,
}

/// Descriptive metadata carried from resolution into the persisted record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_poster_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_poster_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_url: Option<String>,
}

impl JobMetadata {
    /// Creates metadata with only a title.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Human readable name, e.g. `Show - S01E02 - Title`.
    #[must_use]
    pub fn display_name(&self) -> String {
        match (&self.show_title, self.season, self.episode) {
            (Some(show), Some(season), Some(episode)) => {
                format!("{show} - S{season:02}E{episode:02} - {}", self.title)
            }
            (Some(show), None, Some(episode)) => format!("{show} - E{episode:02} - {}", self.title),
            _ => self.title.clone(),
        }
    }
}

/// Everything needed to admit a job to the queue.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub source_url: String,
    pub headers: RequestHeaders,
    pub kind: JobKind,
    pub metadata: JobMetadata,
    /// Stream type declared by the module that produced the URL.
    pub declared_stream_type: Option<StreamType>,
}

impl JobRequest {
    #[must_use]
    pub fn new(source_url: impl Into<String>, kind: JobKind, metadata: JobMetadata) -> Self {
        Self {
            source_url: source_url.into(),
            headers: RequestHeaders::new(),
            kind,
            metadata,
            declared_stream_type: None,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: RequestHeaders) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_stream_type(mut self, stream_type: StreamType) -> Self {
        self.declared_stream_type = Some(stream_type);
        self
    }
}

/// A tracked download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub id: JobId,
    pub source_url: String,
    pub headers: RequestHeaders,
    pub kind: JobKind,
    pub metadata: JobMetadata,
    pub declared_stream_type: Option<StreamType>,
    pub status: QueueStatus,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    /// Last failure message shown on the job row.
    pub error_message: Option<String>,
}

impl DownloadJob {
    #[must_use]
    pub fn from_request(request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: request.source_url,
            headers: request.headers,
            kind: request.kind,
            metadata: request.metadata,
            declared_stream_type: request.declared_stream_type,
            status: QueueStatus::Queued,
            progress: 0.0,
            error_message: None,
        }
    }

    /// Moves to `next` if the transition is allowed; returns whether it happened.
    pub fn advance(&mut self, next: QueueStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Records progress, clamped to `[0, 1]` and never decreasing.
    pub fn set_progress(&mut self, fraction: f64) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if fraction > self.progress {
            self.progress = fraction;
        }
    }
}
