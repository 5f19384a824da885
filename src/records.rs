//! Persisted download records.
//!
//! The record file is a JSON array that is read in full on open and
//! rewritten on every mutation through a temp file and rename, so a crash
//! mid-write leaves the previous contents intact.
//!
//! Reads never wait on the file: writers are serialized by their own lock and
//! swap the in-memory list only after the new file is in place.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::download::{JobKind, JobMetadata};

/// Errors from reading or writing the record file.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to access record file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize download records: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl RecordError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Terminal state of a completed download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: Uuid,
    pub name: String,
    pub download_date: DateTime<Utc>,
    #[serde(rename = "originalURL")]
    pub original_url: String,
    #[serde(rename = "localURL")]
    pub local_url: PathBuf,
    pub kind: JobKind,
    pub metadata: JobMetadata,
    #[serde(
        rename = "subtitleURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub subtitle_url: Option<String>,
    #[serde(
        rename = "localSubtitleURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub local_subtitle_url: Option<PathBuf>,
}

/// File-backed collection of [`DownloadRecord`]s.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    records: RwLock<Vec<DownloadRecord>>,
    writer: Mutex<()>,
}

impl RecordStore {
    /// Loads the record file at `path`; a missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Io`] if the file cannot be read and
    /// [`RecordError::Corrupt`] if it is not a JSON record array.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| RecordError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(RecordError::io(&path, e)),
        };
        debug!(count = records.len(), "loaded download records");
        Ok(Self {
            path,
            records: RwLock::new(records),
            writer: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts `record`, replacing any record with the same id or source URL.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the file cannot be rewritten; the in-memory
    /// state is left unchanged in that case.
    #[instrument(skip(self, record), fields(id = %record.id, name = %record.name))]
    pub async fn upsert(&self, record: DownloadRecord) -> Result<(), RecordError> {
        let _writer = self.writer.lock().await;
        let mut next = self.all();
        next.retain(|r| r.id != record.id && r.original_url != record.original_url);
        next.push(record);
        self.persist(&next).await?;
        self.replace(next);
        info!("download record saved");
        Ok(())
    }

    /// Sets the local subtitle path of record `id`.
    ///
    /// Returns whether a record was updated.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the file cannot be rewritten.
    pub async fn set_local_subtitle(&self, id: Uuid, path: PathBuf) -> Result<bool, RecordError> {
        let _writer = self.writer.lock().await;
        let mut next = self.all();
        let Some(record) = next.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        record.local_subtitle_url = Some(path);
        self.persist(&next).await?;
        self.replace(next);
        Ok(true)
    }

    /// Removes record `id`; returns the removed record.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the file cannot be rewritten.
    pub async fn remove(&self, id: Uuid) -> Result<Option<DownloadRecord>, RecordError> {
        let _writer = self.writer.lock().await;
        let mut next = self.all();
        let Some(index) = next.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        let removed = next.remove(index);
        self.persist(&next).await?;
        self.replace(next);
        Ok(Some(removed))
    }

    /// Returns true if a record exists for `source_url`.
    #[must_use]
    pub fn is_downloaded(&self, source_url: &str) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.original_url == source_url)
    }

    #[must_use]
    pub fn find_by_source(&self, source_url: &str) -> Option<DownloadRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.original_url == source_url)
            .cloned()
    }

    /// All records, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<DownloadRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, next: Vec<DownloadRecord>) {
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    async fn persist(&self, records: &[DownloadRecord]) -> Result<(), RecordError> {
        let json = serde_json::to_vec_pretty(records).map_err(RecordError::Serialize)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RecordError::io(parent, e))?;
        }

        let mut tmp_name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| RecordError::io(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| RecordError::io(&self.path, e))?;
        Ok(())
    }
}
