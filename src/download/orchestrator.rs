//! Bounded-concurrency download queue.
//!
//! One coordination task owns the job list. Callers talk to it through an
//! [`OrchestratorHandle`]; transfer tasks report back over the same command
//! channel, so every state change happens on the coordination task.
//!
//! Admission is FIFO. Whenever a slot frees up, or the concurrency limit is
//! raised, the drain pass starts queued jobs until `max_concurrent_downloads`
//! transfers are running.
//!
//! A finished transfer only commits on the coordination task: a job cancelled
//! before its completion is processed never gets a record. Record writes,
//! subtitles, and posters then run as side tasks outside the slot limit, and
//! `Completed` is emitted once the record is saved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::adaptive::AdaptiveTransport;
use super::client::{HttpClient, RequestHeaders};
use super::error::{DownloadError, classify_error};
use super::job::{DownloadJob, JobId, JobRequest, QueueStatus};
use super::naming::{output_path, partial_path, subtitle_path};
use super::progressive::ProgressiveTransport;
use super::transport::{Transport, TransportKind, TransportProgress, discard_partial};
use crate::fetch_cache::FetchCache;
use crate::logging::{SharedLogSink, Severity, default_sink};
use crate::preferences::{MAX_CONCURRENT_DOWNLOADS_LIMIT, PreferenceStore, SharedPreferences};
use crate::records::{DownloadRecord, RecordError, RecordStore};
use crate::retry::{RetryError, RetryPolicy, retry_with_backoff_observed};

const EVENT_CAPACITY: usize = 256;

/// Errors returned by [`OrchestratorHandle`] operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{url} has already been downloaded\n  Suggestion: remove its record to download it again")]
    AlreadyDownloaded { url: String },

    #[error("{url} is already in the download queue")]
    AlreadyQueued { url: String },

    #[error("the download orchestrator has shut down")]
    Closed,

    #[error(transparent)]
    Records(#[from] RecordError),
}

/// Observable queue changes.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Queued { id: JobId },
    Started { id: JobId },
    Progress { id: JobId, fraction: f64 },
    Retrying { id: JobId, attempt: u32, delay: Duration },
    Completed { id: JobId, path: PathBuf },
    Failed { id: JobId, message: String },
    /// A failed job left the active list after the grace delay.
    Dismissed { id: JobId },
    Cancelled { id: JobId },
}

impl DownloadEvent {
    #[must_use]
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Queued { id }
            | Self::Started { id }
            | Self::Progress { id, .. }
            | Self::Retrying { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. }
            | Self::Dismissed { id }
            | Self::Cancelled { id } => *id,
        }
    }
}

/// A failed job, kept after the job itself is dismissed.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureEntry {
    pub id: JobId,
    pub name: String,
    pub source_url: String,
    pub message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct FailureReport {
    message: String,
    attempts: u32,
}

enum Command {
    Enqueue {
        request: JobRequest,
        reply: oneshot::Sender<Result<JobId, OrchestratorError>>,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    SetConcurrency {
        limit: usize,
    },
    TransferProgress {
        id: JobId,
        fraction: f64,
    },
    TransferRetrying {
        id: JobId,
        attempt: u32,
        delay: Duration,
    },
    TransferFinished {
        id: JobId,
        outcome: Result<PathBuf, FailureReport>,
    },
    Recorded {
        id: JobId,
        path: PathBuf,
    },
    SubtitleFinished {
        id: JobId,
        outcome: Result<PathBuf, String>,
    },
    Dismiss {
        id: JobId,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<DownloadJob>>,
    },
    FailureLog {
        reply: oneshot::Sender<Vec<FailureEntry>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Entry point for building the download queue.
#[derive(Debug)]
pub struct Orchestrator;

impl Orchestrator {
    #[must_use]
    pub fn builder(preferences: SharedPreferences) -> OrchestratorBuilder {
        OrchestratorBuilder {
            preferences,
            http: None,
            records: None,
            sink: default_sink(),
            adaptive: None,
            progressive: None,
        }
    }
}

/// Configures and starts the coordination task.
pub struct OrchestratorBuilder {
    preferences: SharedPreferences,
    http: Option<HttpClient>,
    records: Option<Arc<RecordStore>>,
    sink: SharedLogSink,
    adaptive: Option<Arc<dyn Transport>>,
    progressive: Option<Arc<dyn Transport>>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn http(mut self, http: HttpClient) -> Self {
        self.http = Some(http);
        self
    }

    /// Uses `records` instead of opening the store at the configured path.
    #[must_use]
    pub fn records(mut self, records: Arc<RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: SharedLogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the transport used for `kind`.
    #[must_use]
    pub fn transport(mut self, kind: TransportKind, transport: Arc<dyn Transport>) -> Self {
        match kind {
            TransportKind::Adaptive => self.adaptive = Some(transport),
            TransportKind::Progressive => self.progressive = Some(transport),
        }
        self
    }

    /// Starts the coordination task.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Records`] if the record file cannot be read.
    pub async fn spawn(self) -> Result<OrchestratorHandle, OrchestratorError> {
        let snapshot = self.preferences.snapshot();
        let http = match self.http {
            Some(http) => http,
            None => HttpClient::with_timeouts(snapshot.connect_timeout, snapshot.read_timeout)
                .unwrap_or_default(),
        };
        let records = match self.records {
            Some(records) => records,
            None => Arc::new(RecordStore::open(&snapshot.records_path).await?),
        };
        let adaptive = self.adaptive.unwrap_or_else(|| {
            Arc::new(AdaptiveTransport::new(
                http.clone(),
                self.preferences.clone(),
            ))
        });
        let progressive = self
            .progressive
            .unwrap_or_else(|| Arc::new(ProgressiveTransport::new(http.clone())));

        let (commands, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            http,
            records: Arc::clone(&records),
            sink: self.sink,
            posters: FetchCache::new(RetryPolicy::new(
                snapshot.max_retry_attempts,
                snapshot.initial_retry_delay,
            )),
            commands: commands.clone(),
        });

        let actor = Actor {
            preferences: self.preferences,
            shared,
            adaptive,
            progressive,
            events: events.clone(),
            jobs: Vec::new(),
            running: HashMap::new(),
            finalizing: HashMap::new(),
            side_tasks: JoinSet::new(),
            failures: Vec::new(),
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(actor.run(inbox));
        info!("download orchestrator started");

        Ok(OrchestratorHandle {
            commands,
            events,
            records,
        })
    }
}

/// Cloneable handle to a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<DownloadEvent>,
    records: Arc<RecordStore>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Enqueue { .. } => "Enqueue",
            Self::Cancel { .. } => "Cancel",
            Self::SetConcurrency { .. } => "SetConcurrency",
            Self::TransferProgress { .. } => "TransferProgress",
            Self::TransferRetrying { .. } => "TransferRetrying",
            Self::TransferFinished { .. } => "TransferFinished",
            Self::Recorded { .. } => "Recorded",
            Self::SubtitleFinished { .. } => "SubtitleFinished",
            Self::Dismiss { .. } => "Dismiss",
            Self::Snapshot { .. } => "Snapshot",
            Self::FailureLog { .. } => "FailureLog",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| OrchestratorError::Closed)?;
        response.await.map_err(|_| OrchestratorError::Closed)
    }

    /// Admits a job to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::AlreadyDownloaded`] when a record exists
    /// for the source URL and [`OrchestratorError::AlreadyQueued`] when an
    /// active job already targets it.
    #[instrument(skip(self, request), fields(url = %request.source_url))]
    pub async fn enqueue(&self, request: JobRequest) -> Result<JobId, OrchestratorError> {
        self.request(|reply| Command::Enqueue { request, reply })
            .await?
    }

    /// Cancels job `id` at any status; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Closed`] after shutdown.
    pub async fn cancel(&self, id: JobId) -> Result<bool, OrchestratorError> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// Changes the concurrency limit; queued jobs start at once if it rose.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Closed`] after shutdown.
    pub fn set_max_concurrent(&self, limit: usize) -> Result<(), OrchestratorError> {
        self.commands
            .send(Command::SetConcurrency { limit })
            .map_err(|_| OrchestratorError::Closed)
    }

    /// Active jobs in admission order.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Closed`] after shutdown.
    pub async fn snapshot(&self) -> Result<Vec<DownloadJob>, OrchestratorError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Every failure since start, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Closed`] after shutdown.
    pub async fn failure_log(&self) -> Result<Vec<FailureEntry>, OrchestratorError> {
        self.request(|reply| Command::FailureLog { reply }).await
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    /// Aborts running transfers and stops the coordination task.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Closed`] if it already stopped.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Services shared with transfer tasks.
struct Shared {
    http: HttpClient,
    records: Arc<RecordStore>,
    sink: SharedLogSink,
    posters: FetchCache<Arc<Vec<u8>>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Shared {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("orchestrator stopped, dropping transfer report");
        }
    }

    async fn record_completion(&self, job: &DownloadJob, destination: &Path) {
        let record = DownloadRecord {
            id: job.id,
            name: job.metadata.display_name(),
            download_date: Utc::now(),
            original_url: job.source_url.clone(),
            local_url: destination.to_path_buf(),
            kind: job.kind,
            metadata: job.metadata.clone(),
            subtitle_url: job.metadata.subtitle_url.clone(),
            local_subtitle_url: None,
        };
        if let Err(e) = self.records.upsert(record).await {
            warn!(job_id = %job.id, error = %e, "could not persist download record");
            self.sink.log(
                &format!("Downloaded {} but could not save its record: {e}", job.metadata.title),
                Severity::Warning,
            );
        }
    }

    /// Stores poster artwork next to the media file; failures are only logged.
    async fn save_poster(&self, job: &DownloadJob, destination: &Path) {
        let Some(url) = job
            .metadata
            .episode_poster_url
            .clone()
            .or_else(|| job.metadata.show_poster_url.clone())
        else {
            return;
        };
        let http = self.http.clone();
        let fetch_url = url.clone();
        let fetched = self
            .posters
            .get_or_fetch(&url, move |_| {
                let http = http.clone();
                let url = fetch_url.clone();
                async move {
                    http.fetch_bytes(&url, &RequestHeaders::new())
                        .await
                        .map(Arc::new)
                }
            })
            .await;

        let poster_path = destination.with_extension("jpg");
        match fetched {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&poster_path, bytes.as_slice()).await {
                    warn!(path = %poster_path.display(), error = %e, "could not write poster");
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "poster fetch failed");
                self.sink
                    .log(&format!("Poster unavailable: {e}"), Severity::Warning);
            }
        }
    }
}

struct RunningTransfer {
    abort: AbortHandle,
    cancel: CancellationToken,
    destination: PathBuf,
}

struct Actor {
    preferences: SharedPreferences,
    shared: Arc<Shared>,
    adaptive: Arc<dyn Transport>,
    progressive: Arc<dyn Transport>,
    events: broadcast::Sender<DownloadEvent>,
    jobs: Vec<DownloadJob>,
    running: HashMap<JobId, RunningTransfer>,
    /// Committed jobs whose record is still being written, by source URL.
    finalizing: HashMap<JobId, String>,
    side_tasks: JoinSet<()>,
    failures: Vec<FailureEntry>,
    shutdown: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = tokio::select! {
                command = inbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                Some(joined) = self.side_tasks.join_next(), if !self.side_tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "post-download task ended abnormally");
                    }
                    continue;
                }
            };
            match command {
                Command::Enqueue { request, reply } => {
                    let _ = reply.send(self.enqueue(request));
                }
                Command::Cancel { id, reply } => {
                    let _ = reply.send(self.cancel(id));
                }
                Command::SetConcurrency { limit } => {
                    let limit = limit.clamp(1, MAX_CONCURRENT_DOWNLOADS_LIMIT);
                    self.preferences.set_max_concurrent_downloads(limit);
                    debug!(limit, "concurrency limit changed");
                    self.drain();
                }
                Command::TransferProgress { id, fraction } => self.progress(id, fraction),
                Command::TransferRetrying { id, attempt, delay } => {
                    self.emit(DownloadEvent::Retrying { id, attempt, delay });
                }
                Command::TransferFinished { id, outcome } => self.finished(id, outcome),
                Command::Recorded { id, path } => {
                    self.finalizing.remove(&id);
                    info!(job_id = %id, path = %path.display(), "download completed");
                    self.emit(DownloadEvent::Completed { id, path });
                }
                Command::SubtitleFinished { id, outcome } => match outcome {
                    Ok(path) => debug!(job_id = %id, path = %path.display(), "subtitle saved"),
                    Err(message) => {
                        warn!(job_id = %id, %message, "subtitle download failed");
                        self.shared.sink.log(
                            &format!("Subtitle download failed: {message}"),
                            Severity::Warning,
                        );
                    }
                },
                Command::Dismiss { id } => self.dismiss(id),
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.jobs.clone());
                }
                Command::FailureLog { reply } => {
                    let _ = reply.send(self.failures.clone());
                }
                Command::Shutdown { reply } => {
                    self.stop_all();
                    self.settle_side_tasks().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        self.stop_all();
        self.side_tasks.abort_all();
        info!("download orchestrator stopped");
    }

    fn emit(&self, event: DownloadEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn enqueue(&mut self, request: JobRequest) -> Result<JobId, OrchestratorError> {
        if self.shared.records.is_downloaded(&request.source_url)
            || self.finalizing.values().any(|url| *url == request.source_url)
        {
            return Err(OrchestratorError::AlreadyDownloaded {
                url: request.source_url,
            });
        }
        if self
            .jobs
            .iter()
            .any(|job| job.source_url == request.source_url && job.status != QueueStatus::Failed)
        {
            return Err(OrchestratorError::AlreadyQueued {
                url: request.source_url,
            });
        }

        let job = DownloadJob::from_request(request);
        let id = job.id;
        info!(job_id = %id, name = %job.metadata.display_name(), "job queued");
        self.jobs.push(job);
        self.emit(DownloadEvent::Queued { id });
        self.drain();
        Ok(id)
    }

    /// Starts queued jobs, oldest first, while slots are free.
    fn drain(&mut self) {
        let limit = self.preferences.max_concurrent_downloads().max(1);
        while self.running.len() < limit {
            let Some(index) = self
                .jobs
                .iter()
                .position(|job| job.status == QueueStatus::Queued)
            else {
                break;
            };
            self.start(index);
        }
    }

    fn start(&mut self, index: usize) {
        let job = &mut self.jobs[index];
        if !job.advance(QueueStatus::Downloading) {
            return;
        }
        let id = job.id;
        let kind = TransportKind::select(&job.source_url, job.declared_stream_type);
        let prefs = self.preferences.snapshot();
        let destination = output_path(&prefs.download_dir, job, kind);
        let transport = match kind {
            TransportKind::Adaptive => Arc::clone(&self.adaptive),
            TransportKind::Progressive => Arc::clone(&self.progressive),
        };
        let policy = RetryPolicy::new(prefs.max_retry_attempts, prefs.initial_retry_delay);
        let cancel = self.shutdown.child_token();

        info!(job_id = %id, transport = %kind, path = %destination.display(), "transfer started");
        let task = tokio::spawn(run_transfer(
            Arc::clone(&self.shared),
            job.clone(),
            transport,
            destination.clone(),
            policy,
            cancel.clone(),
        ));
        self.running.insert(
            id,
            RunningTransfer {
                abort: task.abort_handle(),
                cancel,
                destination,
            },
        );
        self.emit(DownloadEvent::Started { id });
    }

    fn progress(&mut self, id: JobId, fraction: f64) {
        let Some(job) = self
            .jobs
            .iter_mut()
            .find(|job| job.id == id && job.status == QueueStatus::Downloading)
        else {
            return;
        };
        job.set_progress(fraction);
        let fraction = job.progress;
        self.emit(DownloadEvent::Progress { id, fraction });
    }

    fn finished(&mut self, id: JobId, outcome: Result<PathBuf, FailureReport>) {
        self.running.remove(&id);
        let Some(index) = self
            .jobs
            .iter()
            .position(|job| job.id == id && job.status == QueueStatus::Downloading)
        else {
            debug!(job_id = %id, "ignoring completion of a job that is no longer active");
            self.drain();
            return;
        };

        match outcome {
            Ok(path) => {
                let mut job = self.jobs.remove(index);
                job.advance(QueueStatus::Completed);
                job.set_progress(1.0);
                debug!(job_id = %id, "transfer committed, saving record");
                self.finalizing.insert(id, job.source_url.clone());
                self.side_tasks
                    .spawn(finalize_job(Arc::clone(&self.shared), job, path));
            }
            Err(report) => {
                let job = &mut self.jobs[index];
                job.advance(QueueStatus::Failed);
                job.error_message = Some(report.message.clone());
                let name = job.metadata.display_name();
                warn!(job_id = %id, attempts = report.attempts, error = %report.message, "download failed");
                self.shared
                    .sink
                    .log(&format!("Download failed: {name}: {}", report.message), Severity::Error);
                self.failures.push(FailureEntry {
                    id,
                    name,
                    source_url: job.source_url.clone(),
                    message: report.message.clone(),
                    attempts: report.attempts,
                    failed_at: Utc::now(),
                });
                self.schedule_dismiss(id);
                self.emit(DownloadEvent::Failed {
                    id,
                    message: report.message,
                });
            }
        }
        self.drain();
    }

    fn schedule_dismiss(&self, id: JobId) {
        let delay = self.preferences.snapshot().failure_grace_delay;
        let commands = self.shared.commands.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::Dismiss { id });
                }
            }
        });
    }

    fn dismiss(&mut self, id: JobId) {
        let before = self.jobs.len();
        self.jobs
            .retain(|job| !(job.id == id && job.status == QueueStatus::Failed));
        if self.jobs.len() < before {
            debug!(job_id = %id, "failed job dismissed");
            self.emit(DownloadEvent::Dismissed { id });
        }
    }

    fn cancel(&mut self, id: JobId) -> bool {
        let Some(index) = self.jobs.iter().position(|job| job.id == id) else {
            return false;
        };
        self.jobs.remove(index);
        if let Some(transfer) = self.running.remove(&id) {
            transfer.cancel.cancel();
            transfer.abort.abort();
            let partial = partial_path(&transfer.destination);
            tokio::spawn(async move { discard_partial(&partial).await });
        }
        info!(job_id = %id, "job cancelled");
        self.emit(DownloadEvent::Cancelled { id });
        self.drain();
        true
    }

    fn stop_all(&mut self) {
        self.shutdown.cancel();
        for (_, transfer) in self.running.drain() {
            transfer.abort.abort();
        }
    }

    /// Lets committed jobs finish writing their records and extras.
    async fn settle_side_tasks(&mut self) {
        if !self.side_tasks.is_empty() {
            debug!(pending = self.side_tasks.len(), "waiting for post-download work");
        }
        while let Some(joined) = self.side_tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "post-download task ended abnormally");
            }
        }
        self.shared.posters.close();
    }
}

#[instrument(skip_all, fields(job_id = %job.id))]
async fn run_transfer(
    shared: Arc<Shared>,
    job: DownloadJob,
    transport: Arc<dyn Transport>,
    destination: PathBuf,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    let id = job.id;
    let progress: TransportProgress = {
        let shared = Arc::clone(&shared);
        Arc::new(move |fraction: f64| shared.send(Command::TransferProgress { id, fraction }))
    };

    let outcome = retry_with_backoff_observed(
        &id.to_string(),
        &policy,
        &cancel,
        classify_error,
        |attempt, delay, _: &DownloadError| {
            shared.send(Command::TransferRetrying { id, attempt, delay });
        },
        |_| transport.transfer(&job, &destination, Arc::clone(&progress)),
    )
    .await;

    let outcome = match outcome {
        Ok(bytes) => {
            debug!(bytes, "transfer succeeded");
            Ok(destination)
        }
        Err(RetryError::Cancelled) => return,
        Err(error) => {
            let attempts = error.attempts();
            let message = error
                .into_source()
                .map_or_else(|| "transfer failed".to_string(), |e| e.to_string());
            Err(FailureReport { message, attempts })
        }
    };
    shared.send(Command::TransferFinished { id, outcome });
}

/// Saves the record of a committed job, then fetches its subtitle and poster.
#[instrument(skip_all, fields(job_id = %job.id))]
async fn finalize_job(shared: Arc<Shared>, job: DownloadJob, path: PathBuf) {
    shared.record_completion(&job, &path).await;
    shared.send(Command::Recorded {
        id: job.id,
        path: path.clone(),
    });

    let subtitle = async {
        if let Some(url) = job.metadata.subtitle_url.clone() {
            download_subtitle(Arc::clone(&shared), job.id, url, path.clone()).await;
        }
    };
    tokio::join!(subtitle, shared.save_poster(&job, &path));
}

async fn download_subtitle(shared: Arc<Shared>, id: JobId, url: String, media_path: PathBuf) {
    let path = subtitle_path(&media_path, &url);
    let outcome = match shared
        .http
        .download_to_path(&url, &RequestHeaders::new(), &path, &|_, _| {})
        .await
    {
        Ok(_) => match shared.records.set_local_subtitle(id, path.clone()).await {
            Ok(_) => Ok(path),
            Err(e) => Err(e.to_string()),
        },
        Err(e) => Err(e.to_string()),
    };
    shared.send(Command::SubtitleFinished { id, outcome });
}
