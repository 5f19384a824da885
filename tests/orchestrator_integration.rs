//! Integration tests for the download queue.
//!
//! Transfers go through a scripted transport so the tests control timing and
//! failures without touching the network.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use streamfetch_core::download::{
    DownloadError, DownloadEvent, DownloadJob, JobId, JobKind, JobMetadata, JobRequest,
    Orchestrator, OrchestratorError, OrchestratorHandle, QueueStatus, Transport, TransportKind,
    TransportProgress,
};
use streamfetch_core::logging::MemoryLogSink;
use streamfetch_core::preferences::{Preferences, SharedPreferences};
use streamfetch_core::records::RecordStore;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug)]
struct ScriptedTransport {
    hold: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Progressive
    }

    async fn transfer(
        &self,
        job: &DownloadJob,
        destination: &Path,
        progress: TransportProgress,
    ) -> Result<u64, DownloadError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        progress(0.5);
        tokio::time::sleep(self.hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if job.source_url.contains("broken") {
            return Err(DownloadError::http_status(&job.source_url, 503));
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }
        tokio::fs::write(destination, b"media")
            .await
            .map_err(|e| DownloadError::io(destination, e))?;
        progress(1.0);
        Ok(5)
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    handle: OrchestratorHandle,
    events: broadcast::Receiver<DownloadEvent>,
    sink: MemoryLogSink,
}

async fn harness(transport: &Arc<ScriptedTransport>, tweak: impl FnOnce(&mut Preferences)) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let mut prefs = Preferences {
        download_dir: root.join("media"),
        records_path: root.join("records.json"),
        ..Preferences::default()
    };
    tweak(&mut prefs);

    let records = Arc::new(RecordStore::open(&prefs.records_path).await.unwrap());
    let sink = MemoryLogSink::new();
    let shared: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
    let handle = Orchestrator::builder(SharedPreferences::new(prefs))
        .records(records)
        .sink(Arc::new(sink.clone()))
        .transport(TransportKind::Progressive, Arc::clone(&shared))
        .transport(TransportKind::Adaptive, shared)
        .spawn()
        .await
        .unwrap();
    let events = handle.subscribe();
    Harness {
        _dir: dir,
        root,
        handle,
        events,
        sink,
    }
}

fn movie(url: &str) -> JobRequest {
    let title = url.rsplit('/').next().unwrap_or("clip");
    JobRequest::new(url, JobKind::Movie, JobMetadata::titled(title))
}

/// Waits for the first event matching `pred`.
async fn wait_for(
    events: &mut broadcast::Receiver<DownloadEvent>,
    pred: impl Fn(&DownloadEvent) -> bool,
) -> DownloadEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_completed(events: &mut broadcast::Receiver<DownloadEvent>, count: usize) -> Vec<JobId> {
    let mut done = Vec::new();
    while done.len() < count {
        let event = wait_for(events, |e| matches!(e, DownloadEvent::Completed { .. })).await;
        done.push(event.job_id());
    }
    done
}

#[tokio::test]
async fn test_concurrency_limit_bounds_running_transfers() {
    let transport = ScriptedTransport::new(Duration::from_millis(40));
    let mut h = harness(&transport, |p| p.max_concurrent_downloads = 2).await;

    for n in 0..5 {
        h.handle
            .enqueue(movie(&format!("https://cdn.example/clip{n}.mp4")))
            .await
            .unwrap();
    }
    wait_completed(&mut h.events, 5).await;

    assert_eq!(transport.peak(), 2);
    assert!(h.handle.snapshot().await.unwrap().is_empty());
    assert_eq!(h.handle.records().all().len(), 5);
    assert!(h.root.join("media").exists());
}

#[tokio::test]
async fn test_jobs_start_in_admission_order() {
    let transport = ScriptedTransport::new(Duration::from_millis(20));
    let mut h = harness(&transport, |p| p.max_concurrent_downloads = 1).await;

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            h.handle
                .enqueue(movie(&format!("https://cdn.example/ordered{n}.mp4")))
                .await
                .unwrap(),
        );
    }

    let mut started = Vec::new();
    while started.len() < 3 {
        let event = wait_for(&mut h.events, |e| matches!(e, DownloadEvent::Started { .. })).await;
        started.push(event.job_id());
    }
    assert_eq!(started, ids);
}

#[tokio::test]
async fn test_completed_source_is_not_downloaded_again() {
    let transport = ScriptedTransport::new(Duration::from_millis(5));
    let mut h = harness(&transport, |_| {}).await;
    let url = "https://cdn.example/once.mp4";

    let id = h.handle.enqueue(movie(url)).await.unwrap();
    let err = h.handle.enqueue(movie(url)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyQueued { .. }));

    assert_eq!(wait_completed(&mut h.events, 1).await, vec![id]);
    let record = h.handle.records().find_by_source(url).unwrap();
    assert_eq!(record.id, id);
    assert!(record.local_url.exists());

    let err = h.handle.enqueue(movie(url)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyDownloaded { .. }));
}

#[tokio::test]
async fn test_slow_poster_neither_holds_slot_nor_reopens_cancel() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poster.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"jpeg".to_vec())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;
    let transport = ScriptedTransport::new(Duration::from_millis(5));
    let mut h = harness(&transport, |p| p.max_concurrent_downloads = 1).await;
    let url = "https://cdn.example/with-poster.mp4";

    let mut request = movie(url);
    request.metadata.show_poster_url = Some(format!("{}/poster.jpg", server.uri()));
    let first = h.handle.enqueue(request).await.unwrap();
    let second = h
        .handle
        .enqueue(movie("https://cdn.example/behind-poster.mp4"))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    wait_for(&mut h.events, |e| {
        matches!(e, DownloadEvent::Completed { id, .. } if *id == first)
    })
    .await;
    assert!(h.handle.records().is_downloaded(url));
    assert!(!h.handle.cancel(first).await.unwrap());

    wait_for(&mut h.events, |e| {
        matches!(e, DownloadEvent::Completed { id, .. } if *id == second)
    })
    .await;
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "second job waited for the first job's poster"
    );
    assert!(h.handle.records().find_by_source(url).is_some());
    let err = h.handle.enqueue(movie(url)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyDownloaded { .. }));

    h.handle.shutdown().await.unwrap();
    let record = h.handle.records().find_by_source(url).unwrap();
    assert!(record.local_url.with_extension("jpg").exists());
}

#[tokio::test(start_paused = true)]
async fn test_failed_transfer_backs_off_then_is_dismissed() {
    let transport = ScriptedTransport::new(Duration::ZERO);
    let mut h = harness(&transport, |p| {
        p.max_retry_attempts = 3;
        p.initial_retry_delay = Duration::from_secs(1);
        p.failure_grace_delay = Duration::from_secs(5);
    })
    .await;

    let id = h
        .handle
        .enqueue(movie("https://cdn.example/broken.mp4"))
        .await
        .unwrap();

    let mut delays = Vec::new();
    loop {
        match wait_for(&mut h.events, |e| {
            matches!(e, DownloadEvent::Retrying { .. } | DownloadEvent::Failed { .. })
        })
        .await
        {
            DownloadEvent::Retrying { attempt, delay, .. } => delays.push((attempt, delay)),
            DownloadEvent::Failed { message, .. } => {
                assert!(message.contains("503"), "unexpected message: {message}");
                break;
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(
        delays,
        vec![
            (2, Duration::from_secs(1)),
            (3, Duration::from_secs(2)),
            (4, Duration::from_secs(4)),
        ]
    );

    let times = transport.attempt_times();
    assert_eq!(times.len(), 4);
    for (pair, expected) in times.windows(2).zip([1, 2, 4]) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(expected));
    }

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, QueueStatus::Failed);
    assert!(snapshot[0].error_message.is_some());

    let log = h.handle.failure_log().await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, id);
    assert_eq!(log[0].attempts, 4);
    assert!(h.sink.contains("Download failed"));

    let dismissed = wait_for(&mut h.events, |e| matches!(e, DownloadEvent::Dismissed { .. })).await;
    assert_eq!(dismissed.job_id(), id);
    assert!(h.handle.snapshot().await.unwrap().is_empty());
    assert_eq!(h.handle.failure_log().await.unwrap().len(), 1);
    assert!(h.handle.records().all().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_removes_running_and_queued_jobs() {
    let transport = ScriptedTransport::new(Duration::from_secs(600));
    let mut h = harness(&transport, |p| p.max_concurrent_downloads = 1).await;

    let running = h
        .handle
        .enqueue(movie("https://cdn.example/long.mp4"))
        .await
        .unwrap();
    let queued = h
        .handle
        .enqueue(movie("https://cdn.example/next.mp4"))
        .await
        .unwrap();
    wait_for(&mut h.events, |e| *e == DownloadEvent::Started { id: running }).await;

    assert!(h.handle.cancel(queued).await.unwrap());
    wait_for(&mut h.events, |e| *e == DownloadEvent::Cancelled { id: queued }).await;
    assert!(h.handle.cancel(running).await.unwrap());
    wait_for(&mut h.events, |e| *e == DownloadEvent::Cancelled { id: running }).await;

    assert!(!h.handle.cancel(running).await.unwrap());
    assert!(h.handle.snapshot().await.unwrap().is_empty());
    assert!(h.handle.records().all().is_empty());
    assert_eq!(transport.attempt_times().len(), 1, "queued job never started");
}

#[tokio::test(start_paused = true)]
async fn test_raising_limit_starts_waiting_jobs() {
    let transport = ScriptedTransport::new(Duration::from_secs(600));
    let mut h = harness(&transport, |p| p.max_concurrent_downloads = 1).await;

    for n in 0..3 {
        h.handle
            .enqueue(movie(&format!("https://cdn.example/wide{n}.mp4")))
            .await
            .unwrap();
    }
    wait_for(&mut h.events, |e| matches!(e, DownloadEvent::Started { .. })).await;
    let statuses: Vec<QueueStatus> = h
        .handle
        .snapshot()
        .await
        .unwrap()
        .iter()
        .map(|job| job.status)
        .collect();
    assert_eq!(
        statuses,
        vec![QueueStatus::Downloading, QueueStatus::Queued, QueueStatus::Queued]
    );

    h.handle.set_max_concurrent(3).unwrap();
    wait_for(&mut h.events, |e| matches!(e, DownloadEvent::Started { .. })).await;
    wait_for(&mut h.events, |e| matches!(e, DownloadEvent::Started { .. })).await;
    assert!(
        h.handle
            .snapshot()
            .await
            .unwrap()
            .iter()
            .all(|job| job.status == QueueStatus::Downloading)
    );

    h.handle.shutdown().await.unwrap();
    assert!(matches!(
        h.handle.snapshot().await,
        Err(OrchestratorError::Closed)
    ));
}

#[tokio::test]
async fn test_encrypted_playlist_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/locked/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "#EXTM3U\n\
             #EXT-X-TARGETDURATION:10\n\
             #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
             #EXTINF:10.0,\n\
             s1.ts\n\
             #EXT-X-ENDLIST\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let prefs = Preferences {
        download_dir: dir.path().join("media"),
        records_path: dir.path().join("records.json"),
        max_retry_attempts: 3,
        initial_retry_delay: Duration::from_millis(100),
        ..Preferences::default()
    };
    let handle = Orchestrator::builder(SharedPreferences::new(prefs))
        .sink(Arc::new(MemoryLogSink::new()))
        .spawn()
        .await
        .unwrap();
    let mut events = handle.subscribe();

    let id = handle
        .enqueue(movie(&format!("{}/locked/index.m3u8", server.uri())))
        .await
        .unwrap();
    let outcome = wait_for(&mut events, |e| {
        matches!(e, DownloadEvent::Retrying { .. } | DownloadEvent::Failed { .. })
    })
    .await;

    let DownloadEvent::Failed { message, .. } = outcome else {
        panic!("unsupported playlist was retried: {outcome:?}");
    };
    assert!(message.contains("encrypted"), "unexpected message: {message}");
    let log = handle.failure_log().await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, id);
    assert_eq!(log[0].attempts, 1);
    assert!(handle.records().all().is_empty());
}
