//! Download command handler: queue sources and wait for the transfers.

use std::collections::HashSet;
use std::io::{self, IsTerminal};
use std::path::Path;

use anyhow::{Context, Result, bail};
use streamfetch_core::download::{
    DownloadEvent, HttpClient, JobId, JobKind, JobMetadata, JobRequest, OrchestratorError,
    OrchestratorHandle, QueueStatus,
};
use streamfetch_core::preferences::{Preferences, SharedPreferences};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use url::Url;

use super::{AppContext, header_map};
use crate::cli::DownloadArgs;
use crate::progress::DownloadProgress;

const FALLBACK_TITLE: &str = "download";

#[derive(Debug, Default, PartialEq, Eq)]
struct RunSummary {
    completed: usize,
    failed: Vec<String>,
    cancelled: usize,
    skipped: usize,
}

pub async fn run_download_command(ctx: &AppContext, args: &DownloadArgs) -> Result<()> {
    let preferences = merged_preferences(&ctx.preferences, args);
    let http = HttpClient::with_timeouts(preferences.connect_timeout, preferences.read_timeout)
        .context("Failed to build HTTP client")?;
    let requests = build_requests(ctx, args, &http).await?;

    let handle = streamfetch_core::Orchestrator::builder(SharedPreferences::new(preferences))
        .http(http)
        .spawn()
        .await
        .context("Failed to start the download queue")?;
    let mut events = handle.subscribe();
    let mut progress = DownloadProgress::new(!ctx.quiet && io::stderr().is_terminal());

    let mut summary = RunSummary::default();
    let mut pending = HashSet::new();
    for request in requests {
        let name = request.metadata.display_name();
        match handle.enqueue(request).await {
            Ok(id) => {
                progress.add(id, &name);
                pending.insert(id);
            }
            Err(
                e @ (OrchestratorError::AlreadyDownloaded { .. }
                | OrchestratorError::AlreadyQueued { .. }),
            ) => {
                warn!("{e}");
                summary.skipped += 1;
            }
            Err(e) => return Err(e).context("Failed to queue download"),
        }
    }

    wait_for_jobs(&handle, &mut events, &progress, pending, &mut summary).await;
    if let Err(e) = handle.shutdown().await {
        debug!(error = %e, "download queue already stopped");
    }

    info!(
        completed = summary.completed,
        failed = summary.failed.len(),
        cancelled = summary.cancelled,
        skipped = summary.skipped,
        "Download complete"
    );
    for message in &summary.failed {
        warn!("{message}");
    }
    if !summary.failed.is_empty() {
        bail!("{} download(s) failed", summary.failed.len());
    }
    Ok(())
}

fn merged_preferences(base: &Preferences, args: &DownloadArgs) -> Preferences {
    let mut preferences = base.clone();
    if let Some(dir) = &args.output {
        preferences.download_dir.clone_from(dir);
    }
    if let Some(path) = &args.records {
        preferences.records_path.clone_from(path);
    }
    if let Some(quality) = args.quality {
        preferences.quality_preference = quality;
    }
    if let Some(limit) = args.concurrency {
        preferences.max_concurrent_downloads = usize::from(limit);
    }
    if let Some(retries) = args.max_retries {
        preferences.max_retry_attempts = retries;
    }
    preferences
}

/// Turns the CLI sources into queue requests, resolving them first when a
/// module is named.
async fn build_requests(
    ctx: &AppContext,
    args: &DownloadArgs,
    http: &HttpClient,
) -> Result<Vec<JobRequest>> {
    let extra_headers = header_map(&args.headers);
    let session = match &args.module {
        Some(id) => Some(ctx.load_module(id, http)?),
        None => None,
    };
    let resolver = ctx.resolver(http);

    let mut requests = Vec::with_capacity(args.sources.len());
    for (index, source) in args.sources.iter().enumerate() {
        let (kind, mut metadata) = job_metadata(args, source, index);

        let request = match &session {
            Some(session) => {
                let flags = session.module().flags;
                let result = resolver
                    .resolve(session, source, flags.softsub)
                    .await
                    .with_context(|| format!("Failed to resolve '{source}'"))?;
                let Some(primary) = result.primary() else {
                    bail!("Module returned no stream for '{source}'");
                };
                if metadata.subtitle_url.is_none() {
                    metadata.subtitle_url = result.subtitles.first().map(|s| s.url.clone());
                }
                let mut headers = primary.headers.clone();
                headers.extend(extra_headers.clone());
                JobRequest::new(primary.url.clone(), kind, metadata)
                    .with_headers(headers)
                    .with_stream_type(flags.stream_type)
            }
            None => JobRequest::new(source.clone(), kind, metadata)
                .with_headers(extra_headers.clone()),
        };
        requests.push(request);
    }
    Ok(requests)
}

fn job_metadata(args: &DownloadArgs, source: &str, index: usize) -> (JobKind, JobMetadata) {
    let title = match &args.title {
        Some(title) if args.sources.len() > 1 && args.show.is_none() => {
            format!("{title} {}", index + 1)
        }
        Some(title) => title.clone(),
        None => title_from_url(source),
    };
    let mut metadata = JobMetadata::titled(title);
    metadata.show_poster_url.clone_from(&args.poster);
    metadata.subtitle_url.clone_from(&args.subtitle);

    let Some(show) = &args.show else {
        return (JobKind::Movie, metadata);
    };
    metadata.show_title = Some(show.clone());
    metadata.season = args.season;
    metadata.episode = args
        .episode
        .map(|first| first.saturating_add(u32::try_from(index).unwrap_or(u32::MAX)));
    (JobKind::Episode, metadata)
}

/// File stem of the URL's last path segment.
fn title_from_url(source: &str) -> String {
    Url::parse(source)
        .ok()
        .and_then(|url| {
            url.path_segments()?
                .rev()
                .find(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .and_then(|segment| {
            Path::new(&segment)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| FALLBACK_TITLE.to_string())
}

async fn wait_for_jobs(
    handle: &OrchestratorHandle,
    events: &mut broadcast::Receiver<DownloadEvent>,
    progress: &DownloadProgress,
    mut pending: HashSet<JobId>,
    summary: &mut RunSummary,
) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut signal_armed = true;

    while !pending.is_empty() {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    progress.apply(&event);
                    record_event(&event, &mut pending, summary);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress events dropped, reconciling from snapshot");
                    reconcile(handle, &mut pending, summary).await;
                }
                Err(RecvError::Closed) => break,
            },
            signal = &mut ctrl_c, if signal_armed => {
                signal_armed = false;
                if let Err(e) = signal {
                    debug!(error = %e, "interrupt handler unavailable");
                    continue;
                }
                warn!("Interrupted, cancelling {} download(s)", pending.len());
                for id in pending.drain() {
                    if handle.cancel(id).await.unwrap_or(false) {
                        summary.cancelled += 1;
                    }
                }
            }
        }
    }
}

fn record_event(event: &DownloadEvent, pending: &mut HashSet<JobId>, summary: &mut RunSummary) {
    match event {
        DownloadEvent::Completed { id, path } if pending.remove(id) => {
            info!(path = %path.display(), "Saved");
            summary.completed += 1;
        }
        DownloadEvent::Failed { id, message } if pending.remove(id) => {
            summary.failed.push(message.clone());
        }
        DownloadEvent::Cancelled { id } if pending.remove(id) => summary.cancelled += 1,
        _ => {}
    }
}

/// Settles pending jobs from the queue snapshot after missed events.
///
/// Completed jobs leave the active list at once, so a pending id that is no
/// longer listed has finished successfully.
async fn reconcile(
    handle: &OrchestratorHandle,
    pending: &mut HashSet<JobId>,
    summary: &mut RunSummary,
) {
    let Ok(active) = handle.snapshot().await else {
        return;
    };
    pending.retain(|id| match active.iter().find(|job| job.id == *id) {
        None => {
            summary.completed += 1;
            false
        }
        Some(job) if job.status == QueueStatus::Failed => {
            summary
                .failed
                .push(job.error_message.clone().unwrap_or_default());
            false
        }
        Some(_) => true,
    });
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use uuid::Uuid;

    use super::*;
    use crate::cli::{Cli, Command};

    fn download_args(argv: &[&str]) -> DownloadArgs {
        let mut full = vec!["streamfetch", "download"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Download(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_title_from_url() {
        assert_eq!(title_from_url("https://cdn.example/a/Movie.Name.mp4?x=1"), "Movie.Name");
        assert_eq!(title_from_url("https://cdn.example/show/ep1/"), "ep1");
        assert_eq!(title_from_url("https://cdn.example/"), FALLBACK_TITLE);
        assert_eq!(title_from_url("not a url"), FALLBACK_TITLE);
    }

    #[test]
    fn test_job_metadata_numbers_episodes_from_first() {
        let args = download_args(&[
            "https://cdn.example/a.m3u8",
            "https://cdn.example/b.m3u8",
            "--show",
            "Show",
            "--season",
            "2",
            "--episode",
            "5",
        ]);
        let (kind, second) = job_metadata(&args, &args.sources[1], 1);
        assert_eq!(kind, JobKind::Episode);
        assert_eq!(second.show_title.as_deref(), Some("Show"));
        assert_eq!(second.season, Some(2));
        assert_eq!(second.episode, Some(6));
        assert_eq!(second.title, "b");
    }

    #[test]
    fn test_job_metadata_numbers_shared_movie_titles() {
        let args = download_args(&["u1", "u2", "--title", "Clip", "--poster", "https://p/x.jpg"]);
        let (kind, first) = job_metadata(&args, "u1", 0);
        assert_eq!(kind, JobKind::Movie);
        assert_eq!(first.title, "Clip 1");
        assert_eq!(first.show_poster_url.as_deref(), Some("https://p/x.jpg"));
    }

    #[test]
    fn test_merged_preferences_applies_overrides() {
        let args = download_args(&["u", "-o", "/tmp/out", "-c", "5", "--quality", "low", "-r", "0"]);
        let merged = merged_preferences(&Preferences::default(), &args);
        assert_eq!(merged.download_dir, PathBuf::from("/tmp/out"));
        assert_eq!(merged.max_concurrent_downloads, 5);
        assert_eq!(merged.max_retry_attempts, 0);
        assert_eq!(
            merged.quality_preference,
            streamfetch_core::QualityPreference::Low
        );
    }

    #[test]
    fn test_record_event_ignores_unknown_and_repeated_ids() {
        let id = Uuid::new_v4();
        let mut pending = HashSet::from([id]);
        let mut summary = RunSummary::default();

        record_event(
            &DownloadEvent::Completed {
                id: Uuid::new_v4(),
                path: "x".into(),
            },
            &mut pending,
            &mut summary,
        );
        record_event(
            &DownloadEvent::Failed {
                id,
                message: "boom".to_string(),
            },
            &mut pending,
            &mut summary,
        );
        record_event(&DownloadEvent::Cancelled { id }, &mut pending, &mut summary);

        assert!(pending.is_empty());
        assert_eq!(summary.failed, vec!["boom".to_string()]);
        assert_eq!(summary.cancelled, 0);
        assert_eq!(summary.completed, 0);
    }
}
