//! Per-job progress bars for download runs.

use std::collections::HashMap;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use streamfetch_core::download::{DownloadEvent, JobId};

const PROGRESS_SCALE: u64 = 1000;

/// One bar per queued job, driven by orchestrator events.
pub(crate) struct DownloadProgress {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<JobId, ProgressBar>,
}

impl DownloadProgress {
    /// Creates the bar set; hidden bars still track state but draw nothing.
    pub(crate) fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let style = ProgressStyle::with_template(
            "{spinner} {prefix:40!} [{bar:30}] {percent:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        Self {
            multi: MultiProgress::with_draw_target(target),
            style,
            bars: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, id: JobId, name: &str) {
        let bar = self.multi.add(ProgressBar::new(PROGRESS_SCALE));
        bar.set_style(self.style.clone());
        bar.set_prefix(name.to_string());
        bar.set_message("queued");
        self.bars.insert(id, bar);
    }

    pub(crate) fn apply(&self, event: &DownloadEvent) {
        let Some(bar) = self.bars.get(&event.job_id()) else {
            return;
        };
        match event {
            DownloadEvent::Started { .. } => {
                bar.set_message("downloading");
                bar.enable_steady_tick(Duration::from_millis(120));
            }
            DownloadEvent::Progress { fraction, .. } => bar.set_position(scaled(*fraction)),
            DownloadEvent::Retrying { attempt, delay, .. } => bar.set_message(format!(
                "retry {attempt} in {:.1}s",
                delay.as_secs_f64()
            )),
            DownloadEvent::Completed { .. } => {
                bar.set_position(PROGRESS_SCALE);
                bar.finish_with_message("done");
            }
            DownloadEvent::Failed { message, .. } => {
                bar.abandon_with_message(format!("failed: {message}"));
            }
            DownloadEvent::Cancelled { .. } => bar.abandon_with_message("cancelled"),
            DownloadEvent::Queued { .. } | DownloadEvent::Dismissed { .. } => {}
        }
    }

    #[cfg(test)]
    fn position(&self, id: JobId) -> Option<u64> {
        self.bars.get(&id).map(ProgressBar::position)
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn scaled(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * PROGRESS_SCALE as f64).round() as u64
}
