//! Copy progress estimation by polling file counts.
//!
//! The estimator never talks to the copier. It counts regular files under the
//! source once, then repeatedly counts regular files under the destination and
//! reports the ratio. A file that is still being written counts as copied, so
//! the figure is advisory only and is held at 99% until the copier finishes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{EventSink, PipelineEvent};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::LogThrottle;

/// Highest percentage reported while the copy is still running.
pub const MAX_PERCENT_WHILE_COPYING: u8 = 99;

/// Snapshot of what the estimator knows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub total_files: Option<u64>,
    pub current_files: u64,
    pub percent: u8,
}

/// Count regular files below `root`, without following symlinks.
///
/// Entries that vanish while walking are ignored; the destination is being
/// written to concurrently.
pub fn count_regular_files(root: &Path) -> io::Result<u64> {
    let mut count = 0;
    for entry in fs::read_dir(root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if file_type.is_dir() {
            match count_regular_files(&entry.path()) {
                Ok(n) => count += n,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        } else if file_type.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

/// `floor(100 * current / total)`, clamped to [`MAX_PERCENT_WHILE_COPYING`].
/// `None` when there is nothing to measure against.
pub fn estimate_percent(current: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = (u128::from(current) * 100 / u128::from(total)) as u64;
    Some(percent.min(u64::from(MAX_PERCENT_WHILE_COPYING)) as u8)
}

pub struct ProgressEstimator {
    source: PathBuf,
    destination: PathBuf,
    interval: Duration,
    total: OnceCell<u64>,
    state: ProgressState,
}

impl ProgressEstimator {
    /// `start_percent` is the value already shown, so the estimate never moves backwards.
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        interval: Duration,
        start_percent: u8,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            interval,
            total: OnceCell::new(),
            state: ProgressState {
                percent: start_percent.min(MAX_PERCENT_WHILE_COPYING),
                ..Default::default()
            },
        }
    }

    /// Number of regular files to copy; counted on first use and cached for the run.
    pub async fn total_files(&self) -> PipelineResult<u64> {
        let source = self.source.clone();
        self.total
            .get_or_try_init(|| async move {
                let counted = tokio::task::spawn_blocking({
                    let source = source.clone();
                    move || count_regular_files(&source)
                })
                .await?;
                counted.map_err(|e| PipelineError::io("count files in", &source, e))
            })
            .await
            .copied()
    }

    /// Count the destination once and fold the result into the state.
    /// Returns the new percent if it increased.
    pub async fn poll_once(&mut self) -> PipelineResult<Option<u8>> {
        let total = self.total_files().await?;
        self.state.total_files = Some(total);

        let destination = self.destination.clone();
        let current = tokio::task::spawn_blocking(move || count_regular_files(&destination))
            .await?
            .map_err(|e| PipelineError::io("count files in", &self.destination, e))?;
        self.state.current_files = current;

        match estimate_percent(current, total) {
            Some(percent) if percent > self.state.percent => {
                self.state.percent = percent;
                Ok(Some(percent))
            }
            _ => Ok(None),
        }
    }

    /// Poll until `copy_done` is cancelled or the estimate saturates at 99%.
    pub async fn run(mut self, copy_done: CancellationToken, events: EventSink) -> ProgressState {
        let mut throttle = LogThrottle::new(Duration::from_millis(500));
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            ticker.tick().await;
            if copy_done.is_cancelled() {
                break;
            }

            match self.total_files().await {
                Ok(0) => {
                    let msg = format!(
                        "No files found under {}, progress unavailable",
                        self.source.display()
                    );
                    warn!("{}", msg);
                    events.emit(PipelineEvent::Degraded(msg));
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Unable to count source files, progress unavailable");
                    events.emit(PipelineEvent::Degraded(e.to_string()));
                    break;
                }
            }

            match self.poll_once().await {
                Ok(Some(percent)) => {
                    if throttle.should_log() {
                        debug!(
                            percent = percent,
                            current = self.state.current_files,
                            total = ?self.state.total_files,
                            "Copy progress"
                        );
                    }
                    events.percent(percent);
                }
                Ok(None) => {}
                // The mount may be briefly unreadable; try again next tick.
                Err(e) => debug!(error = %e, "Progress poll failed"),
            }

            if self.state.percent >= MAX_PERCENT_WHILE_COPYING {
                break;
            }
        }

        self.state
    }
}
