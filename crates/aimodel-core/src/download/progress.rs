//! Progress reporting for transfers.
//!
//! The downloader never renders anything; it hands [`DownloadProgress`]
//! snapshots to a [`DownloadObserver`] at most once per
//! `NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL`, plus once at the end.

use super::task::DownloadState;
use crate::config::NetworkConfig;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Snapshot of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub destination: PathBuf,
    /// Bytes on disk, resumed bytes included.
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second over this attempt.
    pub speed: f64,
}

impl DownloadProgress {
    /// Fraction in `0.0..=1.0`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.downloaded_bytes as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    /// Percentage in `0.0..=100.0`, when the total is known.
    pub fn percent(&self) -> Option<f64> {
        self.fraction().map(|f| f * 100.0)
    }

    /// Estimated time left at the current speed.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_bytes?;
        if self.speed <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.downloaded_bytes);
        Some(Duration::from_secs_f64(remaining as f64 / self.speed))
    }
}

/// Receives transfer events. Implementations must be cheap; they run on
/// the transfer task.
pub trait DownloadObserver: Send + Sync {
    fn on_progress(&self, _progress: &DownloadProgress) {}

    fn on_state(&self, _destination: &Path, _state: DownloadState) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DownloadObserver for NoopObserver {}

/// Throttles progress events and measures speed for one attempt.
#[derive(Debug)]
pub(crate) struct SpeedTracker {
    started: Instant,
    start_bytes: u64,
    last_emit: Option<Instant>,
    interval: Duration,
}

impl SpeedTracker {
    pub(crate) fn new(start_bytes: u64) -> Self {
        Self {
            started: Instant::now(),
            start_bytes,
            last_emit: None,
            interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
        }
    }

    /// True when enough time has passed since the last emitted event.
    pub(crate) fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub(crate) fn snapshot(
        &self,
        destination: &Path,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    ) -> DownloadProgress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let transferred = downloaded_bytes.saturating_sub(self.start_bytes);
        DownloadProgress {
            destination: destination.to_path_buf(),
            downloaded_bytes,
            total_bytes,
            speed: if elapsed > 0.0 {
                transferred as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}
