//! Download progress rendered as log lines.

use aimodel_core::{DownloadObserver, DownloadProgress, DownloadState};
use std::path::Path;
use tracing::{debug, info};

/// Logs throttled progress snapshots and state changes.
pub struct LogObserver;

impl DownloadObserver for LogObserver {
    fn on_progress(&self, progress: &DownloadProgress) {
        let name = display_name(&progress.destination);
        let speed = format_bytes(progress.speed as u64);
        match (progress.percent(), progress.eta()) {
            (Some(percent), Some(eta)) => info!(
                "{}: {:.1}% at {}/s, {}s left",
                name,
                percent,
                speed,
                eta.as_secs()
            ),
            (Some(percent), None) => info!("{}: {:.1}%", name, percent),
            _ => info!(
                "{}: {} at {}/s",
                name,
                format_bytes(progress.downloaded_bytes),
                speed
            ),
        }
    }

    fn on_state(&self, destination: &Path, state: DownloadState) {
        debug!("{}: {:?}", display_name(destination), state);
    }
}

pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
