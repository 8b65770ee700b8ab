//! Transfer descriptions and their terminal outcomes.

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One file transfer.
///
/// The bytes already present in [`partial_path`](Self::partial_path) are
/// the resume offset; nothing else is trusted for that.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    /// Lowercase or uppercase hex SHA-256.
    pub expected_hash: Option<String>,
    pub cancel: CancellationToken,
}

impl DownloadTask {
    /// Create a task with no integrity expectations.
    pub fn new(source_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            destination: destination.into(),
            expected_size: None,
            expected_hash: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Require the finished file to have this many bytes.
    pub fn with_expected_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    /// Require the finished file to have this SHA-256 (any case).
    pub fn with_expected_hash(mut self, hash: Option<String>) -> Self {
        self.expected_hash = hash.filter(|h| !h.trim().is_empty());
        self
    }

    /// Stop the transfer when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Staging file: the destination with `.part` appended.
    pub fn partial_path(&self) -> PathBuf {
        partial_path_for(&self.destination)
    }
}

pub(crate) fn partial_path_for(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(NetworkConfig::DOWNLOAD_TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    /// Whether no further state change follows.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// How a fetch ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed {
        path: PathBuf,
        bytes: u64,
        /// Offset the final attempt resumed from, 0 for a fresh transfer.
        resumed_from: u64,
        /// Verified digest, present when an expected hash was supplied.
        digest: Option<String>,
    },
    /// Stopped on request; the partial file stays for a later resume.
    Cancelled {
        partial_path: PathBuf,
        bytes_on_disk: u64,
    },
}

impl DownloadOutcome {
    /// Whether the file is in place.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
