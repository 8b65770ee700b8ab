//! Resumable, verified file transfers.
//!
//! - [`DownloadTask`]: what to fetch and where, with optional size/hash
//! - [`ResumableDownloader`]: range resume, retry, single writer per destination
//! - [`DownloadObserver`]: progress and state callbacks

mod downloader;
mod progress;
mod task;

pub use downloader::ResumableDownloader;
pub use progress::{DownloadObserver, DownloadProgress, NoopObserver};
pub use task::{DownloadOutcome, DownloadState, DownloadTask};
