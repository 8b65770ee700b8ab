//! Resumable single-file transfers.
//!
//! Bytes land in `<destination>.part`. The size of that file is the resume
//! offset for the next attempt, so an interrupted process picks up where the
//! filesystem says it stopped. Only a verified file is renamed onto the
//! destination.

use super::progress::{DownloadObserver, NoopObserver, SpeedTracker};
use super::task::{DownloadOutcome, DownloadState, DownloadTask};
use crate::config::Settings;
use crate::error::{AimodelError, IntegrityMismatch, Result};
use crate::hashing::verify_sha256;
use crate::network::{check_status, retry_async, HttpClient, RetryPolicy};
use futures::StreamExt;
use reqwest::{header, Response, StatusCode};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

type ActiveSet = Arc<Mutex<HashSet<PathBuf>>>;

/// How one attempt ended without an error.
enum AttemptEnd {
    Finished { bytes: u64, resumed_from: u64 },
    Cancelled { bytes_on_disk: u64 },
}

/// Downloads files with resume, retry and integrity checks.
///
/// Clones share the set of active destinations, so a second `fetch` for a
/// destination that is already being written fails with `ConflictFailure`.
#[derive(Clone)]
pub struct ResumableDownloader {
    client: HttpClient,
    retry: RetryPolicy,
    observer: Arc<dyn DownloadObserver>,
    active: ActiveSet,
}

impl std::fmt::Debug for ResumableDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableDownloader")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ResumableDownloader {
    /// Create a downloader that reports to no observer.
    pub fn new(client: HttpClient, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            observer: Arc::new(NoopObserver),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Build a downloader with clients and retry policy from user settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            HttpClient::from_settings(settings)?,
            settings.retry_policy(),
        ))
    }

    /// Send progress and state changes to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn DownloadObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Whether a transfer to `destination` is in progress.
    pub fn is_active(&self, destination: &Path) -> bool {
        let key = active_key(destination);
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&key)
    }

    /// Transfer `task.source_url` to `task.destination`.
    ///
    /// The observer sees `Pending` once the destination is claimed, `Active`
    /// once its directory exists, then one terminal state.
    /// Cancellation is not an error: the partial file is kept and
    /// [`DownloadOutcome::Cancelled`] is returned.
    pub async fn fetch(&self, task: &DownloadTask) -> Result<DownloadOutcome> {
        let _guard = ActiveGuard::acquire(&self.active, &task.destination)?;
        let destination = &task.destination;
        self.observer.on_state(destination, DownloadState::Pending);

        let result = match prepare_parent(destination).await {
            Ok(()) => {
                self.observer.on_state(destination, DownloadState::Active);
                self.run(task).await
            }
            Err(e) => Err(e),
        };
        let state = match &result {
            Ok(DownloadOutcome::Completed { .. }) => DownloadState::Completed,
            Ok(DownloadOutcome::Cancelled { .. }) => DownloadState::Cancelled,
            Err(e) => {
                warn!("Download of {} failed: {}", destination.display(), e);
                DownloadState::Failed
            }
        };
        self.observer.on_state(destination, state);
        result
    }

    async fn run(&self, task: &DownloadTask) -> Result<DownloadOutcome> {
        let (result, stats) = retry_async(
            &self.retry,
            || self.attempt(task),
            |e| self.retry.should_retry(e),
        )
        .await;
        if stats.attempts > 1 {
            debug!(
                "{} took {} attempts ({:?} backoff)",
                task.destination.display(),
                stats.attempts,
                stats.total_delay
            );
        }

        let partial = task.partial_path();
        match result? {
            AttemptEnd::Cancelled { bytes_on_disk } => {
                info!(
                    "Download of {} cancelled with {} bytes on disk",
                    task.destination.display(),
                    bytes_on_disk
                );
                Ok(DownloadOutcome::Cancelled {
                    partial_path: partial,
                    bytes_on_disk,
                })
            }
            AttemptEnd::Finished {
                bytes,
                resumed_from,
            } => {
                let digest = self.verify(task, bytes).await?;
                tokio::fs::rename(&partial, &task.destination)
                    .await
                    .map_err(|e| AimodelError::Io {
                        message: format!(
                            "Failed to move {} into place: {}",
                            partial.display(),
                            e
                        ),
                        path: Some(task.destination.clone()),
                        source: Some(e),
                    })?;
                info!("Downloaded {} ({} bytes)", task.destination.display(), bytes);
                Ok(DownloadOutcome::Completed {
                    path: task.destination.clone(),
                    bytes,
                    resumed_from,
                    digest,
                })
            }
        }
    }

    /// One request plus body stream. Resumes from the partial file when the
    /// server honours the range.
    async fn attempt(&self, task: &DownloadTask) -> Result<AttemptEnd> {
        let partial = task.partial_path();
        let mut offset = partial_len(&partial).await;

        if let Some(expected) = task.expected_size {
            if offset > expected {
                warn!(
                    "{} holds {} bytes but {} are expected, restarting",
                    partial.display(),
                    offset,
                    expected
                );
                discard(&partial).await;
                offset = 0;
            } else if offset == expected && offset > 0 {
                debug!("{} is already complete", partial.display());
                return Ok(AttemptEnd::Finished {
                    bytes: offset,
                    resumed_from: offset,
                });
            }
        }

        if task.cancel.is_cancelled() {
            return Ok(AttemptEnd::Cancelled {
                bytes_on_disk: offset,
            });
        }

        let (response, resumed) = self.open_stream(task, offset).await?;
        let offset = if resumed { offset } else { 0 };
        let total = task
            .expected_size
            .or_else(|| total_from_response(&response, offset));

        let opened = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await
        } else {
            tokio::fs::File::create(&partial).await
        };
        let mut file = opened.map_err(|e| AimodelError::io_with_path(e, &partial))?;

        let idle = self.client.timeout();
        let mut stream = response.bytes_stream();
        let mut written = offset;
        let mut tracker = SpeedTracker::new(offset);

        loop {
            if task.cancel.is_cancelled() {
                file.flush()
                    .await
                    .map_err(|e| AimodelError::io_with_path(e, &partial))?;
                return Ok(AttemptEnd::Cancelled {
                    bytes_on_disk: written,
                });
            }

            let next = tokio::time::timeout(idle, stream.next())
                .await
                .map_err(|_| AimodelError::TimeoutFailure {
                    operation: format!("download of {}", task.source_url),
                    timeout: idle,
                })?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| self.client.map_error(e))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| AimodelError::io_with_path(e, &partial))?;
            file.flush()
                .await
                .map_err(|e| AimodelError::io_with_path(e, &partial))?;
            written += chunk.len() as u64;

            if tracker.due() {
                self.observer
                    .on_progress(&tracker.snapshot(&task.destination, written, total));
            }
        }

        file.sync_all()
            .await
            .map_err(|e| AimodelError::io_with_path(e, &partial))?;
        self.observer
            .on_progress(&tracker.snapshot(&task.destination, written, total));

        Ok(AttemptEnd::Finished {
            bytes: written,
            resumed_from: offset,
        })
    }

    /// Issue the request, falling back to a full transfer when the range
    /// is refused, ignored or answered for the wrong offset.
    async fn open_stream(&self, task: &DownloadTask, offset: u64) -> Result<(Response, bool)> {
        let url = task.source_url.as_str();
        let mut offset = offset;

        loop {
            let response = self.send(url, offset).await?;
            let status = response.status();

            if offset == 0 {
                return Ok((check_status(response, url)?, false));
            }

            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                warn!("Range from byte {} refused for {}, restarting", offset, url);
                discard(&task.partial_path()).await;
                offset = 0;
                continue;
            }

            let response = check_status(response, url)?;
            if status == StatusCode::PARTIAL_CONTENT {
                if content_range_start(&response) == Some(offset) {
                    info!("Resuming {} from byte {}", task.destination.display(), offset);
                    return Ok((response, true));
                }
                warn!("Partial response for {} does not start at {}, restarting", url, offset);
                discard(&task.partial_path()).await;
                offset = 0;
                continue;
            }

            warn!("Server ignored range request for {}, restarting from zero", url);
            return Ok((response, false));
        }
    }

    async fn send(&self, url: &str, offset: u64) -> Result<Response> {
        let mut request = self.client.transfer().get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }

        let timeout = self.client.timeout();
        tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| AimodelError::TimeoutFailure {
                operation: format!("request to {}", url),
                timeout,
            })?
            .map_err(|e| self.client.map_error(e))
    }

    async fn verify(&self, task: &DownloadTask, bytes: u64) -> Result<Option<String>> {
        let partial = task.partial_path();

        if let Some(expected) = task.expected_size {
            if bytes != expected {
                discard(&partial).await;
                return Err(AimodelError::IntegrityFailure {
                    path: task.destination.clone(),
                    mismatch: IntegrityMismatch::Size {
                        expected,
                        actual: bytes,
                    },
                });
            }
        }

        let Some(expected_hash) = task.expected_hash.clone() else {
            return Ok(None);
        };
        let path = partial.clone();
        let verified = tokio::task::spawn_blocking(move || verify_sha256(&path, &expected_hash))
            .await
            .map_err(|e| AimodelError::Other(format!("Verification task failed: {}", e)))?;

        match verified {
            Ok(digest) => Ok(Some(digest)),
            Err(AimodelError::IntegrityFailure { mismatch, .. }) => {
                discard(&partial).await;
                Err(AimodelError::IntegrityFailure {
                    path: task.destination.clone(),
                    mismatch,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Marks a destination as being written until dropped.
struct ActiveGuard {
    active: ActiveSet,
    key: PathBuf,
}

impl ActiveGuard {
    fn acquire(active: &ActiveSet, destination: &Path) -> Result<Self> {
        let key = active_key(destination);
        let mut set = active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(key.clone()) {
            return Err(AimodelError::ConflictFailure(destination.to_path_buf()));
        }
        Ok(Self {
            active: active.clone(),
            key,
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

async fn prepare_parent(destination: &Path) -> Result<()> {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AimodelError::io_with_path(e, parent)),
        _ => Ok(()),
    }
}

fn active_key(destination: &Path) -> PathBuf {
    std::path::absolute(destination).unwrap_or_else(|_| destination.to_path_buf())
}

async fn partial_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Start offset of a `Content-Range: bytes start-end/total` header.
fn content_range_start(response: &Response) -> Option<u64> {
    let value = response.headers().get(header::CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range(value).map(|(start, _)| start)
}

fn total_from_response(response: &Response, offset: u64) -> Option<u64> {
    let from_range = response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
        .and_then(|(_, total)| total);
    from_range.or_else(|| response.content_length().map(|len| len + offset))
}

fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let start = range.split('-').next()?.trim().parse().ok()?;
    Some((start, total.trim().parse().ok()))
}
