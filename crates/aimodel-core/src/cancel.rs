//! Cooperative cancellation for transfers.
//!
//! A [`CancellationToken`] is cloned into a [`DownloadTask`](crate::download::DownloadTask);
//! the downloader polls it at every buffer boundary. Cancelling is not a
//! failure: the partial file stays on disk so the next fetch resumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag. All clones observe the same state.
///
/// # Example
///
/// ```
/// use aimodel_core::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
///
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next buffer boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so a cancelled task can be fetched again.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
