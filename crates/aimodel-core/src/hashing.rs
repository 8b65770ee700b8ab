//! Streaming SHA-256 with a sidecar-backed cache.
//!
//! The digest of a multi-gigabyte model file is expensive, so the result is
//! stored in the file's sidecar together with the size and mtime observed
//! before hashing. A later call that sees the same size and mtime returns
//! the cached digest after a single `stat`.

use crate::config::HashConfig;
use crate::error::{AimodelError, IntegrityMismatch, Result};
use crate::library::{HashCacheEntry, Sidecar};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Compute the SHA-256 of a file as lowercase hex, reading in fixed chunks.
pub fn compute_sha256(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| AimodelError::hash_failure(path, e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HashConfig::CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| AimodelError::hash_failure(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check a file against an expected SHA-256 (case-insensitive).
pub fn verify_sha256(path: impl AsRef<Path>, expected: &str) -> Result<String> {
    let path = path.as_ref();
    let actual = compute_sha256(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(actual)
    } else {
        Err(AimodelError::IntegrityFailure {
            path: path.to_path_buf(),
            mismatch: IntegrityMismatch::Hash {
                expected: expected.to_lowercase(),
                actual,
            },
        })
    }
}

/// Result of [`ContentHasher::hash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashOutcome {
    pub digest: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// True when no content was read.
    pub from_cache: bool,
}

/// Content hasher with a per-file cache stored in the sidecar.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    /// Create a hasher. It holds no state; the cache lives in sidecars.
    pub fn new() -> Self {
        Self
    }

    /// The cache entry for `path`, if it is still valid for the live file.
    pub fn cached(&self, path: &Path) -> Option<HashCacheEntry> {
        let (size, modified_at) = stat(path).ok()?;
        Sidecar::load_or_default(path)
            .hash_cache
            .filter(|entry| entry.matches(size, modified_at))
    }

    /// Hash on the blocking pool.
    pub async fn hash(&self, path: impl Into<PathBuf>) -> Result<HashOutcome> {
        let path = path.into();
        let hasher = *self;
        tokio::task::spawn_blocking(move || hasher.hash_blocking(&path))
            .await
            .map_err(|e| AimodelError::Other(format!("Hash task failed: {}", e)))?
    }

    /// Hash on the current thread.
    ///
    /// A fresh digest is persisted before returning. If the file changes
    /// while it is being read, nothing is persisted and a `HashFailure`
    /// is returned.
    pub fn hash_blocking(&self, path: &Path) -> Result<HashOutcome> {
        let (size, modified_at) = stat(path)?;
        let mut sidecar = Sidecar::load_or_default(path);

        if let Some(entry) = sidecar
            .hash_cache
            .as_ref()
            .filter(|entry| entry.matches(size, modified_at))
        {
            debug!("Hash cache hit for {}", path.display());
            return Ok(HashOutcome {
                digest: entry.hash.clone(),
                size,
                modified_at,
                from_cache: true,
            });
        }

        debug!("Hashing {} ({} bytes)", path.display(), size);
        let digest = compute_sha256(path)?;

        let (size_after, modified_after) = stat(path)?;
        if size_after != size || modified_after != modified_at {
            return Err(AimodelError::HashFailure {
                path: path.to_path_buf(),
                message: "file changed while hashing".to_string(),
                source: None,
            });
        }

        sidecar.record_hash(HashCacheEntry {
            hash: digest.clone(),
            size,
            modified_at,
            computed_at: Utc::now(),
        });
        if let Err(e) = sidecar.save(path) {
            warn!("Failed to persist hash for {}: {}", path.display(), e);
        }

        Ok(HashOutcome {
            digest,
            size,
            modified_at,
            from_cache: false,
        })
    }

    /// Record a digest that was verified while the file was written, so the
    /// next [`hash`](Self::hash) is a cache hit.
    pub fn seed(&self, path: &Path, digest: &str) -> Result<HashOutcome> {
        let (size, modified_at) = stat(path)?;
        let digest = digest.to_lowercase();
        let mut sidecar = Sidecar::load_or_default(path);
        sidecar.record_hash(HashCacheEntry {
            hash: digest.clone(),
            size,
            modified_at,
            computed_at: Utc::now(),
        });
        sidecar.save(path)?;
        Ok(HashOutcome {
            digest,
            size,
            modified_at,
            from_cache: true,
        })
    }
}

fn stat(path: &Path) -> Result<(u64, DateTime<Utc>)> {
    let metadata = std::fs::metadata(path).map_err(|e| AimodelError::hash_failure(path, e))?;
    if !metadata.is_file() {
        return Err(AimodelError::HashFailure {
            path: path.to_path_buf(),
            message: "not a regular file".to_string(),
            source: None,
        });
    }
    let modified = metadata
        .modified()
        .map_err(|e| AimodelError::hash_failure(path, e))?;
    Ok((metadata.len(), DateTime::<Utc>::from(modified)))
}
