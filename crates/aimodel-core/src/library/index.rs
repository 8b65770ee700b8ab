//! Inventory of local model files and their registry identity.
//!
//! A scan walks a directory (or takes a single file), hashes each candidate
//! through [`ContentHasher`] and asks the registry who it is. Both the digest
//! and the verdict are cached in the sidecar, so a second scan over unchanged
//! files reads no content and makes no requests.

use super::sidecar::Sidecar;
use crate::config::Settings;
use crate::error::{FailureKind, FileFailure, Result};
use crate::hashing::ContentHasher;
use crate::registry::{is_unavailable, DynRegistry, HashMatch};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// How to walk the tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub recursive: bool,
    /// Ignore cached identities and ask the registry again.
    pub refresh: bool,
}

/// A model file as observed on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub content_hash: String,
    pub remote_model_id: Option<u64>,
    pub remote_version_id: Option<u64>,
}

/// Why a file has no remote identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnidentifiedReason {
    /// The registry answered and does not know the digest.
    UnknownHash,
    /// The registry could not be reached; the verdict is not cached.
    RegistryUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Identification {
    Identified {
        model_id: u64,
        version_id: u64,
        from_cache: bool,
    },
    Unidentified {
        reason: UnidentifiedReason,
        from_cache: bool,
    },
}

/// One scanned file with its identification outcome.
#[derive(Debug, Clone)]
pub struct IndexedModel {
    pub file: ModelFile,
    pub identification: Identification,
    pub hash_from_cache: bool,
    /// Registry data, present when the registry was asked during this scan.
    pub matched: Option<HashMatch>,
}

impl IndexedModel {
    /// Remote `(model_id, version_id)` when identified.
    pub fn identity(&self) -> Option<(u64, u64)> {
        match self.identification {
            Identification::Identified {
                model_id,
                version_id,
                ..
            } => Some((model_id, version_id)),
            Identification::Unidentified { .. } => None,
        }
    }

    /// Whether the registry knows this file.
    pub fn is_identified(&self) -> bool {
        self.identity().is_some()
    }

    /// True when neither hashing nor identification did any real work.
    pub fn fully_cached(&self) -> bool {
        let identity_cached = match self.identification {
            Identification::Identified { from_cache, .. } => from_cache,
            Identification::Unidentified { from_cache, .. } => from_cache,
        };
        self.hash_from_cache && identity_cached
    }
}

/// One element of a scan stream.
#[derive(Debug, Clone)]
pub enum ScanItem {
    Indexed(IndexedModel),
    Failed(FileFailure),
}

/// A collected scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub models: Vec<IndexedModel>,
    pub failures: Vec<FileFailure>,
}

impl ScanReport {
    /// Models with a remote identity.
    pub fn identified(&self) -> impl Iterator<Item = &IndexedModel> {
        self.models.iter().filter(|m| m.is_identified())
    }

    /// Models without a remote identity.
    pub fn unidentified(&self) -> impl Iterator<Item = &IndexedModel> {
        self.models.iter().filter(|m| !m.is_identified())
    }
}

/// Scans model directories and identifies their files.
#[derive(Clone)]
pub struct LocalModelIndex {
    registry: DynRegistry,
    hasher: ContentHasher,
    settings: Settings,
}

impl LocalModelIndex {
    /// Create an index that identifies files through `registry`.
    pub fn new(registry: DynRegistry, settings: Settings) -> Self {
        Self {
            registry,
            hasher: ContentHasher::new(),
            settings,
        }
    }

    /// Model files under `root` in filesystem order. Unreadable entries
    /// come back as failures instead of stopping the walk.
    pub fn candidates(
        &self,
        root: &Path,
        recursive: bool,
    ) -> Box<dyn Iterator<Item = std::result::Result<PathBuf, FileFailure>> + Send> {
        if root.is_file() {
            let item = if self.settings.is_model_file(root) {
                Ok(root.to_path_buf())
            } else {
                Err(FileFailure {
                    path: root.to_path_buf(),
                    kind: FailureKind::Config,
                    message: "not a supported model file".to_string(),
                })
            };
            return Box::new(std::iter::once(item));
        }

        if !root.is_dir() {
            return Box::new(std::iter::once(Err(FileFailure {
                path: root.to_path_buf(),
                kind: FailureKind::Io,
                message: "no such file or directory".to_string(),
            })));
        }

        let settings = self.settings.clone();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 });

        Box::new(walker.into_iter().filter_map(move |entry| match entry {
            Ok(entry) => {
                let is_candidate =
                    entry.file_type().is_file() && settings.is_model_file(entry.path());
                is_candidate.then(|| Ok(entry.into_path()))
            }
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                warn!("Skipping unreadable entry {}: {}", path.display(), e);
                Some(Err(FileFailure {
                    path,
                    kind: FailureKind::Io,
                    message: e.to_string(),
                }))
            }
        }))
    }

    /// Lazily hash and identify every candidate under `root`.
    pub fn scan<'a>(&'a self, root: &Path, options: ScanOptions) -> BoxStream<'a, ScanItem> {
        let candidates = self.candidates(root, options.recursive);
        stream::iter(candidates)
            .then(move |candidate| async move {
                match candidate {
                    Err(failure) => ScanItem::Failed(failure),
                    Ok(path) => match self.index_file(&path, options.refresh).await {
                        Ok(model) => ScanItem::Indexed(model),
                        Err(e) => {
                            warn!("Failed to index {}: {}", path.display(), e);
                            ScanItem::Failed(FileFailure::new(&path, &e))
                        }
                    },
                }
            })
            .boxed()
    }

    /// Run a scan to completion.
    pub async fn scan_all(&self, root: &Path, options: ScanOptions) -> ScanReport {
        let mut report = ScanReport::default();
        let mut items = self.scan(root, options);
        while let Some(item) = items.next().await {
            match item {
                ScanItem::Indexed(model) => report.models.push(model),
                ScanItem::Failed(failure) => report.failures.push(failure),
            }
        }
        info!(
            "Scanned {}: {} models, {} failures",
            root.display(),
            report.models.len(),
            report.failures.len()
        );
        report
    }

    /// Hash and identify a single file.
    pub async fn index_file(&self, path: &Path, refresh: bool) -> Result<IndexedModel> {
        let hashed = self.hasher.hash(path).await?;
        let digest = hashed.digest.clone();
        let mut sidecar = Sidecar::load_or_default(path);

        let file = |model_id: Option<u64>, version_id: Option<u64>| ModelFile {
            path: path.to_path_buf(),
            size: hashed.size,
            modified_at: hashed.modified_at,
            content_hash: digest.clone(),
            remote_model_id: model_id,
            remote_version_id: version_id,
        };

        let digest_matches = sidecar
            .sha256
            .as_deref()
            .is_some_and(|h| h.eq_ignore_ascii_case(&digest));

        if !refresh && digest_matches {
            if let Some((model_id, version_id)) = sidecar.identity() {
                debug!("Cached identity for {}", path.display());
                return Ok(IndexedModel {
                    file: file(Some(model_id), Some(version_id)),
                    identification: Identification::Identified {
                        model_id,
                        version_id,
                        from_cache: true,
                    },
                    hash_from_cache: hashed.from_cache,
                    matched: None,
                });
            }
            if sidecar
                .unidentified_hash
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(&digest))
            {
                debug!("Cached unidentified verdict for {}", path.display());
                return Ok(IndexedModel {
                    file: file(None, None),
                    identification: Identification::Unidentified {
                        reason: UnidentifiedReason::UnknownHash,
                        from_cache: true,
                    },
                    hash_from_cache: hashed.from_cache,
                    matched: None,
                });
            }
        }

        match self.registry.identify_by_hash(&digest).await {
            Ok(Some(matched)) => {
                sidecar.set_identity(matched.model_id, matched.version_id);
                if matched.model_name.is_some() {
                    sidecar.model_name = matched.model_name.clone();
                }
                if matched.model_type.is_some() {
                    sidecar.model_type = matched.model_type.clone();
                }
                persist(&sidecar, path);
                Ok(IndexedModel {
                    file: file(Some(matched.model_id), Some(matched.version_id)),
                    identification: Identification::Identified {
                        model_id: matched.model_id,
                        version_id: matched.version_id,
                        from_cache: false,
                    },
                    hash_from_cache: hashed.from_cache,
                    matched: Some(matched),
                })
            }
            Ok(None) => {
                sidecar.model_id = None;
                sidecar.model_version_id = None;
                sidecar.unidentified_hash = Some(digest.clone());
                persist(&sidecar, path);
                Ok(IndexedModel {
                    file: file(None, None),
                    identification: Identification::Unidentified {
                        reason: UnidentifiedReason::UnknownHash,
                        from_cache: false,
                    },
                    hash_from_cache: hashed.from_cache,
                    matched: None,
                })
            }
            Err(e) if is_unavailable(&e) => {
                warn!("Registry unavailable for {}: {}", path.display(), e);
                Ok(IndexedModel {
                    file: file(None, None),
                    identification: Identification::Unidentified {
                        reason: UnidentifiedReason::RegistryUnavailable,
                        from_cache: false,
                    },
                    hash_from_cache: hashed.from_cache,
                    matched: None,
                })
            }
            Err(e) => Err(e),
        }
    }
}

fn persist(sidecar: &Sidecar, path: &Path) {
    if let Err(e) = sidecar.save(path) {
        warn!("Failed to update sidecar for {}: {}", path.display(), e);
    }
}
