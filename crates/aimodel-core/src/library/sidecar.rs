//! Per-model JSON sidecar (`<stem>.json`).
//!
//! Holds the remote identity, the hash cache entry and whatever descriptive
//! fields the registry provided. Unknown keys are preserved on rewrite so
//! sidecars written by other tools survive.
//!
//! Files that share a stem (`style.safetensors` and `style.ckpt`) share the
//! document, so digest, identity and cache entry are kept per file name in
//! the `files` map. The top-level copies mirror the last file written, for
//! tools that only read those keys.

use crate::config::PathsConfig;
use crate::metadata::{atomic_read_json, atomic_write_json};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Cached digest of a model file, valid while size and mtime are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashCacheEntry {
    pub hash: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

impl HashCacheEntry {
    /// True when the live file still has the observed size and mtime.
    ///
    /// Size plus mtime is a heuristic: a rewrite that preserves both goes
    /// unnoticed.
    pub fn matches(&self, size: u64, modified_at: DateTime<Utc>) -> bool {
        self.size == size && self.modified_at == modified_at
    }
}

/// Digest and identity of one model file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_cache: Option<HashCacheEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unidentified_hash: Option<String>,
}

/// Sidecar contents, as seen from one model file.
///
/// The per-file fields (`sha256`, identity, `hash_cache`,
/// `unidentified_hash`) describe the file the sidecar was loaded for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_cache: Option<HashCacheEntry>,
    /// Digest the registry did not recognise, cached to skip repeat lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unidentified_hash: Option<String>,
    /// Per-file records keyed by file name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileRecord>,
    /// Registry-provided descriptive fields (`activation text`, `sd version`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Sidecar {
    /// `<stem>.json` next to the model file.
    pub fn path_for(model_path: &Path) -> PathBuf {
        model_path.with_extension(PathsConfig::SIDECAR_EXTENSION)
    }

    /// `<stem>.preview.png` next to the model file.
    pub fn preview_path_for(model_path: &Path) -> PathBuf {
        model_path.with_extension(PathsConfig::PREVIEW_EXTENSION)
    }

    /// Read the sidecar and select the record for `model_path`.
    ///
    /// A sidecar without a `files` map predates per-file records; its
    /// top-level fields are taken as they are.
    pub fn load(model_path: &Path) -> Result<Option<Sidecar>> {
        let Some(mut sidecar) = atomic_read_json::<Sidecar>(&Self::path_for(model_path))? else {
            return Ok(None);
        };
        if !sidecar.files.is_empty() {
            let record = file_key(model_path)
                .and_then(|key| sidecar.files.get(&key).cloned())
                .unwrap_or_default();
            sidecar.apply_record(record);
        }
        Ok(Some(sidecar))
    }

    /// Load the sidecar, treating a missing or unreadable one as empty.
    pub fn load_or_default(model_path: &Path) -> Sidecar {
        match Self::load(model_path) {
            Ok(sidecar) => sidecar.unwrap_or_default(),
            Err(e) => {
                warn!("Ignoring unreadable sidecar for {}: {}", model_path.display(), e);
                Sidecar::default()
            }
        }
    }

    /// Write this file's record. Records of other files are taken from
    /// disk, so a stale copy never rolls back a sibling.
    pub fn save(&self, model_path: &Path) -> Result<()> {
        let path = Self::path_for(model_path);
        let key = file_key(model_path);

        let mut document = self.clone();
        if let Ok(Some(on_disk)) = atomic_read_json::<Sidecar>(&path) {
            for (name, record) in on_disk.files {
                if key.as_deref() != Some(name.as_str()) {
                    document.files.insert(name, record);
                }
            }
        }
        if let Some(key) = key {
            document.files.insert(key, self.record());
        }
        atomic_write_json(&path, &document)
    }

    /// This file's digest and identity.
    pub fn record(&self) -> FileRecord {
        FileRecord {
            sha256: self.sha256.clone(),
            model_id: self.model_id,
            model_version_id: self.model_version_id,
            hash_cache: self.hash_cache.clone(),
            unidentified_hash: self.unidentified_hash.clone(),
        }
    }

    fn apply_record(&mut self, record: FileRecord) {
        self.sha256 = record.sha256;
        self.model_id = record.model_id;
        self.model_version_id = record.model_version_id;
        self.hash_cache = record.hash_cache;
        self.unidentified_hash = record.unidentified_hash;
    }

    /// Remote `(model_id, version_id)` when both are known.
    pub fn identity(&self) -> Option<(u64, u64)> {
        Some((self.model_id?, self.model_version_id?))
    }

    /// Record the remote identity and forget any "unidentified" verdict.
    pub fn set_identity(&mut self, model_id: u64, version_id: u64) {
        self.model_id = Some(model_id);
        self.model_version_id = Some(version_id);
        self.unidentified_hash = None;
    }

    /// Record a fresh digest; identity derived from a different digest is dropped.
    pub fn record_hash(&mut self, entry: HashCacheEntry) {
        let changed = self
            .sha256
            .as_deref()
            .is_some_and(|old| !old.eq_ignore_ascii_case(&entry.hash));
        if changed {
            self.model_id = None;
            self.model_version_id = None;
            self.unidentified_hash = None;
        }
        self.sha256 = Some(entry.hash.clone());
        self.hash_cache = Some(entry);
    }

    /// Whether a descriptive field is present.
    pub fn has_extra(&self, key: &str) -> bool {
        self.extra.contains_key(key)
    }

    /// Set a descriptive field, replacing any previous value.
    pub fn set_extra(&mut self, key: &str, value: impl Into<Value>) {
        self.extra.insert(key.to_string(), value.into());
    }

    /// A descriptive field, when it is a string.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

fn file_key(model_path: &Path) -> Option<String> {
    model_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
