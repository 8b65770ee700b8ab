//! Registry-side records, independent of any particular registry's wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One downloadable file of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryFile {
    pub file_id: u64,
    pub name: String,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
    pub download_url: String,
    pub primary: bool,
}

/// Preview media attached to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewImage {
    pub url: String,
    /// `image` or `video`.
    pub kind: String,
}

/// A published version of a model. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version_id: u64,
    pub model_id: u64,
    pub name: String,
    pub published_at: DateTime<Utc>,
    /// Withdrawn, unpublished or not yet generally available.
    pub retracted: bool,
    pub base_model: Option<String>,
    pub trained_words: Vec<String>,
    pub files: Vec<RegistryFile>,
    pub images: Vec<PreviewImage>,
}

impl VersionRecord {
    /// The file flagged primary, else the first one.
    pub fn primary_file(&self) -> Option<&RegistryFile> {
        self.files
            .iter()
            .find(|f| f.primary)
            .or_else(|| self.files.first())
    }

    /// The file with `file_id`, if this version has it.
    pub fn file(&self, file_id: u64) -> Option<&RegistryFile> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    /// The first preview that is an image rather than a video.
    pub fn first_image(&self) -> Option<&PreviewImage> {
        self.images.iter().find(|i| i.kind == "image")
    }
}

/// A model with its full version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteModel {
    pub model_id: u64,
    pub name: String,
    pub model_type: String,
    pub nsfw: bool,
    pub description: Option<String>,
    pub versions: Vec<VersionRecord>,
}

impl RemoteModel {
    /// Newest non-retracted version by publish time.
    pub fn latest_version(&self) -> Option<&VersionRecord> {
        latest_of(&self.versions)
    }

    /// The version with `version_id`, if listed.
    pub fn version(&self, version_id: u64) -> Option<&VersionRecord> {
        self.versions.iter().find(|v| v.version_id == version_id)
    }
}

/// Newest non-retracted version by publish time, ties broken by id.
pub fn latest_of(versions: &[VersionRecord]) -> Option<&VersionRecord> {
    versions
        .iter()
        .filter(|v| !v.retracted)
        .max_by_key(|v| (v.published_at, v.version_id))
}

/// What the registry knows about a digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashMatch {
    pub model_id: u64,
    pub version_id: u64,
    pub version_name: String,
    pub model_name: Option<String>,
    pub model_type: Option<String>,
    pub base_model: Option<String>,
    pub trained_words: Vec<String>,
    pub description: Option<String>,
    pub images: Vec<PreviewImage>,
    /// The file whose digest matched, when the registry listed it.
    pub file: Option<RegistryFile>,
}

impl HashMatch {
    /// The match a file downloaded from `version` would produce.
    pub fn for_version(
        version: &VersionRecord,
        model_name: Option<String>,
        model_type: Option<String>,
        description: Option<String>,
        file: Option<RegistryFile>,
    ) -> Self {
        Self {
            model_id: version.model_id,
            version_id: version.version_id,
            version_name: version.name.clone(),
            model_name,
            model_type,
            base_model: version.base_model.clone(),
            trained_words: version.trained_words.clone(),
            description,
            images: version.images.clone(),
            file,
        }
    }

    /// The first preview that is an image rather than a video.
    pub fn first_image(&self) -> Option<&PreviewImage> {
        self.images.iter().find(|i| i.kind == "image")
    }
}

/// A concrete location to fetch a file from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDownload {
    pub url: String,
    pub expected_size: Option<u64>,
    pub expected_hash: Option<String>,
    pub file_name: String,
}
