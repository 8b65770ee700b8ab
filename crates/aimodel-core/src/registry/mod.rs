//! Remote model registry contract and the Civitai implementation.
//!
//! Everything above this module talks to [`ModelRegistry`] only, so tests
//! and alternative registries plug in through [`DynRegistry`].

mod civitai;
mod types;

pub use civitai::{parse_model_url, CivitaiClient};
pub(crate) use civitai::is_unavailable;
pub use types::{
    latest_of, HashMatch, PreviewImage, RegistryFile, RemoteModel, ResolvedDownload,
    VersionRecord,
};

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Operations the core needs from a registry. Implementations own their
/// retry behaviour for transient failures.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Look up a SHA-256 digest. `Ok(None)` means the registry does not know it.
    async fn identify_by_hash(&self, digest: &str) -> Result<Option<HashMatch>>;

    /// A model with all of its versions. Unknown ids are `NotFound`.
    async fn get_model(&self, model_id: u64) -> Result<RemoteModel>;

    /// Versions of a model ordered by publish time, oldest first.
    async fn list_versions(&self, model_id: u64) -> Result<Vec<VersionRecord>> {
        let mut versions = self.get_model(model_id).await?.versions;
        versions.sort_by_key(|v| (v.published_at, v.version_id));
        Ok(versions)
    }

    /// Signed location plus expected size and digest of a version's file.
    /// `file_id = None` selects the primary file.
    async fn resolve_download_url(
        &self,
        version_id: u64,
        file_id: Option<u64>,
    ) -> Result<ResolvedDownload>;
}

/// Shared registry handle.
pub type DynRegistry = Arc<dyn ModelRegistry>;
