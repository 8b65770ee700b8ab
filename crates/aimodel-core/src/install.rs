//! Fetching one registry version into the local library.
//!
//! Shared by update remediation and download-by-id: resolve the signed
//! location, fetch it resumably, then write the sidecar and preview.

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::download::{DownloadOutcome, DownloadTask, ResumableDownloader};
use crate::error::{AimodelError, Result};
use crate::library::MetadataCompleter;
use crate::organizer::clean_filename;
use crate::registry::{DynRegistry, HashMatch, VersionRecord};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What to install and where.
#[derive(Debug, Clone)]
pub struct InstallRequest<'a> {
    pub version: &'a VersionRecord,
    /// `None` selects the primary file.
    pub file_id: Option<u64>,
    pub dest_dir: PathBuf,
    pub model_name: Option<String>,
    pub model_type: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct Installer {
    registry: DynRegistry,
    downloader: ResumableDownloader,
    completer: MetadataCompleter,
    overwrite: bool,
    cancel: CancellationToken,
}

impl Installer {
    /// Create an installer. `overwrite_existing` is taken from `settings`.
    pub fn new(
        registry: DynRegistry,
        downloader: ResumableDownloader,
        completer: MetadataCompleter,
        settings: &Settings,
    ) -> Self {
        Self {
            registry,
            downloader,
            completer,
            overwrite: settings.overwrite_existing,
            cancel: CancellationToken::new(),
        }
    }

    /// Token attached to every transfer this installer starts.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token attached to every transfer this installer starts.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fetch the requested file of `request.version`.
    ///
    /// An existing destination is only replaced with `overwrite_existing`.
    /// A sidecar write failure after a completed transfer is logged; the
    /// next scan rebuilds it.
    pub async fn install(&self, request: InstallRequest<'_>) -> Result<DownloadOutcome> {
        let version = request.version;
        let resolved = self
            .registry
            .resolve_download_url(version.version_id, request.file_id)
            .await?;

        let destination = request.dest_dir.join(clean_filename(&resolved.file_name));
        check_destination(&destination, self.overwrite)?;

        info!(
            "Installing {} ({}) to {}",
            version.name,
            version.version_id,
            destination.display()
        );
        let task = DownloadTask::new(resolved.url.clone(), &destination)
            .with_expected_size(resolved.expected_size)
            .with_expected_hash(resolved.expected_hash.clone())
            .with_cancel(self.cancel.clone());

        let outcome = self.downloader.fetch(&task).await?;
        if let DownloadOutcome::Completed { path, digest, .. } = &outcome {
            let file = match request.file_id {
                Some(id) => version.file(id),
                None => version.primary_file(),
            }
            .cloned();
            let matched = HashMatch::for_version(
                version,
                request.model_name,
                request.model_type,
                request.description,
                file,
            );
            if let Err(e) = self
                .completer
                .record_download(path, &matched, digest.as_deref())
                .await
            {
                warn!("Failed to write sidecar for {}: {}", path.display(), e);
            }
        }
        Ok(outcome)
    }
}

fn check_destination(destination: &Path, overwrite: bool) -> Result<()> {
    if destination.exists() && !overwrite {
        return Err(AimodelError::Config {
            message: format!(
                "{} already exists; enable overwrite_existing to replace it",
                destination.display()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_existing_destination_needs_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.safetensors");
        assert!(check_destination(&path, false).is_ok());

        std::fs::write(&path, b"x").unwrap();
        let err = check_destination(&path, false).unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::Config);
        assert!(check_destination(&path, true).is_ok());
    }
}
