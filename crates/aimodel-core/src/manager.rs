//! Facade wiring the components from one [`Settings`] value.

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::download::{DownloadObserver, DownloadOutcome, ResumableDownloader};
use crate::error::{AimodelError, Result};
use crate::hashing::{ContentHasher, HashOutcome};
use crate::install::{InstallRequest, Installer};
use crate::library::{
    CompletionOptions, CompletionStatus, IndexedModel, LocalModelIndex, MetadataCompleter,
    ScanItem, ScanOptions, ScanReport, Sidecar,
};
use crate::network::HttpClient;
use crate::organizer::{infer_model_type, PathOrganizer};
use crate::reconcile::{Classification, ReconcileEntry, ReconcileReport, UpdateReconciler};
use crate::registry::{CivitaiClient, DynRegistry, RemoteModel};
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Builder for [`ModelManager`].
///
/// # Example
///
/// ```rust,ignore
/// use aimodel_core::{ModelManager, Settings};
///
/// let manager = ModelManager::builder(Settings::default())
///     .with_observer(Arc::new(MyProgress))
///     .build()?;
/// ```
pub struct ModelManagerBuilder {
    settings: Settings,
    registry: Option<DynRegistry>,
    observer: Option<Arc<dyn DownloadObserver>>,
    cancel: CancellationToken,
}

impl ModelManagerBuilder {
    /// Start from `settings` with a Civitai registry, no observer and a fresh token.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            registry: None,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `registry` instead of a Civitai client built from the settings.
    pub fn with_registry(mut self, registry: DynRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Receive progress and state changes of every transfer.
    pub fn with_observer(mut self, observer: Arc<dyn DownloadObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Token shared by every transfer the manager starts.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the settings and wire the components.
    pub fn build(self) -> Result<ModelManager> {
        let settings = self.settings;
        settings.validate()?;

        let http = HttpClient::from_settings(&settings)?;
        let registry: DynRegistry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(CivitaiClient::from_settings(&settings)?),
        };

        let mut downloader = ResumableDownloader::new(http.clone(), settings.retry_policy());
        if let Some(observer) = self.observer {
            downloader = downloader.with_observer(observer);
        }

        let completer = MetadataCompleter::new(registry.clone(), http, &settings);
        let installer = Installer::new(registry.clone(), downloader, completer.clone(), &settings)
            .with_cancel(self.cancel);

        Ok(ModelManager {
            index: LocalModelIndex::new(registry.clone(), settings.clone()),
            reconciler: UpdateReconciler::new(registry.clone(), installer.clone()),
            organizer: PathOrganizer::new(settings.folder_overrides.clone()),
            hasher: ContentHasher::new(),
            completer,
            installer,
            registry,
            settings,
        })
    }
}

/// Result of [`ModelManager::update_file`].
#[derive(Debug, Clone)]
pub struct FileUpdate {
    pub entry: ReconcileEntry,
    pub download: Option<DownloadOutcome>,
}

/// Local view of one model file.
#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub path: PathBuf,
    pub size: u64,
    pub model_type: String,
    /// `None` when the file has no sidecar yet.
    pub sidecar: Option<Sidecar>,
}

/// Entry point for hashing, scanning, reconciling and downloading.
pub struct ModelManager {
    settings: Settings,
    registry: DynRegistry,
    hasher: ContentHasher,
    index: LocalModelIndex,
    completer: MetadataCompleter,
    reconciler: UpdateReconciler,
    installer: Installer,
    organizer: PathOrganizer,
}

impl ModelManager {
    /// Shorthand for [`ModelManagerBuilder::new`].
    pub fn builder(settings: Settings) -> ModelManagerBuilder {
        ModelManagerBuilder::new(settings)
    }

    /// Settings the manager was built from.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registry shared by every component.
    pub fn registry(&self) -> &DynRegistry {
        &self.registry
    }

    /// Cancelling this token stops active transfers after the current chunk.
    pub fn cancel_token(&self) -> &CancellationToken {
        self.installer.cancel_token()
    }

    /// Configured directory for a model type.
    pub fn model_dir(&self, model_type: &str) -> PathBuf {
        self.organizer.resolve_dir(
            &self.settings.default_download_path,
            &self.settings.model_paths,
            model_type,
        )
    }

    /// SHA-256 of a file, streamed.
    pub async fn hash_file(&self, path: &Path) -> Result<HashOutcome> {
        self.hasher.hash(path).await
    }

    /// Hash one file and resolve its remote identity, using the sidecar
    /// cache unless `refresh` is set.
    pub async fn identify(&self, path: &Path, refresh: bool) -> Result<IndexedModel> {
        self.index.index_file(path, refresh).await
    }

    /// Lazily identify every model file under `root`.
    pub fn scan<'a>(&'a self, root: &Path, options: ScanOptions) -> BoxStream<'a, ScanItem> {
        self.index.scan(root, options)
    }

    /// Collect [`Self::scan`] into a report.
    pub async fn scan_all(&self, root: &Path, options: ScanOptions) -> ScanReport {
        self.index.scan_all(root, options).await
    }

    /// Fill in missing metadata and the preview for an identified file.
    pub async fn complete_metadata(
        &self,
        model: &IndexedModel,
        options: CompletionOptions,
    ) -> Result<CompletionStatus> {
        self.completer.complete(model, options).await
    }

    /// Scan `root` and classify every file. Scan failures are carried into
    /// the report.
    pub async fn check_updates(&self, root: &Path, options: ScanOptions) -> ReconcileReport {
        let scanned = self.index.scan_all(root, options).await;
        let mut report = self.reconciler.reconcile(&scanned.models).await;
        report.failures.extend(scanned.failures);
        report
    }

    /// Classify already indexed files.
    pub async fn reconcile(&self, models: &[IndexedModel]) -> ReconcileReport {
        self.reconciler.reconcile(models).await
    }

    /// Fetch the update target of `entry`, or `version_id` when given.
    /// See [`UpdateReconciler::download_update`].
    pub async fn download_update(
        &self,
        entry: &ReconcileEntry,
        version_id: Option<u64>,
        dest_dir: Option<&Path>,
    ) -> Result<DownloadOutcome> {
        self.reconciler
            .download_update(entry, version_id, dest_dir)
            .await
    }

    /// Identify and classify a single file, then fetch a new version next
    /// to it.
    ///
    /// Nothing is downloaded when the file is current and no `version_id`
    /// was asked for; the returned update then has no download.
    pub async fn update_file(&self, path: &Path, version_id: Option<u64>) -> Result<FileUpdate> {
        let model = self.index.index_file(path, false).await?;
        let entry = self.reconciler.reconcile_one(&model).await?;

        let wanted = version_id.is_some()
            || matches!(entry.classification, Classification::UpdateAvailable(_));
        let download = if wanted {
            Some(self.download_update(&entry, version_id, None).await?)
        } else {
            info!(
                "{} is {}, nothing to download",
                path.display(),
                entry.classification.as_str()
            );
            None
        };
        Ok(FileUpdate { entry, download })
    }

    /// Registry record of a model and all its versions.
    pub async fn model_info(&self, model_id: u64) -> Result<RemoteModel> {
        self.registry.get_model(model_id).await
    }

    /// What the library knows about a local file without contacting the
    /// registry. The model type falls back to a guess from the path and
    /// size when no sidecar records one.
    pub async fn local_info(&self, path: &Path) -> Result<LocalInfo> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| AimodelError::io_with_path(e, path))?;
        let sidecar = Sidecar::load(path)?;
        let model_type = sidecar
            .as_ref()
            .and_then(|s| s.model_type.clone())
            .unwrap_or_else(|| infer_model_type(path, meta.len()).to_string());
        Ok(LocalInfo {
            path: path.to_path_buf(),
            size: meta.len(),
            model_type,
            sidecar,
        })
    }

    /// Download a model by registry id.
    ///
    /// Without `version_id` the latest published version is used; without
    /// `file_id` its primary file. Without `save_dir` the file goes to the
    /// configured directory for the model's type.
    pub async fn download_model(
        &self,
        model_id: u64,
        version_id: Option<u64>,
        file_id: Option<u64>,
        save_dir: Option<&Path>,
    ) -> Result<DownloadOutcome> {
        let model = self.registry.get_model(model_id).await?;
        let version = match version_id {
            Some(id) => model.version(id).ok_or_else(|| AimodelError::NotFound {
                what: format!("version {} of model {}", id, model_id),
            })?,
            None => model.latest_version().ok_or_else(|| AimodelError::NotFound {
                what: format!("published version of model {}", model_id),
            })?,
        };

        let dest_dir = match save_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.model_dir(&model.model_type),
        };
        info!(
            "Downloading {} {} into {}",
            model.name,
            version.name,
            dest_dir.display()
        );

        self.installer
            .install(InstallRequest {
                version,
                file_id,
                dest_dir,
                model_name: Some(model.name.clone()),
                model_type: Some(model.model_type.clone()),
                description: model.description.clone(),
            })
            .await
    }
}
