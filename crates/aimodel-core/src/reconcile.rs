//! Classification of local files against the registry's version history.

use crate::download::DownloadOutcome;
use crate::error::{AimodelError, FailureKind, FileFailure, Result};
use crate::install::{InstallRequest, Installer};
use crate::library::{IndexedModel, ModelFile, Sidecar, DESCRIPTION_KEY};
use crate::registry::{latest_of, DynRegistry, VersionRecord};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Where a local file stands relative to its model's versions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "target", rename_all = "snake_case")]
pub enum Classification {
    UpToDate,
    UpdateAvailable(VersionRecord),
    /// The file's version (or its whole model) is gone from the registry.
    Orphaned,
    /// The registry does not know the file's digest.
    Unidentified,
}

impl Classification {
    /// Stable snake_case name of the classification.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "up_to_date",
            Self::UpdateAvailable(_) => "update_available",
            Self::Orphaned => "orphaned",
            Self::Unidentified => "unidentified",
        }
    }
}

/// Classify a local version against every version of its model.
///
/// `Orphaned` when the local version is not listed; `UpToDate` when it was
/// published no earlier than the newest non-retracted version (or when
/// every version is retracted); otherwise `UpdateAvailable(latest)`.
pub fn classify(local_version_id: u64, versions: &[VersionRecord]) -> Classification {
    let Some(current) = versions.iter().find(|v| v.version_id == local_version_id) else {
        return Classification::Orphaned;
    };
    match latest_of(versions) {
        Some(latest) if current.published_at < latest.published_at => {
            Classification::UpdateAvailable(latest.clone())
        }
        _ => Classification::UpToDate,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileEntry {
    pub file: ModelFile,
    pub classification: Classification,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub entries: Vec<ReconcileEntry>,
    pub failures: Vec<FileFailure>,
}

impl ReconcileReport {
    /// Entries with a newer version available.
    pub fn updates(&self) -> impl Iterator<Item = &ReconcileEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.classification, Classification::UpdateAvailable(_)))
    }

    /// Number of entries whose classification is named `status`.
    pub fn count(&self, status: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.classification.as_str() == status)
            .count()
    }
}

enum VersionLookup {
    Found(Vec<VersionRecord>),
    Missing,
    Failed { kind: FailureKind, message: String },
}

/// Compares identified files with the registry and fetches updates on request.
#[derive(Clone)]
pub struct UpdateReconciler {
    registry: DynRegistry,
    installer: Installer,
}

impl UpdateReconciler {
    /// Create a reconciler that looks versions up in `registry` and installs through `installer`.
    pub fn new(registry: DynRegistry, installer: Installer) -> Self {
        Self {
            registry,
            installer,
        }
    }

    /// Classify every scanned file, fetching each model's versions once.
    ///
    /// A lookup failure for a model becomes a failure for each of its files;
    /// the rest of the batch continues.
    pub async fn reconcile(&self, models: &[IndexedModel]) -> ReconcileReport {
        let mut lookups: HashMap<u64, VersionLookup> = HashMap::new();
        let mut report = ReconcileReport::default();

        for model in models {
            let Some((model_id, version_id)) = model.identity() else {
                report.entries.push(ReconcileEntry {
                    file: model.file.clone(),
                    classification: Classification::Unidentified,
                });
                continue;
            };

            let lookup = match lookups.entry(model_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.lookup(model_id).await),
            };

            let classification = match lookup {
                VersionLookup::Found(versions) => classify(version_id, versions),
                VersionLookup::Missing => Classification::Orphaned,
                VersionLookup::Failed { kind, message } => {
                    report.failures.push(FileFailure {
                        path: model.file.path.clone(),
                        kind: *kind,
                        message: message.clone(),
                    });
                    continue;
                }
            };
            debug!(
                "{} is {}",
                model.file.path.display(),
                classification.as_str()
            );
            report.entries.push(ReconcileEntry {
                file: model.file.clone(),
                classification,
            });
        }

        info!(
            "Reconciled {} files against {} models: {} updates, {} orphaned, {} failures",
            models.len(),
            lookups.len(),
            report.count("update_available"),
            report.count("orphaned"),
            report.failures.len()
        );
        report
    }

    /// Classify one file, returning the registry error instead of recording
    /// it as a failure.
    pub async fn reconcile_one(&self, model: &IndexedModel) -> Result<ReconcileEntry> {
        let classification = match model.identity() {
            None => Classification::Unidentified,
            Some((model_id, version_id)) => match self.registry.list_versions(model_id).await {
                Ok(versions) => classify(version_id, &versions),
                Err(AimodelError::NotFound { .. }) => Classification::Orphaned,
                Err(e) => return Err(e),
            },
        };
        Ok(ReconcileEntry {
            file: model.file.clone(),
            classification,
        })
    }

    async fn lookup(&self, model_id: u64) -> VersionLookup {
        match self.registry.list_versions(model_id).await {
            Ok(versions) => VersionLookup::Found(versions),
            Err(AimodelError::NotFound { .. }) => VersionLookup::Missing,
            Err(e) => {
                warn!("Failed to list versions of model {}: {}", model_id, e);
                VersionLookup::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn pick_version(&self, entry: &ReconcileEntry, version_id: u64) -> Result<VersionRecord> {
        let Some(model_id) = entry.file.remote_model_id else {
            return Err(AimodelError::Other(format!(
                "{} is not identified",
                entry.file.path.display()
            )));
        };
        self.registry
            .list_versions(model_id)
            .await?
            .into_iter()
            .find(|v| v.version_id == version_id)
            .ok_or_else(|| AimodelError::NotFound {
                what: format!("version {} of model {}", version_id, model_id),
            })
    }

    /// Fetch a version's primary file for `entry`, next to the local file
    /// unless `dest_dir` is given.
    ///
    /// Without `version_id` the entry must be `UpdateAvailable` and its
    /// target is fetched. With one, any file whose model is known may fetch
    /// that version; an id the model does not list is `NotFound`.
    pub async fn download_update(
        &self,
        entry: &ReconcileEntry,
        version_id: Option<u64>,
        dest_dir: Option<&Path>,
    ) -> Result<DownloadOutcome> {
        let target = match (version_id, &entry.classification) {
            (None, Classification::UpdateAvailable(target)) => target.clone(),
            (None, _) => {
                return Err(AimodelError::Other(format!(
                    "No update available for {}",
                    entry.file.path.display()
                )))
            }
            (Some(version_id), _) => self.pick_version(entry, version_id).await?,
        };

        let dest_dir = match dest_dir {
            Some(dir) => dir.to_path_buf(),
            None => entry
                .file
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        let local = Sidecar::load_or_default(&entry.file.path);
        let description = local.extra_str(DESCRIPTION_KEY).map(str::to_string);

        self.installer
            .install(InstallRequest {
                version: &target,
                file_id: None,
                dest_dir,
                model_name: local.model_name,
                model_type: local.model_type,
                description,
            })
            .await
    }
}
