//! aimodel core - headless library for managing local registry model files.
//!
//! Identifies files by content hash, reconciles them against the registry's
//! version history, and fetches new versions with resumable transfers. It
//! can be used programmatically without the command line.
//!
//! # Example
//!
//! ```rust,ignore
//! use aimodel_core::{ModelManager, ScanOptions, Settings};
//!
//! #[tokio::main]
//! async fn main() -> aimodel_core::Result<()> {
//!     let settings = Settings::load(&Settings::default_config_dir())?;
//!     let manager = ModelManager::builder(settings).build()?;
//!
//!     let report = manager
//!         .check_updates("/models/Lora".as_ref(), ScanOptions::default())
//!         .await;
//!     for entry in report.updates() {
//!         manager.download_update(entry, None, None).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod download;
pub mod error;
pub mod hashing;
pub mod install;
pub mod library;
pub mod manager;
pub mod metadata;
pub mod network;
pub mod organizer;
pub mod reconcile;
pub mod registry;

pub use cancel::CancellationToken;
pub use config::Settings;
pub use download::{
    DownloadObserver, DownloadOutcome, DownloadProgress, DownloadState, DownloadTask,
    ResumableDownloader,
};
pub use error::{AimodelError, FailureKind, FileFailure, IntegrityMismatch, Result};
pub use hashing::{ContentHasher, HashOutcome};
pub use library::{
    CompletionOptions, CompletionStatus, Identification, IndexedModel, LocalModelIndex,
    ModelFile, ScanItem, ScanOptions, ScanReport, Sidecar, UnidentifiedReason,
};
pub use manager::{FileUpdate, LocalInfo, ModelManager, ModelManagerBuilder};
pub use network::RetryPolicy;
pub use organizer::PathOrganizer;
pub use reconcile::{classify, Classification, ReconcileEntry, ReconcileReport, UpdateReconciler};
pub use registry::{
    parse_model_url, CivitaiClient, DynRegistry, HashMatch, ModelRegistry, RemoteModel,
    ResolvedDownload, VersionRecord,
};
