//! aimodel - manage local registry model files from the command line.
//!
//! A thin wrapper over `aimodel-core`: every command builds a
//! [`ModelManager`] from the stored settings and prints what it returns.

mod progress;

use aimodel_core::library::{
    clean_description, ACTIVATION_TEXT_KEY, DESCRIPTION_KEY, SD_VERSION_KEY,
};
use aimodel_core::organizer::{is_known_model_type, KNOWN_MODEL_TYPES};
use aimodel_core::{
    parse_model_url, Classification, CompletionOptions, CompletionStatus, DownloadOutcome,
    FileFailure, ModelManager, ScanItem, ScanOptions, Settings,
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use progress::{display_name, LogObserver};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aimodel")]
#[command(about = "Identify, update and download registry models")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Directory holding config.json (defaults to ~/.aimodel-cli)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the SHA-256 of a file
    Hash { file: PathBuf },

    /// Identify files and fill in missing metadata and previews
    Identify {
        path: PathBuf,
        #[command(flatten)]
        walk: WalkArgs,
        /// Rewrite metadata that is already present
        #[arg(short, long)]
        force: bool,
    },

    /// Manage sidecar metadata and previews
    #[command(subcommand)]
    Metadata(MetadataCommand),

    /// Compare local files with the registry
    #[command(subcommand)]
    Update(UpdateCommand),

    /// Download a model by id
    Download {
        model_id: u64,
        #[arg(long)]
        version: Option<u64>,
        #[arg(long)]
        file: Option<u64>,
        /// Target directory (defaults to the folder for the model's type)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Download the model a registry page URL points to
    DownloadUrl {
        url: String,
        /// Target directory (defaults to the folder for the model's type)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Show a registry model (id or page URL), or a local file with --local
    Info {
        target: String,
        #[arg(long)]
        local: bool,
    },
}

#[derive(Subcommand, Debug)]
enum MetadataCommand {
    /// Identify files and write whatever metadata or preview is missing
    Complete {
        /// File or directory to complete
        path: Option<PathBuf>,
        /// Complete the configured folder for this model type instead of a path
        #[arg(short = 't', long, conflicts_with = "path")]
        model_type: Option<String>,
        #[command(flatten)]
        walk: WalkArgs,
        /// Rewrite metadata and previews that are already present
        #[arg(short, long)]
        force: bool,
        /// Skip previews
        #[arg(long, conflicts_with = "preview_only")]
        metadata_only: bool,
        /// Skip metadata
        #[arg(long)]
        preview_only: bool,
    },
}

#[derive(Subcommand, Debug)]
enum UpdateCommand {
    /// Report which files have newer versions
    Check {
        /// File or directory to check
        path: Option<PathBuf>,
        /// Check the configured folder for this model type instead of a path
        #[arg(short = 't', long, conflicts_with = "path")]
        model_type: Option<String>,
        #[command(flatten)]
        walk: WalkArgs,
        /// Download every available update
        #[arg(long)]
        download: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download the newest version of a model file next to it
    Download {
        file: PathBuf,
        /// Fetch this version id instead of the newest
        #[arg(long)]
        version: Option<u64>,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct WalkArgs {
    /// Descend into subdirectories
    #[arg(short, long)]
    recursive: bool,
    /// Ask the registry again even when an identity is cached
    #[arg(long)]
    refresh: bool,
}

impl WalkArgs {
    fn options(self, settings: &Settings) -> ScanOptions {
        ScanOptions {
            recursive: self.recursive || settings.recursive_default,
            refresh: self.refresh,
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns `Ok(false)` when the command finished but some files failed.
async fn run(cli: Cli) -> Result<bool> {
    let config_dir = cli.config_dir.unwrap_or_else(Settings::default_config_dir);
    let settings = Settings::load(&config_dir)
        .with_context(|| format!("loading settings from {}", config_dir.display()))?;

    let manager = ModelManager::builder(settings)
        .with_observer(Arc::new(LogObserver))
        .build()?;

    let cancel = manager.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current chunk");
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Hash { file } => {
            let outcome = manager.hash_file(&file).await?;
            println!("{}  {}", outcome.digest, file.display());
            Ok(true)
        }
        Command::Identify { path, walk, force } => {
            let options = CompletionOptions {
                force,
                ..CompletionOptions::default()
            };
            complete(&manager, &path, walk, options).await
        }
        Command::Metadata(MetadataCommand::Complete {
            path,
            model_type,
            walk,
            force,
            metadata_only,
            preview_only,
        }) => {
            let root = check_root(&manager, path, model_type)?;
            let options = completion_options(force, metadata_only, preview_only);
            complete(&manager, &root, walk, options).await
        }
        Command::Update(UpdateCommand::Check {
            path,
            model_type,
            walk,
            download,
            json,
        }) => {
            let root = check_root(&manager, path, model_type)?;
            check_updates(&manager, &root, walk, download, json).await
        }
        Command::Update(UpdateCommand::Download { file, version }) => {
            let update = manager.update_file(&file, version).await?;
            match (&update.download, &update.entry.classification) {
                (Some(outcome), _) => Ok(report_download(outcome)),
                (None, Classification::UpToDate) => {
                    println!("up to date {}", file.display());
                    Ok(true)
                }
                (None, other) => {
                    warn!("{} is {}, nothing to update", file.display(), other.as_str());
                    Ok(false)
                }
            }
        }
        Command::Download {
            model_id,
            version,
            file,
            dir,
        } => {
            let outcome = manager
                .download_model(model_id, version, file, dir.as_deref())
                .await?;
            Ok(report_download(&outcome))
        }
        Command::DownloadUrl { url, dir } => {
            let Some((model_id, version)) = parse_model_url(&url) else {
                bail!("not a model page URL: {} (expected .../models/<id>)", url);
            };
            let outcome = manager
                .download_model(model_id, version, None, dir.as_deref())
                .await?;
            Ok(report_download(&outcome))
        }
        Command::Info { target, local } => {
            if local {
                local_info(&manager, Path::new(&target)).await
            } else {
                remote_info(&manager, &target).await
            }
        }
    }
}

fn completion_options(force: bool, metadata_only: bool, preview_only: bool) -> CompletionOptions {
    CompletionOptions {
        force,
        metadata: !preview_only,
        preview: !metadata_only,
    }
}

/// A bare model id or a registry page URL.
fn model_id_of(target: &str) -> Result<u64> {
    if let Ok(id) = target.parse() {
        return Ok(id);
    }
    match parse_model_url(target) {
        Some((id, _)) => Ok(id),
        None => bail!(
            "expected a model id or a model page URL, got '{}'; use --local for files",
            target
        ),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn check_root(
    manager: &ModelManager,
    path: Option<PathBuf>,
    model_type: Option<String>,
) -> Result<PathBuf> {
    match (path, model_type) {
        (Some(path), _) => Ok(path),
        (None, Some(model_type)) => {
            if !is_known_model_type(&model_type) {
                bail!(
                    "unknown model type '{}'; expected one of: {}",
                    model_type,
                    KNOWN_MODEL_TYPES.join(", ")
                );
            }
            Ok(manager.model_dir(&model_type))
        }
        (None, None) => bail!("give a path or --model-type"),
    }
}

async fn complete(
    manager: &ModelManager,
    root: &Path,
    walk: WalkArgs,
    options: CompletionOptions,
) -> Result<bool> {
    let mut failures: Vec<FileFailure> = Vec::new();
    let (mut identified, mut unidentified) = (0usize, 0usize);

    let mut items = manager.scan(root, walk.options(manager.settings()));
    while let Some(item) = items.next().await {
        if manager.cancel_token().is_cancelled() {
            break;
        }
        let model = match item {
            ScanItem::Indexed(model) => model,
            ScanItem::Failed(failure) => {
                failures.push(failure);
                continue;
            }
        };

        match manager.complete_metadata(&model, options).await {
            Ok(CompletionStatus::Unidentified) => {
                unidentified += 1;
                println!("?  {}", model.file.path.display());
            }
            Ok(status) => {
                identified += 1;
                let (model_id, version_id) = model.identity().unwrap_or_default();
                let note = match status {
                    CompletionStatus::Completed {
                        metadata_written,
                        preview_written,
                    } => format!(
                        "{}{}",
                        if metadata_written { " +metadata" } else { "" },
                        if preview_written { " +preview" } else { "" }
                    ),
                    _ => String::new(),
                };
                println!(
                    "ok {} (model {}, version {}){}",
                    model.file.path.display(),
                    model_id,
                    version_id,
                    note
                );
            }
            Err(e) => failures.push(FileFailure::new(&model.file.path, &e)),
        }
    }

    info!(
        "{} identified, {} unidentified, {} failed",
        identified,
        unidentified,
        failures.len()
    );
    print_failures(&failures);
    Ok(failures.is_empty())
}

async fn local_info(manager: &ModelManager, path: &Path) -> Result<bool> {
    let info = manager.local_info(path).await?;
    println!("File: {}", display_name(path));
    println!("Path: {}", info.path.display());
    println!("Type: {}", info.model_type);

    let Some(sidecar) = info.sidecar else {
        println!("No metadata found; run `aimodel identify` to fetch it");
        return Ok(true);
    };
    if let Some(sha256) = &sidecar.sha256 {
        println!("SHA256: {}", sha256);
    }
    if let Some((model_id, version_id)) = sidecar.identity() {
        println!("Model: {} (version {})", model_id, version_id);
    }
    if let Some(name) = &sidecar.model_name {
        println!("Name: {}", name);
    }
    if let Some(text) = sidecar.extra_str(ACTIVATION_TEXT_KEY) {
        println!("Activation text: {}", text);
    }
    if let Some(base) = sidecar.extra_str(SD_VERSION_KEY) {
        println!("Base model: {}", base);
    }
    if let Some(description) = sidecar.extra_str(DESCRIPTION_KEY) {
        println!("Description: {}", truncate(description, 200));
    }
    Ok(true)
}

async fn remote_info(manager: &ModelManager, target: &str) -> Result<bool> {
    let model = manager.model_info(model_id_of(target)?).await?;
    println!("{} ({})", model.name, model.model_id);
    println!("Type: {}{}", model.model_type, if model.nsfw { ", NSFW" } else { "" });
    if let Some(description) = &model.description {
        let description = clean_description(description);
        if !description.is_empty() {
            println!("Description: {}", truncate(&description, 200));
        }
    }

    let latest = model.latest_version().map(|v| v.version_id);
    println!("Versions:");
    for version in model.versions.iter().rev() {
        let mut notes = Vec::new();
        if let Some(base) = &version.base_model {
            notes.push(base.clone());
        }
        if Some(version.version_id) == latest {
            notes.push("latest".to_string());
        }
        if version.retracted {
            notes.push("retracted".to_string());
        }
        println!(
            "  {:<10} {:<24} {} {}",
            version.version_id,
            version.name,
            version.published_at.format("%Y-%m-%d"),
            notes.join(", ")
        );
    }
    Ok(true)
}

async fn check_updates(
    manager: &ModelManager,
    root: &Path,
    walk: WalkArgs,
    download: bool,
    json: bool,
) -> Result<bool> {
    let report = manager
        .check_updates(root, walk.options(manager.settings()))
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for entry in &report.entries {
            match &entry.classification {
                Classification::UpdateAvailable(target) => println!(
                    "update    {} -> {} ({})",
                    entry.file.path.display(),
                    target.name,
                    target.version_id
                ),
                other => println!("{:<9} {}", other.as_str(), entry.file.path.display()),
            }
        }
        info!(
            "{} up to date, {} with updates, {} orphaned, {} unidentified",
            report.count("up_to_date"),
            report.count("update_available"),
            report.count("orphaned"),
            report.count("unidentified")
        );
    }

    let mut failures = report.failures.clone();
    if download {
        for entry in report.updates() {
            if manager.cancel_token().is_cancelled() {
                break;
            }
            match manager.download_update(entry, None, None).await {
                Ok(outcome) => {
                    report_download(&outcome);
                }
                Err(e) => failures.push(FileFailure::new(&entry.file.path, &e)),
            }
        }
    }

    print_failures(&failures);
    Ok(failures.is_empty())
}

fn report_download(outcome: &DownloadOutcome) -> bool {
    match outcome {
        DownloadOutcome::Completed { path, bytes, .. } => {
            println!("saved {} ({} bytes)", path.display(), bytes);
            true
        }
        DownloadOutcome::Cancelled {
            partial_path,
            bytes_on_disk,
        } => {
            warn!(
                "Cancelled with {} bytes kept in {}; run again to resume",
                bytes_on_disk,
                partial_path.display()
            );
            false
        }
    }
}

fn print_failures(failures: &[FileFailure]) {
    for failure in failures {
        eprintln!("failed {}", failure);
    }
}
