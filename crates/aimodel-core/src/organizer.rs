//! Where model files live on disk.
//!
//! Maps registry model types to folder names (with caller overrides),
//! cleans remote filenames, and guesses a model type from a local path.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Model types the registry knows about.
pub const KNOWN_MODEL_TYPES: &[&str] = &[
    "Checkpoint",
    "TextualInversion",
    "LORA",
    "LoCon",
    "DoRA",
    "Hypernetwork",
    "AestheticGradient",
    "Controlnet",
    "Poses",
    "VAE",
    "Upscaler",
    "MotionModule",
    "Wildcards",
    "Workflows",
    "Other",
];

/// Built-in folder names; anything else uses the type name verbatim.
const DEFAULT_FOLDERS: &[(&str, &str)] = &[
    ("Checkpoint", "Stable-diffusion"),
    ("LORA", "Lora"),
    ("TextualInversion", "embeddings"),
    ("Upscaler", "ESRGAN"),
    ("Controlnet", "ControlNet"),
];

/// Characters that are invalid in a filename on at least one platform.
const RESERVED_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Maps model types to destination folders.
#[derive(Debug, Clone, Default)]
pub struct PathOrganizer {
    overrides: HashMap<String, String>,
}

impl PathOrganizer {
    /// `overrides` are consulted before the built-in table; blank values are ignored.
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self {
            overrides: overrides
                .into_iter()
                .filter(|(_, folder)| !folder.trim().is_empty())
                .collect(),
        }
    }

    /// Folder name for a model type: override, then built-in table, then the type itself.
    pub fn folder_for(&self, model_type: &str) -> String {
        if let Some(folder) = self.overrides.get(model_type) {
            return folder.trim().to_string();
        }
        DEFAULT_FOLDERS
            .iter()
            .find(|(ty, _)| *ty == model_type)
            .map(|(_, folder)| folder.to_string())
            .unwrap_or_else(|| model_type.to_string())
    }

    /// Directory for `model_type`: an explicit entry in `model_paths`, else
    /// `base` joined with [`folder_for`](Self::folder_for).
    pub fn resolve_dir(
        &self,
        base: &Path,
        model_paths: &HashMap<String, String>,
        model_type: &str,
    ) -> PathBuf {
        match model_paths.get(model_type).map(|p| p.trim()) {
            Some(explicit) if !explicit.is_empty() => PathBuf::from(explicit),
            _ => base.join(self.folder_for(model_type)),
        }
    }
}

/// Whether `model_type` is one of [`KNOWN_MODEL_TYPES`] (case-sensitive).
pub fn is_known_model_type(model_type: &str) -> bool {
    KNOWN_MODEL_TYPES.contains(&model_type)
}

/// Make a remote filename safe to create locally. The extension is kept.
pub fn clean_filename(filename: &str) -> String {
    let (stem, ext) = match filename.rfind('.') {
        Some(idx) if idx > 0 => filename.split_at(idx),
        _ => (filename, ""),
    };

    let stem: String = stem
        .chars()
        .filter(|c| !RESERVED_CHARS.contains(c) && (!c.is_control() || c.is_whitespace()))
        .collect();
    let stem = WHITESPACE.replace_all(stem.trim(), " ");
    let ext: String = ext
        .chars()
        .filter(|c| !RESERVED_CHARS.contains(c) && !c.is_control() && !c.is_whitespace())
        .collect();

    let cleaned = format!("{}{}", stem, ext);
    if stem.is_empty() || cleaned.chars().all(|c| c == '.') {
        // Nothing usable, or a name (`.`, `..`) that would escape the directory.
        let ext = if ext.chars().all(|c| c == '.') { "" } else { ext.as_str() };
        format!("model{}", ext)
    } else {
        cleaned
    }
}

/// Guess a registry model type from path components, then extension and size.
pub fn infer_model_type(path: &Path, size: u64) -> &'static str {
    for component in path.components().rev() {
        let part = component.as_os_str().to_string_lossy().to_lowercase();
        let found = if part.contains("checkpoint") || part.contains("ckpt") {
            Some("Checkpoint")
        } else if part.contains("lora") {
            Some("LORA")
        } else if part.contains("locon") || part.contains("lycoris") {
            Some("LoCon")
        } else if part.contains("dora") {
            Some("DoRA")
        } else if part.contains("embedding") || part.contains("textual") {
            Some("TextualInversion")
        } else if part.contains("controlnet") {
            Some("Controlnet")
        } else if part.contains("vae") {
            Some("VAE")
        } else if part.contains("upscaler") || part.contains("esrgan") {
            Some("Upscaler")
        } else {
            None
        };
        if let Some(model_type) = found {
            return model_type;
        }
    }

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "ckpt" | "safetensors" if size > 1024 * 1024 * 1024 => "Checkpoint",
        "pt" | "safetensors" => "LORA",
        _ => "Other",
    }
}
