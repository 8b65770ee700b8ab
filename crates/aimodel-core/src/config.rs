//! Centralized configuration.
//!
//! Compile-time constants live on unit structs; user preferences are a
//! [`Settings`] value passed explicitly to every component that needs it.

use crate::metadata::{atomic_read_json, atomic_write_json};
use crate::network::RetryPolicy;
use crate::{AimodelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = "AI-Model-CLI/1.0.0";
    pub const CIVITAI_API_BASE: &'static str = "https://civitai.com/api/v1";
    pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const PREVIEW_WIDTH: u32 = 512;
}

/// Hashing configuration.
pub struct HashConfig;

impl HashConfig {
    /// Read buffer for streaming digests (8MB, optimal for SSDs).
    pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;
}

/// Shared file and directory names.
pub struct PathsConfig;

impl PathsConfig {
    pub const CONFIG_DIR_NAME: &'static str = ".aimodel-cli";
    pub const CONFIG_FILE_NAME: &'static str = "config.json";
    pub const SIDECAR_EXTENSION: &'static str = "json";
    pub const PREVIEW_EXTENSION: &'static str = "preview.png";
}

fn default_true() -> bool {
    true
}

fn default_api_base_url() -> String {
    NetworkConfig::CIVITAI_API_BASE.to_string()
}

fn default_download_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("models")
}

fn default_timeout_secs() -> u64 {
    NetworkConfig::DEFAULT_TIMEOUT_SECS
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_model_extensions() -> Vec<String> {
    ["safetensors", "pt", "pth", "ckpt", "bin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// User preferences, read-only from the core's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_download_path")]
    pub default_download_path: PathBuf,
    #[serde(default)]
    pub disable_ssl: bool,
    #[serde(default)]
    pub proxy: String,
    #[serde(default = "default_timeout_secs", alias = "timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub show_nsfw: bool,
    #[serde(default = "default_true")]
    pub save_metadata: bool,
    #[serde(default = "default_true")]
    pub save_preview: bool,
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default, alias = "metadata_recursive_default")]
    pub recursive_default: bool,
    #[serde(default = "default_true")]
    pub hide_early_access: bool,
    /// Explicit directory per model type; empty values fall back to
    /// `default_download_path` joined with the organizer's folder.
    #[serde(default)]
    pub model_paths: HashMap<String, String>,
    /// Folder-name overrides consulted before the built-in table.
    #[serde(default)]
    pub folder_overrides: HashMap<String, String>,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_model_extensions")]
    pub model_extensions: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: default_api_base_url(),
            default_download_path: default_download_path(),
            disable_ssl: false,
            proxy: String::new(),
            timeout_secs: default_timeout_secs(),
            show_nsfw: false,
            save_metadata: true,
            save_preview: true,
            overwrite_existing: false,
            recursive_default: false,
            hide_early_access: true,
            model_paths: HashMap::new(),
            folder_overrides: HashMap::new(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            model_extensions: default_model_extensions(),
        }
    }
}

impl Settings {
    /// `~/.aimodel-cli`, or `./.aimodel-cli` when no home directory exists.
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(PathsConfig::CONFIG_DIR_NAME)
    }

    /// Load `config.json` from `config_dir`, falling back to defaults when absent.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(PathsConfig::CONFIG_FILE_NAME);
        Ok(atomic_read_json::<Settings>(&path)?.unwrap_or_default())
    }

    /// Persist to `config.json` in `config_dir`.
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        atomic_write_json(&config_dir.join(PathsConfig::CONFIG_FILE_NAME), self)
    }

    /// Per-request deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Retry policy shared by the registry client and the downloader.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.retry_max_attempts.max(1))
            .with_base_delay(Duration::from_millis(self.retry_base_delay_ms))
    }

    /// The API key, or `None` when unset or blank.
    pub fn api_key(&self) -> Option<&str> {
        let key = self.api_key.trim();
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    /// The proxy URL, or `None` when unset or blank.
    pub fn proxy(&self) -> Option<&str> {
        let proxy = self.proxy.trim();
        if proxy.is_empty() {
            None
        } else {
            Some(proxy)
        }
    }

    /// Whether `path` carries one of the allowed model extensions.
    pub fn is_model_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.model_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Reject settings the core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(AimodelError::Config {
                message: "api_base_url must not be empty".to_string(),
            });
        }
        if self.model_extensions.is_empty() {
            return Err(AimodelError::Config {
                message: "model_extensions must list at least one extension".to_string(),
            });
        }
        Ok(())
    }
}
