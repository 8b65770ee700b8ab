//! Error types for the model library core.
//!
//! Every failure carries a stable [`FailureKind`] so callers can script
//! against it, and batch operations report per-file problems as
//! [`FileFailure`] values instead of aborting.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Stable failure classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// File could not be read or vanished while hashing.
    Hash,
    /// Registry unreachable or returned something unusable.
    Identify,
    /// Size or digest mismatch after a transfer.
    Integrity,
    /// A deadline was exceeded.
    Timeout,
    /// Transport-level failure or a transient HTTP status.
    Network,
    /// A second writer targeted an already-active destination.
    Conflict,
    /// Non-transient HTTP status.
    Http,
    /// Remote object does not exist.
    NotFound,
    /// Registry demands an API key.
    AuthRequired,
    /// Local filesystem error.
    Io,
    /// Malformed JSON.
    Json,
    /// Invalid configuration or arguments.
    Config,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Stable snake_case name, safe to match on in scripts.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Hash => "hash_failure",
            FailureKind::Identify => "identify_failure",
            FailureKind::Integrity => "integrity_failure",
            FailureKind::Timeout => "timeout_failure",
            FailureKind::Network => "network_failure",
            FailureKind::Conflict => "conflict_failure",
            FailureKind::Http => "http_error",
            FailureKind::NotFound => "not_found",
            FailureKind::AuthRequired => "auth_required",
            FailureKind::Io => "io_error",
            FailureKind::Json => "json_error",
            FailureKind::Config => "config_error",
            FailureKind::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What did not match after a transfer completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityMismatch {
    Size { expected: u64, actual: u64 },
    Hash { expected: String, actual: String },
}

impl std::fmt::Display for IntegrityMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityMismatch::Size { expected, actual } => {
                write!(f, "expected {} bytes, got {}", expected, actual)
            }
            IntegrityMismatch::Hash { expected, actual } => {
                write!(f, "expected sha256 {}, got {}", expected, actual)
            }
        }
    }
}

/// Main error type for the model library core.
#[derive(Debug, Error)]
pub enum AimodelError {
    #[error("Failed to hash {path}: {message}")]
    HashFailure {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Failed to identify {digest}: {message}")]
    IdentifyFailure { digest: String, message: String },

    #[error("Integrity check failed for {path}: {mismatch}")]
    IntegrityFailure {
        path: PathBuf,
        mismatch: IntegrityMismatch,
    },

    #[error("{operation} timed out after {timeout:?}")]
    TimeoutFailure { operation: String, timeout: Duration },

    #[error("Network error: {message}")]
    NetworkFailure {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("A download is already active for {0}")]
    ConflictFailure(PathBuf),

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Authentication required for {url}; set an API key")]
    AuthRequired { url: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, AimodelError>;

impl From<std::io::Error> for AimodelError {
    fn from(err: std::io::Error) -> Self {
        AimodelError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for AimodelError {
    fn from(err: serde_json::Error) -> Self {
        AimodelError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl AimodelError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        AimodelError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Map a transport error. `timeout` is the deadline the request ran
    /// under, reported when reqwest gives up on it.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            AimodelError::TimeoutFailure {
                operation: err
                    .url()
                    .map(|u| format!("request to {}", u))
                    .unwrap_or_else(|| "request".to_string()),
                timeout,
            }
        } else {
            AimodelError::NetworkFailure {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }

    /// Create a hash failure for `path`.
    pub fn hash_failure(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        AimodelError::HashFailure {
            path: path.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Stable classification of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            AimodelError::HashFailure { .. } => FailureKind::Hash,
            AimodelError::IdentifyFailure { .. } => FailureKind::Identify,
            AimodelError::IntegrityFailure { .. } => FailureKind::Integrity,
            AimodelError::TimeoutFailure { .. } => FailureKind::Timeout,
            AimodelError::NetworkFailure { .. } => FailureKind::Network,
            AimodelError::ConflictFailure(_) => FailureKind::Conflict,
            AimodelError::Http { status, .. } if is_transient_status(*status) => {
                FailureKind::Network
            }
            AimodelError::Http { .. } => FailureKind::Http,
            AimodelError::NotFound { .. } => FailureKind::NotFound,
            AimodelError::AuthRequired { .. } => FailureKind::AuthRequired,
            AimodelError::Io { .. } => FailureKind::Io,
            AimodelError::Json { .. } => FailureKind::Json,
            AimodelError::Config { .. } => FailureKind::Config,
            AimodelError::Other(_) => FailureKind::Other,
        }
    }

    /// Check if this error should trigger a retry under the default policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Network | FailureKind::Timeout)
    }
}

/// Statuses worth retrying: rate limiting and server-side trouble.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// A per-file failure collected during a batch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

impl FileFailure {
    /// Record `err` against `path`.
    pub fn new(path: impl Into<PathBuf>, err: &AimodelError) -> Self {
        Self {
            path: path.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for FileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.path.display(), self.kind, self.message)
    }
}
