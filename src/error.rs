//! Error types for imgdeps
//!
//! All modules use `ImgdepsResult<T>` as their return type.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for imgdeps operations
pub type ImgdepsResult<T> = Result<T, ImgdepsError>;

/// How a layer build failed, as reported by the builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildFailureKind {
    /// Network hiccups, mirror outages and the like. Worth retrying.
    Transient,
    /// The instructions themselves failed. Retrying will not help.
    Permanent,
    /// The build exceeded the per-layer timeout
    Timeout,
}

impl fmt::Display for BuildFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// All errors that can occur in imgdeps
#[derive(Error, Debug)]
pub enum ImgdepsError {
    // Declaration errors
    #[error("Invalid build declaration: {0}")]
    ConfigValidation(String),

    #[error("Declaration file not found: {0}")]
    DeclarationNotFound(PathBuf),

    // Engine settings errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Build errors
    #[error("Layer {layer} failed ({kind}) after {attempts} attempt(s): {message}")]
    LayerBuild {
        layer: String,
        kind: BuildFailureKind,
        attempts: u32,
        message: String,
    },

    #[error("Container engine not available: {0}")]
    EngineUnavailable(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    // Cache errors
    #[error("Failed to promote {key} from {tier}: {reason}")]
    CachePromotion {
        key: String,
        tier: String,
        reason: String,
    },

    #[error("Cache index at {path} is corrupt: {reason}")]
    CacheCorruption { path: PathBuf, reason: String },

    #[error("Cache is locked by pid {pid} since {since}")]
    CacheLocked { pid: u32, since: String },

    #[error("Stale cache lock at {path} (pid {pid}, {age_secs}s old)")]
    StaleLock {
        path: PathBuf,
        pid: u32,
        age_secs: i64,
    },

    #[error("No tracked chain for {0}")]
    ChainNotFound(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ImgdepsError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a declaration validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ConfigValidation(reason.into())
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LayerBuild {
                kind: BuildFailureKind::Transient | BuildFailureKind::Timeout,
                ..
            } | Self::CachePromotion { .. }
                | Self::CacheLocked { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::StaleLock { .. } => {
                Some("No live process holds the lock. Re-run with --break-lock to remove it")
            }
            Self::CacheLocked { .. } => Some(
                "Another imgdeps build is running. If it was killed, re-run with --break-lock",
            ),
            Self::EngineUnavailable(_) => {
                Some("Install podman or docker, or set engine.binary in config.toml")
            }
            Self::DeclarationNotFound(_) => Some("Run: imgdeps init"),
            Self::ChainNotFound(_) => Some("Run: imgdeps layers  (lists tracked tags)"),
            Self::LayerBuild {
                kind: BuildFailureKind::Timeout,
                ..
            } => Some("Raise build.layer_timeout_secs in config.toml"),
            _ if self.is_retryable() => {
                Some("The failure looks temporary; re-running the build may succeed")
            }
            _ => None,
        }
    }
}
