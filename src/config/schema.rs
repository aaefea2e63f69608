//! Engine settings schema
//!
//! Settings are stored at `~/.config/imgdeps/config.toml`. These control
//! how imgdeps runs (engine binary, cache location, retry policy); what
//! gets built lives in the per-image declaration file instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Container engine settings
    pub engine: EngineConfig,

    /// Layer cache settings
    pub cache: CacheConfig,

    /// Per-layer build policy
    pub build: BuildConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Append build events to the journal
    pub journal: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            journal: true,
        }
    }
}

/// Container engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine CLI binary: "podman" or "docker"
    pub binary: String,

    /// Keep generated build directories for debugging
    pub preserve_build_dirs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            preserve_build_dirs: false,
        }
    }
}

/// When built layers are pushed to the shared store and registry tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushPolicy {
    /// Push every built layer, even when the build later fails
    Always,
    /// Push only after the whole chain built successfully
    #[default]
    OnSuccess,
    /// Never push automatically; use `imgdeps push`
    Manual,
}

impl fmt::Display for PushPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::OnSuccess => write!(f, "on_success"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Layer cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (index, checksums, lock). Defaults to the user cache dir.
    pub dir: Option<PathBuf>,

    /// Age in seconds after which a lock without a live owner is stale
    pub lock_stale_secs: u64,

    /// Extra keys dropped before hashing, on top of the built-in list
    pub ignore_keys: Vec<String>,

    /// Shared directory of image archives (NFS mount, synced bucket, ...)
    pub shared_store: Option<PathBuf>,

    /// Registry repository for layer images, e.g. "ghcr.io/acme/layers"
    pub registry: Option<String>,

    /// Push policy for the non-local tiers
    pub push: PushPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            lock_stale_secs: 3600,
            ignore_keys: vec![],
            shared_store: None,
            registry: None,
            push: PushPolicy::OnSuccess,
        }
    }
}

/// Per-layer build policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Retries after a transient failure (total attempts = retries + 1)
    pub retries: u32,

    /// Initial backoff between attempts, doubled each retry
    pub backoff_ms: u64,

    /// Timeout for a single layer build
    pub layer_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_ms: 500,
            layer_timeout_secs: 1800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[cache]"));
        assert!(toml.contains("push = \"on_success\""));
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml = r#"
            [cache]
            push = "manual"
            ignore_keys = ["BUILD_DATE"]

            [build]
            retries = 5
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.push, PushPolicy::Manual);
        assert_eq!(config.cache.ignore_keys, vec!["BUILD_DATE"]);
        assert_eq!(config.cache.lock_stale_secs, 3600);
        assert_eq!(config.build.retries, 5);
        assert_eq!(config.build.backoff_ms, 500);
        assert_eq!(config.engine.binary, "podman");
        assert!(config.general.journal);
    }

    #[test]
    fn unknown_push_policy_is_rejected() {
        let toml = r#"
            [cache]
            push = "sometimes"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }
}
