//! Configuration management for imgdeps

pub mod schema;

pub use schema::{Config, PushPolicy};

use crate::error::{ImgdepsError, ImgdepsResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Environment variable overriding `cache.dir`
pub const ENV_CACHE_DIR: &str = "IMGDEPS_CACHE_DIR";
/// Environment variable overriding `cache.shared_store`
pub const ENV_SHARED_STORE: &str = "IMGDEPS_SHARED_STORE";
/// Environment variable overriding `cache.registry`
pub const ENV_REGISTRY: &str = "IMGDEPS_REGISTRY";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imgdeps")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imgdeps")
    }

    /// Directory for generated Containerfiles
    pub fn builds_dir() -> PathBuf {
        Self::state_dir().join("builds")
    }

    /// Get the build journal path
    pub fn journal_path() -> PathBuf {
        Self::state_dir().join("journal.log")
    }

    /// Default cache directory when `cache.dir` is unset
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imgdeps")
    }

    /// Load configuration, falling back to defaults, then apply env overrides
    pub async fn load(&self) -> ImgdepsResult<Config> {
        let mut config = if self.config_path.exists() {
            self.load_from_file(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };
        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> ImgdepsResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ImgdepsError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| ImgdepsError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> ImgdepsResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            ImgdepsError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> ImgdepsResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ImgdepsError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the state and cache directories exist
    pub async fn ensure_dirs(config: &Config) -> ImgdepsResult<()> {
        let dirs = [
            Self::state_dir(),
            Self::builds_dir(),
            cache_dir(config),
            cache_dir(config).join("checksums"),
        ];

        for dir in &dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                ImgdepsError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved cache directory for a configuration
pub fn cache_dir(config: &Config) -> PathBuf {
    config
        .cache
        .dir
        .clone()
        .unwrap_or_else(ConfigManager::default_cache_dir)
}

/// Environment variables win over the file
fn apply_env_overrides(config: &mut Config) {
    if let Some(dir) = std::env::var_os(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
        debug!("cache.dir overridden by {}", ENV_CACHE_DIR);
        config.cache.dir = Some(PathBuf::from(dir));
    }
    if let Some(store) = std::env::var_os(ENV_SHARED_STORE).filter(|v| !v.is_empty()) {
        debug!("cache.shared_store overridden by {}", ENV_SHARED_STORE);
        config.cache.shared_store = Some(PathBuf::from(store));
    }
    if let Ok(registry) = std::env::var(ENV_REGISTRY) {
        if !registry.is_empty() {
            debug!("cache.registry overridden by {}", ENV_REGISTRY);
            config.cache.registry = Some(registry);
        }
    }
}
