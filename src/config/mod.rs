//! Configuration management for transcache

pub mod schema;

pub use schema::Config;

use crate::error::{TranscacheError, TranscacheResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

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
            .join("transcache")
            .join("config.toml")
    }

    /// Get the default transform cache folder
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("transcache")
    }

    /// Cache folder from config, falling back to the default
    pub fn cache_dir(config: &Config) -> PathBuf {
        config
            .cache
            .dir
            .clone()
            .unwrap_or_else(Self::default_cache_dir)
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> TranscacheResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> TranscacheResult<Config> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            TranscacheError::io(format!("reading config from {}", path.display()), e)
        })?;

        toml::from_str(&content).map_err(|e| TranscacheError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> TranscacheResult<()> {
        let content = toml::to_string_pretty(config)?;
        self.write(&content).await?;
        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Read the raw config text, empty if the file does not exist
    pub async fn read_raw(&self) -> TranscacheResult<String> {
        if !self.config_path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.config_path).await.map_err(|e| {
            TranscacheError::io(format!("reading config from {}", self.config_path.display()), e)
        })
    }

    /// Write raw config text
    pub async fn write(&self, content: &str) -> TranscacheResult<()> {
        self.ensure_config_dir().await?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            TranscacheError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> TranscacheResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TranscacheError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
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
