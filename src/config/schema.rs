//! Configuration schema for transcache
//!
//! Configuration is stored at `~/.config/transcache/config.toml`

use crate::cache::CacheOptions;
use crate::rewriter::ConfigDecoration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Transform cache settings
    pub cache: CacheConfig,

    /// Rewriting settings
    pub transform: TransformConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Transform cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache folder (default: `<cache dir>/transcache`)
    pub dir: Option<PathBuf>,

    /// Log every differing key when the cache is invalidated
    pub log_changed_keys: bool,

    /// Read the archive once on a hit to warm the page cache
    pub preload: bool,

    /// Rebuild on every run
    pub development: bool,

    /// Id of the unit that carries transcache itself
    pub bootstrap_unit: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            log_changed_keys: false,
            preload: true,
            development: false,
            bootstrap_unit: "transcache".to_string(),
        }
    }
}

/// Rewriting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Feature flags that take part in the cache key
    pub flags: BTreeMap<String, bool>,

    /// Attach unit id and compatibility to rewriter configs
    pub decorate_configs: bool,

    /// Rewriter command line; empty keeps artifacts unchanged
    pub rewriter: Vec<String>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            flags: BTreeMap::new(),
            decorate_configs: true,
            rewriter: Vec::new(),
        }
    }
}

impl Config {
    /// Cache options for the library, with CLI overrides applied by the caller
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            log_changed_keys: self.cache.log_changed_keys,
            preload: self.cache.preload,
            development: self.cache.development,
            bootstrap_unit: self.cache.bootstrap_unit.clone(),
            decoration: if self.transform.decorate_configs {
                ConfigDecoration::Decorated
            } else {
                ConfigDecoration::Undecorated
            },
        }
    }
}
