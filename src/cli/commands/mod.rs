//! CLI command implementations

pub mod build;
pub mod check;
pub mod clear;
pub mod config;
pub mod keys;
pub mod show;

pub use build::execute as build;
pub use check::execute as check;
pub use clear::execute as clear;
pub use config::execute as config;
pub use keys::execute as keys;
pub use show::execute as show;

use crate::cache::TransformCache;
use crate::cli::args::{CacheDirArgs, InputArgs};
use crate::config::{Config, ConfigManager};
use crate::error::TranscacheResult;
use crate::unit::{BuildInputs, UnitManifest};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manifest contents plus the effective feature flags
pub(crate) struct LoadedInputs {
    pub inputs: BuildInputs,
    pub flags: BTreeMap<String, bool>,
}

/// Read the unit manifest and merge configured flags with `--flag` overrides
pub(crate) async fn load_inputs(args: &InputArgs, config: &Config) -> TranscacheResult<LoadedInputs> {
    let manifest = UnitManifest::from_file(&args.units).await?;
    let base = args
        .units
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let inputs = manifest.into_inputs(base)?;

    let mut flags = config.transform.flags.clone();
    for (name, value) in &args.flags {
        flags.insert(name.clone(), *value);
    }

    debug!(
        "Loaded {} units and {} flags from {}",
        inputs.units.len(),
        flags.len(),
        args.units.display()
    );
    Ok(LoadedInputs { inputs, flags })
}

/// Cache folder from `--cache-dir` or config
pub(crate) fn cache_dir(args: &CacheDirArgs, config: &Config) -> PathBuf {
    args.cache_dir
        .clone()
        .unwrap_or_else(|| ConfigManager::cache_dir(config))
}

pub(crate) fn open_cache(args: &CacheDirArgs, config: &Config) -> TransformCache {
    TransformCache::new(cache_dir(args, config), config.cache_options())
}
