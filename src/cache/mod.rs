//! Persistent transformation cache
//!
//! Rewritten artifacts are stored in one packed archive per cache folder,
//! keyed by a fingerprint of every input that can affect the output.
//!
//! # Build flow
//!
//! | Step | Component | Outcome |
//! |------|-----------|---------|
//! | 1 | [`CacheKeyBuilder`] | key set for the current inputs |
//! | 2 | [`CacheValidator`] | `Valid` ends the build: preload and reopen |
//! | 3 | [`ArchiveStore::erase`] | stale folder contents removed |
//! | 4 | [`Populator`] | eligible artifacts copied into staging |
//! | 5 | [`TransformPipeline`] | scan, then rewrite and widen |
//! | 6 | [`ArchiveStore::finalize`] | archive packed, marked complete, renamed |
//!
//! A build interrupted anywhere before step 6 completes leaves no archive
//! that [`ArchiveStore::open`] accepts, so the next run rebuilds.

pub mod archive;
pub mod classfile;
pub mod key;
pub mod pipeline;
pub mod populate;
pub mod validator;
pub mod visibility;

pub use archive::{ArchiveFs, ArchiveStore, StagingRoot};
pub use key::{CacheKeyBuilder, CacheKeySet, KeyDiff};
pub use pipeline::{BuildObserver, BuildPhase, PipelineStats, TransformPipeline};
pub use populate::{ArtifactEntry, ArtifactIndex, Populator, ResourceRoots};
pub use validator::{CacheValidator, InvalidReason, Validity};
pub use visibility::WideningPatch;

use crate::error::{TranscacheError, TranscacheResult};
use crate::rewriter::{ConfigDecoration, Rewriter, RewriterSetup};
use crate::unit::{DependencyRecord, LoadUnit};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Behaviour switches of a [`TransformCache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// List every differing key when the cache is invalidated
    pub log_changed_keys: bool,
    /// Warm the page cache with the archive on a hit
    pub preload: bool,
    /// Rebuild on every run
    pub development: bool,
    /// Id of the cache's own unit, never copied
    pub bootstrap_unit: String,
    /// Whether rewriter configs carry unit decorations
    pub decoration: ConfigDecoration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            log_changed_keys: false,
            preload: true,
            development: false,
            bootstrap_unit: "transcache".to_string(),
            decoration: ConfigDecoration::Decorated,
        }
    }
}

/// Counters of a build; all zero on a cache hit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub units: usize,
    pub copied_files: usize,
    pub copied_bytes: u64,
    pub pipeline: PipelineStats,
}

/// What [`TransformCache::populate_transform_bundle`] hands back
#[derive(Debug)]
pub struct TransformCacheResult {
    /// The cache folder
    pub folder: PathBuf,
    /// `false` if an existing archive was reused
    pub newly_generated: bool,
    /// Why the previous archive was not reused, on a rebuild
    pub invalidated: Option<InvalidReason>,
    /// Read-only view of the finalized archive
    pub archive: ArchiveFs,
    pub stats: BuildStats,
}

/// Inputs of one build
#[derive(Debug, Clone, Copy)]
pub struct BundleInputs<'a> {
    pub units: &'a [LoadUnit],
    pub solved: &'a DependencyRecord,
    pub flags: &'a BTreeMap<String, bool>,
    pub unassociated: &'a [PathBuf],
}

/// Transform cache over one folder
#[derive(Debug, Clone)]
pub struct TransformCache {
    store: ArchiveStore,
    options: CacheOptions,
}

impl TransformCache {
    pub fn new(folder: impl Into<PathBuf>, options: CacheOptions) -> Self {
        Self {
            store: ArchiveStore::new(folder),
            options,
        }
    }

    pub fn folder(&self) -> &Path {
        self.store.dir()
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    /// Derive the key set for the given inputs
    pub fn keys(&self, inputs: &BundleInputs<'_>) -> TranscacheResult<CacheKeySet> {
        CacheKeyBuilder::build(inputs.units, inputs.solved, inputs.flags)
    }

    /// Check the current archive against the given inputs without building
    pub fn check(&self, inputs: &BundleInputs<'_>) -> TranscacheResult<Validity> {
        let keys = self.keys(inputs)?;
        Ok(self.validator().check(&self.store, &keys))
    }

    fn validator(&self) -> CacheValidator {
        CacheValidator::new(self.options.log_changed_keys, self.options.development)
    }

    /// Reuse the archive if it matches the inputs, otherwise rebuild it
    ///
    /// Key derivation happens before the folder is touched, so a hashing
    /// failure leaves any existing archive in place.
    pub fn populate_transform_bundle(
        &self,
        inputs: &BundleInputs<'_>,
        rewriter: &mut dyn Rewriter,
        observer: &mut dyn BuildObserver,
    ) -> TranscacheResult<TransformCacheResult> {
        let keys = self.keys(inputs)?;

        let folder = self.store.dir().to_path_buf();
        fs::create_dir_all(&folder).map_err(|e| {
            TranscacheError::io(format!("creating transform cache folder {}", folder.display()), e)
        })?;

        let validity = self.validator().check(&self.store, &keys);
        if validity.is_valid() {
            if self.options.preload {
                self.store.preload();
            }
            match self.store.try_open() {
                Ok(archive) => {
                    info!("Reusing transform cache at {}", folder.display());
                    return Ok(TransformCacheResult {
                        folder,
                        newly_generated: false,
                        invalidated: None,
                        archive,
                        stats: BuildStats::default(),
                    });
                }
                // Changed between the check and the reopen; rebuild below.
                Err(e) => info!("Transform cache became unreadable, rebuilding: {}", e),
            }
        }

        self.store.erase(validity.cause())?;
        let (archive, stats) = self.rebuild(inputs, &keys, rewriter, observer)?;

        Ok(TransformCacheResult {
            folder,
            newly_generated: true,
            invalidated: match validity {
                Validity::Invalid(reason) => Some(reason),
                Validity::Valid => None,
            },
            archive,
            stats,
        })
    }

    fn rebuild(
        &self,
        inputs: &BundleInputs<'_>,
        keys: &CacheKeySet,
        rewriter: &mut dyn Rewriter,
        observer: &mut dyn BuildObserver,
    ) -> TranscacheResult<(ArchiveFs, BuildStats)> {
        let root = self.store.stage()?;
        let populator = Populator::new(&self.options.bootstrap_unit);
        let outcome = populator.populate(&root, inputs.units, inputs.unassociated, observer)?;

        let eligible: Vec<LoadUnit> = inputs
            .units
            .iter()
            .filter(|u| populator.is_eligible(u))
            .cloned()
            .collect();
        let setup = RewriterSetup::from_units(&eligible, self.options.decoration)?;
        rewriter.prepare(&setup)?;

        let pipeline = TransformPipeline::new(rewriter).run(
            &root,
            &outcome.index,
            &outcome.resources,
            observer,
        )?;

        let stats = BuildStats {
            units: outcome.units.len(),
            copied_files: outcome.copied_files,
            copied_bytes: outcome.copied_bytes,
            pipeline,
        };
        // The resource roots point into staging; they end with this build.
        drop(outcome);

        let archive = self.store.finalize(root, keys)?;
        Ok((archive, stats))
    }
}
