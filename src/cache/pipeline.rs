//! Scan-then-rewrite pipeline over the staged artifacts
//!
//! The scan pass must see every artifact before the first one is rewritten,
//! because widening a class depends on references made from anywhere in
//! the corpus. Each artifact is read once per pass and written back only if
//! its bytes changed.

use crate::cache::archive::{StagingRoot, ACCESS_METADATA_FILE};
use crate::cache::populate::{ArtifactIndex, ResourceRoots};
use crate::cache::visibility::WideningPatch;
use crate::error::{TranscacheError, TranscacheResult};
use crate::rewriter::{RewriteContext, RewriteError, Rewriter};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use tracing::{debug, info};

/// Stage of a cache build, as reported to a [`BuildObserver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Copy,
    Scan,
    Rewrite,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy => write!(f, "copy"),
            Self::Scan => write!(f, "scan"),
            Self::Rewrite => write!(f, "rewrite"),
        }
    }
}

/// Receives progress of a cache build
pub trait BuildObserver {
    /// A phase starts with `total` items
    fn phase(&mut self, _phase: BuildPhase, _total: usize) {}

    /// One item of the current phase is done
    fn advance(&mut self, _item: &str) {}
}

impl BuildObserver for () {}

/// Counters of one pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub artifacts: usize,
    /// Artifacts the scanner could not parse
    pub unreadable: usize,
    /// Artifacts the rewriter refused
    pub not_transformable: usize,
    /// Artifacts with at least one widened symbol
    pub widened: usize,
    /// Artifacts written back with new bytes
    pub written: usize,
}

/// Per-build state shared by both passes
///
/// Dropped when the pipeline returns, together with the accumulated patch.
struct TransformContext<'a> {
    index: &'a ArtifactIndex,
    resources: &'a ResourceRoots,
    patch: WideningPatch,
}

/// Runs the scan and rewrite passes over a staging tree
pub struct TransformPipeline<'r> {
    rewriter: &'r mut dyn Rewriter,
}

impl<'r> TransformPipeline<'r> {
    pub fn new(rewriter: &'r mut dyn Rewriter) -> Self {
        Self { rewriter }
    }

    /// Scan every indexed artifact, then rewrite and widen each one
    pub fn run(
        &mut self,
        root: &StagingRoot,
        index: &ArtifactIndex,
        resources: &ResourceRoots,
        observer: &mut dyn BuildObserver,
    ) -> TranscacheResult<PipelineStats> {
        let mut ctx = TransformContext {
            index,
            resources,
            patch: WideningPatch::default(),
        };
        let mut stats = PipelineStats {
            artifacts: index.len(),
            ..Default::default()
        };

        self.scan(&mut ctx, &mut stats, observer)?;
        info!(
            "Scanned {} artifacts, {} classes and {} members to widen",
            stats.artifacts,
            ctx.patch.class_count(),
            ctx.patch.member_count()
        );

        let records = self.rewrite(&ctx, &mut stats, observer)?;
        if !records.is_empty() {
            let path = root.path().join(ACCESS_METADATA_FILE);
            let mut text = String::new();
            for line in &records {
                text.push_str(line);
                text.push('\n');
            }
            fs::write(&path, text).map_err(|e| TranscacheError::artifact_io(&path, e))?;
            debug!("Wrote {} access records", records.len());
        }

        info!(
            "Rewrote {} artifacts ({} refused by the rewriter, {} widened)",
            stats.written, stats.not_transformable, stats.widened
        );
        Ok(stats)
    }

    fn scan(
        &mut self,
        ctx: &mut TransformContext<'_>,
        stats: &mut PipelineStats,
        observer: &mut dyn BuildObserver,
    ) -> TranscacheResult<()> {
        observer.phase(BuildPhase::Scan, ctx.index.len());
        for entry in ctx.index.entries() {
            let bytes =
                fs::read(&entry.path).map_err(|e| TranscacheError::artifact_io(&entry.path, e))?;
            if !ctx.patch.scan(entry, &bytes, ctx.index) {
                stats.unreadable += 1;
            }
            observer.advance(&entry.qualified_name);
        }
        Ok(())
    }

    fn rewrite(
        &mut self,
        ctx: &TransformContext<'_>,
        stats: &mut PipelineStats,
        observer: &mut dyn BuildObserver,
    ) -> TranscacheResult<BTreeSet<String>> {
        let mut records = BTreeSet::new();
        observer.phase(BuildPhase::Rewrite, ctx.index.len());

        for entry in ctx.index.entries() {
            let original =
                fs::read(&entry.path).map_err(|e| TranscacheError::artifact_io(&entry.path, e))?;
            let name = entry.qualified_name.as_str();
            let rewrite_ctx = RewriteContext {
                resources: ctx.resources,
                owner: entry.owner.as_deref(),
            };

            let mut current: Cow<'_, [u8]> = match self.rewriter.transform(&rewrite_ctx, name, name, &original) {
                Ok(bytes) => Cow::Owned(bytes),
                Err(RewriteError::NotTransformable { reason, .. }) => {
                    debug!("Keeping {} as is: {}", name, reason);
                    stats.not_transformable += 1;
                    Cow::Borrowed(&original)
                }
                Err(source) => {
                    return Err(TranscacheError::Rewrite {
                        name: name.to_string(),
                        source,
                    })
                }
            };

            if let Some(widened) = ctx.patch.apply(&current) {
                stats.widened += 1;
                records.extend(widened.records);
                current = Cow::Owned(widened.bytes);
            }

            if current.as_ref() != original.as_slice() {
                fs::write(&entry.path, &current)
                    .map_err(|e| TranscacheError::artifact_io(&entry.path, e))?;
                stats.written += 1;
                debug!("Rewrote {} ({} -> {} bytes)", name, original.len(), current.len());
            }
            observer.advance(name);
        }

        Ok(records)
    }
}
