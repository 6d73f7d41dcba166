//! Copying unit artifacts into the staging tree
//!
//! Streams one file at a time from each unit's resource root into
//! `<staging>/<unit id>/`, and builds the artifact index the pipeline works
//! from. Nothing corpus-wide is held in memory except names.

use crate::cache::archive::{StagingRoot, RESERVED_PREFIX, UNASSOCIATED_DIR};
use crate::cache::pipeline::{BuildObserver, BuildPhase};
use crate::error::{TranscacheError, TranscacheResult};
use crate::unit::LoadUnit;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const CLASS_EXT: &str = "class";
const TRANSFORMER_INPUT_EXT: &str = "chasm";

/// One code artifact in the staging tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    /// Absolute path in the staging tree
    pub path: PathBuf,
    /// Path below the owner's subtree, `/`-separated
    pub rel: String,
    /// Internal name, e.g. `com/x/Foo`
    pub internal_name: String,
    /// Qualified name, e.g. `com.x.Foo`
    pub qualified_name: String,
    /// Owning unit; `None` for unassociated artifacts
    pub owner: Option<String>,
}

impl ArtifactEntry {
    /// Owner as stored in the archive: the unit id or the unassociated subtree
    pub fn owner_dir(&self) -> &str {
        self.owner.as_deref().unwrap_or(UNASSOCIATED_DIR)
    }
}

/// Immutable index of every staged code artifact
///
/// Built once by the populator and shared by both pipeline passes. When two
/// owners provide the same class, the first in load order wins the name
/// lookup.
#[derive(Debug, Clone, Default)]
pub struct ArtifactIndex {
    entries: Vec<ArtifactEntry>,
    by_name: BTreeMap<String, usize>,
}

impl ArtifactIndex {
    pub(crate) fn push(&mut self, entry: ArtifactEntry) {
        let slot = self.entries.len();
        self.by_name.entry(entry.internal_name.clone()).or_insert(slot);
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ArtifactEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an artifact by internal name
    pub fn get(&self, internal_name: &str) -> Option<&ArtifactEntry> {
        self.by_name.get(internal_name).map(|&i| &self.entries[i])
    }
}

/// Staged resource roots handed to the rewriter
///
/// Names of the form `#<unit id>:<path>` resolve inside that unit; plain
/// names are looked up in every root in load order.
#[derive(Debug, Clone, Default)]
pub struct ResourceRoots {
    roots: Vec<(String, PathBuf)>,
}

impl ResourceRoots {
    fn add(&mut self, unit: &str, root: PathBuf) {
        self.roots.push((unit.to_string(), root));
    }

    /// Staged root of one unit
    pub fn root(&self, unit: &str) -> Option<&Path> {
        self.roots
            .iter()
            .find(|(id, _)| id == unit)
            .map(|(_, root)| root.as_path())
    }

    /// Every (unit id, staged root) pair in load order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.roots.iter().map(|(id, root)| (id.as_str(), root.as_path()))
    }

    /// Resolve a resource name to an existing staged file
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if let Some((unit, rel)) = name.strip_prefix('#').and_then(|s| s.split_once(':')) {
            let path = self.root(unit)?.join(rel.trim_start_matches('/'));
            return path.is_file().then_some(path);
        }
        let rel = name.trim_start_matches('/');
        self.roots
            .iter()
            .map(|(_, root)| root.join(rel))
            .find(|path| path.is_file())
    }
}

/// What one population run produced
#[derive(Debug, Default)]
pub struct PopulateOutcome {
    pub index: ArtifactIndex,
    pub resources: ResourceRoots,
    /// Ids of the units copied, in load order
    pub units: Vec<String>,
    pub copied_files: usize,
    pub copied_bytes: u64,
}

/// Copies eligible unit artifacts into a staging tree
#[derive(Debug, Clone)]
pub struct Populator {
    bootstrap_unit: String,
}

impl Populator {
    /// `bootstrap_unit` is the id of the cache's own unit, which is never copied
    pub fn new(bootstrap_unit: impl Into<String>) -> Self {
        Self {
            bootstrap_unit: bootstrap_unit.into(),
        }
    }

    /// Whether a unit's artifacts belong in the cache
    pub fn is_eligible(&self, unit: &LoadUnit) -> bool {
        unit.needs_transform
            && unit.namespace_mapping_source.is_none()
            && unit.id != self.bootstrap_unit
    }

    /// Copy every eligible unit, then the unassociated roots
    pub fn populate(
        &self,
        root: &StagingRoot,
        units: &[LoadUnit],
        unassociated: &[PathBuf],
        observer: &mut dyn BuildObserver,
    ) -> TranscacheResult<PopulateOutcome> {
        let mut seen = BTreeSet::new();
        for unit in units {
            if !seen.insert(unit.id.as_str()) {
                return Err(TranscacheError::InvalidUnitId {
                    id: unit.id.clone(),
                    reason: "id is used by more than one unit",
                });
            }
        }

        let eligible: Vec<&LoadUnit> = units.iter().filter(|u| self.is_eligible(u)).collect();
        for unit in &eligible {
            validate_unit_id(&unit.id)?;
        }

        let mut outcome = PopulateOutcome::default();
        observer.phase(BuildPhase::Copy, eligible.len() + unassociated.len());

        for unit in eligible {
            let dest = root.unit_dir(&unit.id);
            let code_only = !unit.could_resources_change;
            debug!(
                "Copying unit {} from {} ({})",
                unit.id,
                unit.resource_root.display(),
                if code_only { "code only" } else { "all files" }
            );
            copy_tree(&unit.resource_root, &dest, Some(&unit.id), code_only, &mut outcome)?;
            fs::create_dir_all(&dest).map_err(|e| TranscacheError::artifact_io(&dest, e))?;
            outcome.resources.add(&unit.id, dest);
            outcome.units.push(unit.id.clone());
            observer.advance(&unit.id);
        }

        let dest = root.unassociated_dir();
        for source in unassociated {
            debug!("Copying unassociated root {}", source.display());
            copy_tree(source, &dest, None, true, &mut outcome)?;
            observer.advance(&source.display().to_string());
        }

        info!(
            "Copied {} files ({} bytes) from {} units, {} code artifacts indexed",
            outcome.copied_files,
            outcome.copied_bytes,
            outcome.units.len(),
            outcome.index.len()
        );
        Ok(outcome)
    }
}

fn validate_unit_id(id: &str) -> TranscacheResult<()> {
    let reason = if id.is_empty() {
        "id is empty"
    } else if id.contains('/') || id.contains('\\') {
        "id contains a path separator"
    } else if id == "." || id == ".." {
        "id is a relative path component"
    } else if id.starts_with(RESERVED_PREFIX) {
        "ids starting with '__' are reserved"
    } else {
        return Ok(());
    };
    Err(TranscacheError::InvalidUnitId {
        id: id.to_string(),
        reason,
    })
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

fn copy_tree(
    source: &Path,
    dest: &Path,
    owner: Option<&str>,
    code_only: bool,
    outcome: &mut PopulateOutcome,
) -> TranscacheResult<()> {
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            TranscacheError::artifact_io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let is_class = has_ext(path, CLASS_EXT);
        let is_input = has_ext(path, TRANSFORMER_INPUT_EXT);
        if code_only && !is_class && !(is_input && owner.is_some()) {
            continue;
        }

        let rel = path.strip_prefix(source).unwrap_or(path);
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| TranscacheError::artifact_io(parent, e))?;
        }
        let bytes = fs::copy(path, &target).map_err(|e| TranscacheError::artifact_io(path, e))?;
        outcome.copied_files += 1;
        outcome.copied_bytes += bytes;

        if is_class {
            if let Some(internal_name) = internal_name(rel) {
                outcome.index.push(ArtifactEntry {
                    path: target,
                    rel: rel_string(rel),
                    qualified_name: internal_name.replace('/', "."),
                    internal_name,
                    owner: owner.map(str::to_string),
                });
            }
        }
    }
    Ok(())
}

fn rel_string(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

/// Internal class name of a relative `.class` path
///
/// Classes under a directory with a `.` in its name, or with a `.` in
/// their stem, are not loadable by name.
pub fn internal_name(rel: &Path) -> Option<String> {
    let rel = rel_string(rel);
    let stem = rel.strip_suffix(".class")?;
    let (dirs, file) = match stem.rsplit_once('/') {
        Some((dirs, file)) => (Some(dirs), file),
        None => (None, stem),
    };
    if file.is_empty() || file.contains('.') {
        return None;
    }
    if dirs.is_some_and(|d| d.split('/').any(|part| part.contains('.') || part.is_empty())) {
        return None;
    }
    Some(stem.to_string())
}
