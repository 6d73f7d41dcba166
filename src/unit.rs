//! Load units and the solved-dependency record
//!
//! These are produced by the resolver that sits in front of the cache. The
//! library takes them as plain values; the CLI reads them from a TOML unit
//! manifest.

use crate::error::{TranscacheError, TranscacheResult};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One bundle of code/resource artifacts taking part in the load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadUnit {
    /// Unique unit id, also the name of its subtree in the archive
    pub id: String,
    /// File or directory the unit was loaded from
    pub origin: PathBuf,
    /// Content hash supplied by the resolver; computed from `origin` when absent
    pub content_hash: Option<Vec<u8>>,
    /// Directory holding the unit's artifacts
    pub resource_root: PathBuf,
    /// Whether the unit takes part in rewriting at all
    pub needs_transform: bool,
    /// Whether non-code resources may change under rewriting
    pub could_resources_change: bool,
    /// Namespace the unit is remapped from, if any. Remapped units are
    /// served by the remapper, not by this cache.
    pub namespace_mapping_source: Option<String>,
    /// Rewriter configuration files declared by the unit
    pub rewriter_configs: Vec<String>,
}

impl LoadUnit {
    /// Create a unit that needs transforming, loaded from its resource root
    pub fn new(id: impl Into<String>, resource_root: impl Into<PathBuf>) -> Self {
        let resource_root = resource_root.into();
        Self {
            id: id.into(),
            origin: resource_root.clone(),
            content_hash: None,
            resource_root,
            needs_transform: true,
            could_resources_change: false,
            namespace_mapping_source: None,
            rewriter_configs: Vec::new(),
        }
    }

    /// Set the origin file or directory
    pub fn with_origin(mut self, origin: impl Into<PathBuf>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Use a pre-computed content hash instead of hashing `origin`
    pub fn with_content_hash(mut self, hash: impl Into<Vec<u8>>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Set whether resources other than code may change
    pub fn with_resources_changing(mut self, could_change: bool) -> Self {
        self.could_resources_change = could_change;
        self
    }

    /// Set the rewriter configs declared by this unit
    pub fn with_rewriter_configs(mut self, configs: Vec<String>) -> Self {
        self.rewriter_configs = configs;
        self
    }

    /// File name of the origin, as recorded in the cache key
    pub fn origin_name(&self) -> String {
        self.origin
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.origin.display().to_string())
    }

    /// Content hash of the unit
    ///
    /// Returns the resolver-supplied hash if present. Otherwise streams the
    /// origin through SHA-256; for a directory origin every regular file is
    /// fed in sorted path order as length-prefixed relative path, then
    /// length-prefixed content.
    pub fn compute_origin_hash(&self) -> TranscacheResult<Vec<u8>> {
        if let Some(ref hash) = self.content_hash {
            return Ok(hash.clone());
        }

        let to_error = |path: &Path, source: std::io::Error| TranscacheError::HashComputation {
            unit: self.id.clone(),
            path: path.to_path_buf(),
            source,
        };

        let mut hasher = Sha256::new();
        let meta = std::fs::metadata(&self.origin).map_err(|e| to_error(&self.origin, e))?;

        if meta.is_dir() {
            for entry in WalkDir::new(&self.origin).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    let path = e.path().unwrap_or(&self.origin).to_path_buf();
                    to_error(&path, e.into())
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&self.origin)
                    .unwrap_or(entry.path());
                let rel = rel.to_string_lossy().replace('\\', "/");
                let len = entry.metadata().map_err(|e| to_error(entry.path(), e.into()))?.len();
                // Path and content are both length-framed.
                hasher.update((rel.len() as u64).to_be_bytes());
                hasher.update(rel.as_bytes());
                hasher.update(len.to_be_bytes());
                let fed = hash_stream(entry.path(), &mut hasher)
                    .map_err(|e| to_error(entry.path(), e))?;
                if fed != len {
                    let changed = std::io::Error::other("file changed size while hashing");
                    return Err(to_error(entry.path(), changed));
                }
            }
        } else {
            hash_stream(&self.origin, &mut hasher).map_err(|e| to_error(&self.origin, e))?;
        }

        Ok(hasher.finalize().to_vec())
    }
}

/// Feed a file into the hasher without loading it whole
fn hash_stream(path: &Path, hasher: &mut Sha256) -> std::io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
}

/// Outcome of dependency solving that affects the cache key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyRecord {
    /// Provided alias -> id of the unit that provides it
    pub provided: BTreeMap<String, String>,
    /// Direct key -> id of the unit selected for it
    pub direct: BTreeMap<String, String>,
}

impl DependencyRecord {
    /// Record where every unit is a direct dependency under its own id
    pub fn direct_from_units(units: &[LoadUnit]) -> Self {
        Self {
            provided: BTreeMap::new(),
            direct: units
                .iter()
                .map(|u| (u.id.clone(), u.id.clone()))
                .collect(),
        }
    }
}

/// Unit manifest as written by the resolver for the CLI
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnitManifest {
    /// Units in load order
    #[serde(default, rename = "unit")]
    pub units: Vec<ManifestUnit>,

    /// Provided alias -> unit id
    #[serde(default)]
    pub provided: BTreeMap<String, String>,

    /// Direct key -> unit id (defaults to every unit under its own id)
    #[serde(default)]
    pub direct: Option<BTreeMap<String, String>>,

    /// Roots of loadable code not owned by any unit
    #[serde(default)]
    pub unassociated: Vec<PathBuf>,
}

/// One `[[unit]]` table of the manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestUnit {
    pub id: String,
    pub resource_root: PathBuf,
    #[serde(default)]
    pub origin: Option<PathBuf>,
    /// Hex-encoded pre-computed hash
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default = "default_true")]
    pub needs_transform: bool,
    #[serde(default)]
    pub could_resources_change: bool,
    #[serde(default)]
    pub namespace_mapping_source: Option<String>,
    #[serde(default)]
    pub rewriter_configs: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Resolved inputs of one cache build
#[derive(Debug, Clone)]
pub struct BuildInputs {
    pub units: Vec<LoadUnit>,
    pub solved: DependencyRecord,
    pub unassociated: Vec<PathBuf>,
}

impl UnitManifest {
    /// Parse a manifest from a TOML file on disk
    pub async fn from_file(path: &Path) -> TranscacheResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            TranscacheError::io(format!("reading unit manifest {}", path.display()), e)
        })?;
        Self::parse(&content).map_err(|e| match e {
            TranscacheError::ManifestInvalid { reason, .. } => TranscacheError::ManifestInvalid {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse a manifest from a TOML string
    pub fn parse(content: &str) -> TranscacheResult<Self> {
        toml::from_str(content).map_err(|e| TranscacheError::ManifestInvalid {
            path: "units.toml".into(),
            reason: e.to_string(),
        })
    }

    /// Turn the manifest into build inputs, resolving relative paths against `base`
    pub fn into_inputs(self, base: &Path) -> TranscacheResult<BuildInputs> {
        let resolve = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

        let mut units = Vec::with_capacity(self.units.len());
        for mu in self.units {
            let resource_root = resolve(mu.resource_root);
            let origin = mu.origin.map(resolve).unwrap_or_else(|| resource_root.clone());
            let content_hash = match mu.hash {
                Some(h) => Some(hex::decode(&h).map_err(|e| TranscacheError::ManifestInvalid {
                    path: base.to_path_buf(),
                    reason: format!("unit {}: hash '{}' is not hex: {}", mu.id, h, e),
                })?),
                None => None,
            };
            units.push(LoadUnit {
                id: mu.id,
                origin,
                content_hash,
                resource_root,
                needs_transform: mu.needs_transform,
                could_resources_change: mu.could_resources_change,
                namespace_mapping_source: mu.namespace_mapping_source,
                rewriter_configs: mu.rewriter_configs,
            });
        }

        let direct = match self.direct {
            Some(direct) => direct,
            None => DependencyRecord::direct_from_units(&units).direct,
        };

        Ok(BuildInputs {
            units,
            solved: DependencyRecord {
                provided: self.provided,
                direct,
            },
            unassociated: self.unassociated.into_iter().map(resolve).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn supplied_hash_wins() {
        let unit = LoadUnit::new("a", "/does/not/exist").with_content_hash(vec![1, 2, 3]);
        assert_eq!(unit.compute_origin_hash().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn file_hash_deterministic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jar");
        std::fs::write(&path, b"unit a").unwrap();

        let unit = LoadUnit::new("a", dir.path()).with_origin(&path);
        let h1 = unit.compute_origin_hash().unwrap();
        let h2 = unit.compute_origin_hash().unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
        assert_eq!(unit.origin_name(), "a.jar");
    }

    #[test]
    fn directory_hash_sees_nested_changes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("com/x")).unwrap();
        std::fs::write(dir.path().join("com/x/A.class"), b"one").unwrap();

        let unit = LoadUnit::new("a", dir.path());
        let before = unit.compute_origin_hash().unwrap();

        std::fs::write(dir.path().join("com/x/A.class"), b"two").unwrap();
        let after = unit.compute_origin_hash().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn directory_hash_frames_paths_and_contents() {
        let split = TempDir::new().unwrap();
        std::fs::write(split.path().join("p"), b"1").unwrap();
        std::fs::write(split.path().join("q"), b"2").unwrap();

        // Same byte stream as `split` without framing
        let merged = TempDir::new().unwrap();
        std::fs::write(merged.path().join("p"), b"1q\x002").unwrap();

        let a = LoadUnit::new("a", split.path()).compute_origin_hash().unwrap();
        let b = LoadUnit::new("a", merged.path()).compute_origin_hash().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn missing_origin_is_hash_error() {
        let unit = LoadUnit::new("ghost", "/nonexistent/unit.jar");
        match unit.compute_origin_hash() {
            Err(TranscacheError::HashComputation { unit, .. }) => assert_eq!(unit, "ghost"),
            other => panic!("expected hash error, got {:?}", other),
        }
    }

    #[test]
    fn manifest_defaults_direct_to_units() {
        let manifest = UnitManifest::parse(
            r#"
unassociated = ["extra"]

[[unit]]
id = "a"
resource_root = "units/a"
hash = "0a0b"
rewriter_configs = ["a.rewrites.json"]

[[unit]]
id = "b"
resource_root = "/abs/b"
needs_transform = false

[provided]
alias = "a"
"#,
        )
        .unwrap();

        let inputs = manifest.into_inputs(Path::new("/base")).unwrap();
        assert_eq!(inputs.units.len(), 2);
        assert_eq!(inputs.units[0].resource_root, PathBuf::from("/base/units/a"));
        assert_eq!(inputs.units[0].content_hash, Some(vec![0x0a, 0x0b]));
        assert_eq!(inputs.units[1].resource_root, PathBuf::from("/abs/b"));
        assert!(!inputs.units[1].needs_transform);
        assert_eq!(inputs.solved.direct.get("b"), Some(&"b".to_string()));
        assert_eq!(inputs.solved.provided.get("alias"), Some(&"a".to_string()));
        assert_eq!(inputs.unassociated, vec![PathBuf::from("/base/extra")]);
    }

    #[test]
    fn manifest_rejects_bad_hash() {
        let manifest = UnitManifest::parse(
            r#"
[[unit]]
id = "a"
resource_root = "a"
hash = "zz"
"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.into_inputs(Path::new("/base")),
            Err(TranscacheError::ManifestInvalid { .. })
        ));
    }
}
