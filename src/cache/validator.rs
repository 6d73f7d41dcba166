//! Reuse-or-rebuild decision
//!
//! Compares the key set of the current inputs against the one persisted in
//! the archive. Anything short of an exact match means rebuild.

use crate::cache::archive::ArchiveStore;
use crate::cache::key::{CacheKeySet, KeyDiff};
use std::fmt;
use tracing::{debug, info};

/// Why an existing archive cannot be reused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// No archive file in the cache folder
    Missing,
    /// The archive, its marker or its options record is unreadable
    Corrupt(String),
    /// Persisted keys differ from the current ones
    Mismatch(KeyDiff),
    /// Development mode never reuses
    Development,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Corrupt(reason) => write!(f, "corrupt ({})", reason),
            Self::Mismatch(diff) => write!(f, "{} changed keys", diff.len()),
            Self::Development => write!(f, "development mode"),
        }
    }
}

/// Outcome of a validity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid(InvalidReason),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Read error to attach if erasing the stale archive fails
    pub fn cause(&self) -> Option<String> {
        match self {
            Self::Invalid(InvalidReason::Corrupt(reason)) => Some(reason.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::Invalid(reason) => write!(f, "invalid: {}", reason),
        }
    }
}

/// Decides whether the archive in a cache folder matches the current inputs
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheValidator {
    log_changed_keys: bool,
    development: bool,
}

impl CacheValidator {
    pub fn new(log_changed_keys: bool, development: bool) -> Self {
        Self {
            log_changed_keys,
            development,
        }
    }

    /// Check the archive of `store` against `current`
    pub fn check(&self, store: &ArchiveStore, current: &CacheKeySet) -> Validity {
        if self.development {
            info!("Development mode, rebuilding the transform cache");
            return Validity::Invalid(InvalidReason::Development);
        }

        if !store.exists() {
            info!("No transform cache at {}", store.dir().display());
            return Validity::Invalid(InvalidReason::Missing);
        }

        let persisted = match store.try_open().and_then(|fs| fs.options()) {
            Ok(keys) => keys,
            Err(e) => {
                info!("Transform cache is unreadable, rebuilding: {}", e);
                return Validity::Invalid(InvalidReason::Corrupt(e.to_string()));
            }
        };

        let diff = persisted.diff(current);
        if diff.is_empty() {
            debug!("Transform cache keys match ({} entries)", current.len());
            return Validity::Valid;
        }

        self.log_diff(&diff);
        Validity::Invalid(InvalidReason::Mismatch(diff))
    }

    fn log_diff(&self, diff: &KeyDiff) {
        if !self.log_changed_keys {
            info!(
                "Transform cache keys changed ({} entries), rebuilding. Enable cache.log_changed_keys to list them",
                diff.len()
            );
            return;
        }

        info!("Transform cache keys changed, rebuilding:");
        for (key, old) in &diff.removed {
            info!("  Missing: {}={}", key, old);
        }
        for (key, new) in &diff.added {
            info!("  Included: {}={}", key, new);
        }
        for (key, (old, new)) in &diff.changed {
            info!("  Different: {}: {} -> {}", key, old, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn keys(text: &str) -> CacheKeySet {
        CacheKeySet::parse_options(text).unwrap()
    }

    fn built_store(dir: &TempDir, persisted: &CacheKeySet) -> ArchiveStore {
        let store = ArchiveStore::new(dir.path());
        let root = store.stage().unwrap();
        fs::create_dir_all(root.unit_dir("a")).unwrap();
        fs::write(root.unit_dir("a").join("A.class"), b"a").unwrap();
        store.finalize(root, persisted).unwrap();
        store
    }

    #[test]
    fn missing_archive() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path());
        assert_eq!(
            CacheValidator::default().check(&store, &keys("a=1\n")),
            Validity::Invalid(InvalidReason::Missing)
        );
    }

    #[test]
    fn matching_keys_are_valid() {
        let dir = TempDir::new().unwrap();
        let current = keys("unit#0=a\nflag:x=true\n");
        let store = built_store(&dir, &current);
        assert!(CacheValidator::default().check(&store, &current).is_valid());
    }

    #[test]
    fn changed_flag_is_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = built_store(&dir, &keys("unit#0=a\nflag:x=true\n"));

        let validity = CacheValidator::new(true, false).check(&store, &keys("unit#0=a\nflag:x=false\n"));
        match validity {
            Validity::Invalid(InvalidReason::Mismatch(diff)) => {
                assert_eq!(diff.keys(), vec!["flag:x"]);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn garbage_archive_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path());
        fs::write(store.archive_path(), b"definitely not a zip").unwrap();

        let validity = CacheValidator::default().check(&store, &keys("a=1\n"));
        assert!(matches!(validity, Validity::Invalid(InvalidReason::Corrupt(_))));
        assert!(validity.cause().is_some());
    }

    #[test]
    fn development_never_reuses() {
        let dir = TempDir::new().unwrap();
        let current = keys("a=1\n");
        let store = built_store(&dir, &current);
        assert_eq!(
            CacheValidator::new(false, true).check(&store, &current),
            Validity::Invalid(InvalidReason::Development)
        );
    }

    #[test]
    fn display_names_reason() {
        assert_eq!(Validity::Valid.to_string(), "valid");
        assert_eq!(
            Validity::Invalid(InvalidReason::Missing).to_string(),
            "invalid: missing"
        );
    }
}
