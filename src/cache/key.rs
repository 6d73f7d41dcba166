//! Cache key derivation
//!
//! The key set is the canonical fingerprint of every input that can change
//! the rewritten output. It is persisted as `options.txt` inside the archive
//! and compared on the next run.

use crate::error::{TranscacheError, TranscacheResult};
use crate::unit::{DependencyRecord, LoadUnit};
use std::collections::BTreeMap;
use tracing::debug;

/// Canonical, comparable fingerprint of one cache build
///
/// Entries are kept sorted by key, so the serialized form is byte-identical
/// for identical inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKeySet {
    entries: BTreeMap<String, String>,
}

/// Difference between a persisted key set and the current one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDiff {
    /// Persisted keys that the current inputs no longer produce
    pub removed: BTreeMap<String, String>,
    /// Keys the current inputs produce that were not persisted
    pub added: BTreeMap<String, String>,
    /// Keys present in both with different values: (persisted, current)
    pub changed: BTreeMap<String, (String, String)>,
}

impl KeyDiff {
    /// Returns `true` if both key sets are identical
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }

    /// Number of differing keys
    pub fn len(&self) -> usize {
        self.removed.len() + self.added.len() + self.changed.len()
    }

    /// All differing keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .removed
            .keys()
            .chain(self.added.keys())
            .chain(self.changed.keys())
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        keys
    }
}

impl CacheKeySet {
    /// Create an empty key set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, rejecting separators and duplicate keys
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> TranscacheResult<()> {
        let key = key.into();
        let value = value.into();

        if key.is_empty() {
            return Err(TranscacheError::InvalidCacheKey {
                key,
                reason: "key is empty",
            });
        }
        if key.contains('=') || key.contains('\n') || key.contains('\r') {
            return Err(TranscacheError::InvalidCacheKey {
                key,
                reason: "key contains '=' or a line break",
            });
        }
        if value.contains('=') || value.contains('\n') || value.contains('\r') {
            return Err(TranscacheError::InvalidCacheKey {
                key,
                reason: "value contains '=' or a line break",
            });
        }
        if self.entries.contains_key(&key) {
            return Err(TranscacheError::DuplicateCacheKey(key));
        }

        self.entries.insert(key, value);
        Ok(())
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize as `key=value` lines in key order
    pub fn to_options(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Parse an options record written by [`CacheKeySet::to_options`]
    ///
    /// Blank lines are ignored. A line without `=` or a repeated key makes
    /// the whole record unreadable.
    pub fn parse_options(text: &str) -> TranscacheResult<Self> {
        let mut entries = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(TranscacheError::CorruptOptions {
                    line: n + 1,
                    reason: "missing '='".to_string(),
                });
            };
            if entries.insert(key.to_string(), value.to_string()).is_some() {
                return Err(TranscacheError::CorruptOptions {
                    line: n + 1,
                    reason: format!("repeated key '{}'", key),
                });
            }
        }
        Ok(Self { entries })
    }

    /// Three-way diff of `self` (persisted) against `current`
    pub fn diff(&self, current: &CacheKeySet) -> KeyDiff {
        let mut diff = KeyDiff::default();

        for (key, old) in &self.entries {
            match current.entries.get(key) {
                Some(new) if new == old => {}
                Some(new) => {
                    diff.changed.insert(key.clone(), (old.clone(), new.clone()));
                }
                None => {
                    diff.removed.insert(key.clone(), old.clone());
                }
            }
        }

        for (key, new) in &current.entries {
            if !self.entries.contains_key(key) {
                diff.added.insert(key.clone(), new.clone());
            }
        }

        diff
    }
}

/// Builds the [`CacheKeySet`] for the current inputs
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Derive the key set from units, solved dependencies and feature flags
    ///
    /// Encodes the load order (`unit#<n>`), every provided alias
    /// (`provided-unit:<alias>`), the origin name and content hash of every
    /// direct unit (`unit:<key>`) and every flag (`flag:<name>`). Hashing
    /// failures are fatal.
    pub fn build(
        units: &[LoadUnit],
        solved: &DependencyRecord,
        flags: &BTreeMap<String, bool>,
    ) -> TranscacheResult<CacheKeySet> {
        let mut keys = CacheKeySet::new();

        // Load order can change rewrite results, so each position is keyed.
        for (index, unit) in units.iter().enumerate() {
            keys.insert(format!("unit#{}", index), unit.id.clone())?;
        }

        for (alias, owner) in &solved.provided {
            keys.insert(format!("provided-unit:{}", alias), owner.clone())?;
        }

        for (key, owner) in &solved.direct {
            let unit = units
                .iter()
                .find(|u| &u.id == owner)
                .ok_or_else(|| TranscacheError::UnknownUnit(owner.clone()))?;
            let hash = unit.compute_origin_hash()?;
            keys.insert(
                format!("unit:{}", key),
                format!("{} {}", unit.origin_name(), hex::encode(&hash)),
            )?;
        }

        for (flag, enabled) in flags {
            keys.insert(format!("flag:{}", flag), enabled.to_string())?;
        }

        debug!("Built cache key set with {} entries", keys.len());
        Ok(keys)
    }
}
