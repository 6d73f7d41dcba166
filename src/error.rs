//! Error types for transcache
//!
//! All modules use `TranscacheResult<T>` as their return type. Cache
//! invalidation (corrupt archive, key mismatch) is not an error: the
//! validator reports it as a [`crate::cache::Validity`] and the cache
//! rebuilds. Everything in this enum is fatal to the current build.

use crate::rewriter::RewriteError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for transcache operations
pub type TranscacheResult<T> = Result<T, TranscacheError>;

/// All errors that can occur in transcache
#[derive(Error, Debug)]
pub enum TranscacheError {
    // Cache key errors
    #[error("Failed to compute the hash of unit {unit} ({path})")]
    HashComputation {
        unit: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cache key entry '{key}': {reason}")]
    InvalidCacheKey { key: String, reason: &'static str },

    #[error("Duplicate cache key: {0}")]
    DuplicateCacheKey(String),

    #[error("Solved dependencies reference unknown unit: {0}")]
    UnknownUnit(String),

    // Archive errors
    #[error("IO error at {path}")]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read transform cache archive {path}")]
    ArchiveFormat {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Transform cache archive {0} has no completion marker")]
    ArchiveIncomplete(PathBuf),

    #[error("Malformed options record at line {line}: {reason}")]
    CorruptOptions { line: usize, reason: String },

    #[error("Failed to delete the old transform cache entry {path}{}", suppressed_suffix(.suppressed))]
    EraseFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        suppressed: Option<String>,
    },

    #[error("Invalid unit id '{id}': {reason}")]
    InvalidUnitId { id: String, reason: &'static str },

    // Rewriter errors
    #[error("Rewriter config {name} is declared by both {first} and {second}")]
    DuplicateRewriterConfig {
        name: String,
        first: String,
        second: String,
    },

    #[error("Rewriter failed on {name}")]
    Rewrite {
        name: String,
        #[source]
        source: RewriteError,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid unit manifest {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

fn suppressed_suffix(suppressed: &Option<String>) -> String {
    match suppressed {
        Some(reason) => format!(" (after failing to read it: {reason})"),
        None => String::new(),
    }
}

impl TranscacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an IO error tied to a specific artifact or archive path
    pub fn artifact_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ArtifactIo {
            path: path.into(),
            source,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::HashComputation { .. } => Some("Check that the unit's origin is readable"),
            Self::EraseFailed { .. } => {
                Some("Delete the transform cache folder manually, then run again")
            }
            Self::ArtifactIo { .. } => Some("Check free disk space and permissions of the cache folder"),
            Self::DuplicateRewriterConfig { .. } => {
                Some("Each rewriter config name may be declared by one unit only")
            }
            Self::InvalidCacheKey { .. } => Some("Unit ids, aliases and flags must not contain '=' or newlines"),
            _ => None,
        }
    }
}
