//! transcache - persistent, content-addressed transformation cache
//!
//! Copies the code artifacts of a set of load units into a staging tree,
//! rewrites them through a pluggable [`rewriter::Rewriter`], widens
//! cross-unit visibility, and packs the result into a crash-safe archive
//! that is reused for as long as the inputs stay the same.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod rewriter;
pub mod ui;
pub mod unit;

pub use cache::{CacheOptions, TransformCache, TransformCacheResult};
pub use error::{TranscacheError, TranscacheResult};
pub use unit::{DependencyRecord, LoadUnit};
