//! Packed archive store
//!
//! The rewritten corpus lives in a single zip file, `files.zip`, inside the
//! transform cache folder. A build never writes that file in place:
//!
//! 1. artifacts are copied and rewritten in a plain staging directory,
//! 2. `finalize` packs the staging tree into `files.zip.partial`, appends
//!    `options.txt` and then the zero-length completion marker as the very
//!    last entry, syncs the file, and
//! 3. renames it over `files.zip`.
//!
//! An interrupted build therefore leaves either no archive, or an archive
//! that fails to parse or lacks the marker. Both read as "absent".

use crate::cache::key::CacheKeySet;
use crate::error::{TranscacheError, TranscacheResult};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Name of the packed archive inside the cache folder
pub const ARCHIVE_FILE: &str = "files.zip";

/// Persisted cache key set
pub const OPTIONS_FILE: &str = "options.txt";

/// Zero-length entry present iff the archive was completely written
pub const COMPLETION_MARKER: &str = "__TRANSFORM_COMPLETE";

/// Subtree for loadable artifacts not owned by any unit
pub const UNASSOCIATED_DIR: &str = "__unassociated";

/// Access metadata written by the visibility patch
pub const ACCESS_METADATA_FILE: &str = "__widened_access.txt";

/// Top-level names starting with this prefix are reserved for the archive itself
pub const RESERVED_PREFIX: &str = "__";

const STAGING_DIR: &str = "staging";

/// Manages the packed archive of one transform cache folder
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    dir: PathBuf,
}

impl ArchiveStore {
    /// Create a store over the given cache folder
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The transform cache folder
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the finalized archive
    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_FILE)
    }

    fn partial_path(&self) -> PathBuf {
        self.dir.join(format!("{}.partial", ARCHIVE_FILE))
    }

    fn staging_path(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    /// Whether an archive file exists at all (complete or not)
    pub fn exists(&self) -> bool {
        self.archive_path().is_file()
    }

    /// Open the archive, reporting why it is unusable
    pub fn try_open(&self) -> TranscacheResult<ArchiveFs> {
        ArchiveFs::open(&self.archive_path())
    }

    /// Open the archive read-only iff its completion marker is present and readable
    pub fn open(&self) -> Option<ArchiveFs> {
        match self.try_open() {
            Ok(fs) => Some(fs),
            Err(e) => {
                debug!("Transform cache archive not usable: {}", e);
                None
            }
        }
    }

    /// Create a fresh staging tree, discarding leftovers of an interrupted build
    pub fn stage(&self) -> TranscacheResult<StagingRoot> {
        let path = self.staging_path();
        if path.exists() {
            debug!("Removing stale staging tree {}", path.display());
            fs::remove_dir_all(&path).map_err(|e| TranscacheError::artifact_io(&path, e))?;
        }
        fs::create_dir_all(&path).map_err(|e| TranscacheError::artifact_io(&path, e))?;
        Ok(StagingRoot { path })
    }

    /// Pack the staging tree into the archive and open the result
    ///
    /// The completion marker is the last entry written, and the archive only
    /// becomes visible under its final name after it has been synced.
    pub fn finalize(&self, root: StagingRoot, keys: &CacheKeySet) -> TranscacheResult<ArchiveFs> {
        let options_path = root.path().join(OPTIONS_FILE);
        fs::write(&options_path, keys.to_options())
            .map_err(|e| TranscacheError::artifact_io(&options_path, e))?;

        let partial = self.partial_path();
        let file = File::create(&partial).map_err(|e| TranscacheError::artifact_io(&partial, e))?;
        let mut writer = ZipWriter::new(BufWriter::new(file));
        let options = entry_options();
        let mut packed = 0usize;

        for entry in WalkDir::new(root.path()).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root.path()).to_path_buf();
                TranscacheError::artifact_io(path, e.into())
            })?;
            let name = entry_name(root.path(), entry.path());
            if entry.depth() == 1 && name == OPTIONS_FILE {
                continue;
            }

            if entry.file_type().is_dir() {
                writer
                    .add_directory(format!("{}/", name), options)
                    .map_err(|e| format_error(&partial, e))?;
            } else if entry.file_type().is_file() {
                writer
                    .start_file(name, options)
                    .map_err(|e| format_error(&partial, e))?;
                let mut src =
                    File::open(entry.path()).map_err(|e| TranscacheError::artifact_io(entry.path(), e))?;
                io::copy(&mut src, &mut writer)
                    .map_err(|e| TranscacheError::artifact_io(&partial, e))?;
                packed += 1;
            }
        }

        writer
            .start_file(OPTIONS_FILE, options)
            .map_err(|e| format_error(&partial, e))?;
        let mut src =
            File::open(&options_path).map_err(|e| TranscacheError::artifact_io(&options_path, e))?;
        io::copy(&mut src, &mut writer).map_err(|e| TranscacheError::artifact_io(&partial, e))?;

        writer
            .start_file(COMPLETION_MARKER, options)
            .map_err(|e| format_error(&partial, e))?;

        let buffered = writer.finish().map_err(|e| format_error(&partial, e))?;
        let file = buffered
            .into_inner()
            .map_err(|e| TranscacheError::artifact_io(&partial, e.into_error()))?;
        file.sync_all()
            .map_err(|e| TranscacheError::artifact_io(&partial, e))?;
        drop(file);

        let archive = self.archive_path();
        fs::rename(&partial, &archive).map_err(|e| TranscacheError::artifact_io(&archive, e))?;
        sync_dir(&self.dir);
        drop(root);

        info!("Wrote transform cache with {} artifacts to {}", packed, archive.display());
        self.try_open()
    }

    /// Delete the archive, a leftover partial archive and the staging tree
    ///
    /// Only entries this store writes are touched; anything else in the
    /// folder survives. `cause` is the read error that led to erasing, if
    /// any; it is attached to the error when deleting fails.
    pub fn erase(&self, cause: Option<String>) -> TranscacheResult<()> {
        let fail = |path: &Path, source: io::Error| TranscacheError::EraseFailed {
            path: path.to_path_buf(),
            source,
            suppressed: cause.clone(),
        };

        for path in [self.archive_path(), self.partial_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Erased {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(fail(&path, e)),
            }
        }

        let staging = self.staging_path();
        match fs::remove_dir_all(&staging) {
            Ok(()) => debug!("Erased {}", staging.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(fail(&staging, e)),
        }
        Ok(())
    }

    /// Read the archive once so the OS page cache holds it
    pub fn preload(&self) {
        let path = self.archive_path();
        let result = File::open(&path).and_then(|mut f| io::copy(&mut f, &mut io::sink()));
        match result {
            Ok(bytes) => debug!("Preloaded {} bytes of {}", bytes, path.display()),
            Err(e) => warn!("Failed to preload {}: {}", path.display(), e),
        }
    }
}

fn entry_options() -> SimpleFileOptions {
    // Fixed timestamps keep rebuilds with identical inputs byte-identical.
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
}

fn entry_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn format_error(path: &Path, source: ZipError) -> TranscacheError {
    TranscacheError::ArchiveFormat {
        path: path.to_path_buf(),
        source,
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!("Failed to sync directory {}: {}", dir.display(), e);
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Writable staging tree of one build
///
/// Removed when dropped, so a failed build leaves nothing behind but what
/// the next `stage` or `erase` would clean anyway.
#[derive(Debug)]
pub struct StagingRoot {
    path: PathBuf,
}

impl StagingRoot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subtree holding the artifacts of one unit
    pub fn unit_dir(&self, unit_id: &str) -> PathBuf {
        self.path.join(unit_id)
    }

    /// Subtree holding artifacts owned by no unit
    pub fn unassociated_dir(&self) -> PathBuf {
        self.path.join(UNASSOCIATED_DIR)
    }
}

impl Drop for StagingRoot {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove staging tree {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Read-only view of a finalized archive
///
/// Entries are addressed by unit id plus a `/`-separated relative path; the
/// unassociated subtree uses [`UNASSOCIATED_DIR`] as its unit id. The
/// archive never changes once finalized; the mutex only guards the zip
/// reader's seek position.
pub struct ArchiveFs {
    path: PathBuf,
    entries: BTreeSet<String>,
    reader: Mutex<ZipArchive<BufReader<File>>>,
}

impl fmt::Debug for ArchiveFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveFs")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ArchiveFs {
    fn open(path: &Path) -> TranscacheResult<Self> {
        let file = File::open(path).map_err(|e| TranscacheError::artifact_io(path, e))?;
        let mut archive =
            ZipArchive::new(BufReader::new(file)).map_err(|e| format_error(path, e))?;

        match archive.by_name(COMPLETION_MARKER) {
            Ok(mut marker) => {
                io::copy(&mut marker, &mut io::sink())
                    .map_err(|e| TranscacheError::artifact_io(path, e))?;
            }
            Err(ZipError::FileNotFound) => {
                return Err(TranscacheError::ArchiveIncomplete(path.to_path_buf()))
            }
            Err(e) => return Err(format_error(path, e)),
        }

        let entries = archive
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            reader: Mutex::new(archive),
        })
    }

    /// Path of the archive file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of file entries, including options and marker
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn unit_entry(unit: &str, rel: &str) -> String {
        format!("{}/{}", unit, rel.trim_start_matches('/'))
    }

    /// Whether a file exists under the given unit
    pub fn exists(&self, unit: &str, rel: &str) -> bool {
        self.entries.contains(&Self::unit_entry(unit, rel))
    }

    /// Read a file under the given unit
    pub fn read(&self, unit: &str, rel: &str) -> TranscacheResult<Option<Vec<u8>>> {
        self.read_entry(&Self::unit_entry(unit, rel))
    }

    /// Relative paths of every file stored for a unit, sorted
    pub fn list(&self, unit: &str) -> Vec<String> {
        let prefix = format!("{}/", unit);
        self.entries
            .iter()
            .filter_map(|name| name.strip_prefix(&prefix))
            .map(str::to_string)
            .collect()
    }

    /// Ids of the units with a subtree in the archive
    pub fn unit_ids(&self) -> Vec<String> {
        let ids: BTreeSet<&str> = self
            .entries
            .iter()
            .filter_map(|name| name.split_once('/').map(|(first, _)| first))
            .filter(|first| !first.starts_with(RESERVED_PREFIX))
            .collect();
        ids.into_iter().map(str::to_string).collect()
    }

    /// The persisted cache key set
    pub fn options(&self) -> TranscacheResult<CacheKeySet> {
        let bytes = self
            .read_entry(OPTIONS_FILE)?
            .ok_or_else(|| TranscacheError::CorruptOptions {
                line: 0,
                reason: format!("{} is missing", OPTIONS_FILE),
            })?;
        let text = String::from_utf8(bytes).map_err(|e| TranscacheError::CorruptOptions {
            line: 0,
            reason: e.to_string(),
        })?;
        CacheKeySet::parse_options(&text)
    }

    /// Access metadata recorded by the visibility patch, if any was written
    pub fn access_metadata(&self) -> TranscacheResult<Option<String>> {
        Ok(self
            .read_entry(ACCESS_METADATA_FILE)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn read_entry(&self, name: &str) -> TranscacheResult<Option<Vec<u8>>> {
        if !self.entries.contains(name) {
            return Ok(None);
        }

        let mut archive = self
            .reader
            .lock()
            .map_err(|_| TranscacheError::Internal("archive reader lock poisoned".to_string()))?;
        let mut file = archive
            .by_name(name)
            .map_err(|e| format_error(&self.path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| TranscacheError::artifact_io(self.path.join(name), e))?;
        Ok(Some(buf))
    }
}
