//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Classifying entries and reading modification times
//! - Listing directories
//! - Copying files with verification and metadata preservation
//! - Publishing copies without replacing existing entries

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::warn;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::EntryKind;

const COPY_BUFFER: usize = 64 * 1024;

/// Prefix of in-flight copies inside a destination directory.
pub const TEMP_PREFIX: &str = ".shelf-tmp-";

/// Modification time in nanoseconds since the Unix epoch.
pub fn mtime_nanos(metadata: &fs::Metadata) -> i64 {
    match metadata.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            Err(e) => -(e.duration().as_nanos() as i64),
        },
        Err(_) => 0,
    }
}

/// Kind of a supported entry; `None` for symlinks, devices, sockets and FIFOs.
pub fn entry_kind(metadata: &fs::Metadata) -> Option<EntryKind> {
    let ft = metadata.file_type();
    if ft.is_dir() {
        Some(EntryKind::Directory)
    } else if ft.is_file() {
        Some(EntryKind::File)
    } else {
        None
    }
}

/// `lstat` with error classification.
pub fn lstat(path: &Path) -> EngineResult<fs::Metadata> {
    fs::symlink_metadata(path).map_err(|e| EngineError::io(path, e))
}

/// Whether `path` is `ancestor` or lies beneath it, comparing resolved
/// paths. A missing `ancestor` contains nothing.
pub fn is_within(path: &Path, ancestor: &Path) -> EngineResult<bool> {
    let ancestor = match fs::canonicalize(ancestor) {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(EngineError::io(ancestor, e)),
    };
    let path = fs::canonicalize(path).map_err(|e| EngineError::io(path, e))?;
    Ok(path.starts_with(ancestor))
}

/// List the names in a directory, skipping in-flight copies and names that
/// are not valid UTF-8.
pub fn list_dir(path: &Path) -> EngineResult<Vec<String>> {
    let entries = fs::read_dir(path).map_err(|e| EngineError::io(path, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io(path, e))?;
        match entry.file_name().into_string() {
            Ok(name) if name.starts_with(TEMP_PREFIX) => {}
            Ok(name) => names.push(name),
            Err(raw) => warn!("skipping non UTF-8 name {:?} in {}", raw, path.display()),
        }
    }
    names.sort();
    Ok(names)
}

/// Name for a copy that has not been published yet.
pub fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()))
}

/// Result of a verified copy.
#[derive(Debug, Clone, Copy)]
pub struct CopyReport {
    pub bytes: u64,
    pub digest: blake3::Hash,
}

/// Copy a file from `src` to a new file `dst`, hashing the stream.
///
/// The destination must not exist. Modification time is preserved. When
/// `verify` is set the written file is read back and its hash compared with
/// the hash of the bytes read from the source.
pub fn copy_file_verified(
    src: &Path,
    dst: &Path,
    verify: bool,
    mut on_progress: impl FnMut(u64),
) -> EngineResult<CopyReport> {
    let mut src_file = fs::File::open(src).map_err(|e| EngineError::io(src, e))?;
    let src_mtime = src_file
        .metadata()
        .map_err(|e| EngineError::io(src, e))?
        .modified()
        .ok();

    let mut dst_file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(|e| EngineError::io(dst, e))?;

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut bytes = 0u64;
    loop {
        let n = match src_file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EngineError::io(src, e)),
        };
        hasher.update(&buffer[..n]);
        dst_file
            .write_all(&buffer[..n])
            .map_err(|e| EngineError::io(dst, e))?;
        bytes += n as u64;
        on_progress(bytes);
    }
    dst_file.sync_all().map_err(|e| EngineError::io(dst, e))?;
    drop(dst_file);

    if let Some(mtime) = src_mtime {
        filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime))
            .map_err(|e| EngineError::io(dst, e))?;
    }

    let digest = hasher.finalize();
    if verify && hash_file(dst)? != digest {
        return Err(EngineError::VerificationFailed {
            path: dst.to_path_buf(),
        });
    }

    Ok(CopyReport { bytes, digest })
}

/// BLAKE3 of a whole file.
pub fn hash_file(path: &Path) -> EngineResult<blake3::Hash> {
    let mut file = fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buffer[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EngineError::io(path, e)),
        }
    }
    Ok(hasher.finalize())
}

/// Give `tmp` the name `target` unless `target` already exists.
///
/// Uses a hard link, which fails atomically on an existing name, then drops
/// the temporary name. On failure `tmp` is left in place.
pub fn publish_no_replace(tmp: &Path, target: &Path) -> EngineResult<()> {
    fs::hard_link(tmp, target).map_err(|e| EngineError::io(target, e))?;
    if let Err(e) = fs::remove_file(tmp) {
        warn!("failed to drop temporary {}: {}", tmp.display(), e);
    }
    Ok(())
}

/// Remove a file or a whole directory tree.
pub fn remove_entry(path: &Path, kind: EntryKind) -> EngineResult<()> {
    let result = match kind {
        EntryKind::Directory => fs::remove_dir_all(path),
        EntryKind::File => fs::remove_file(path),
    };
    result.map_err(|e| EngineError::io(path, e))
}

/// Remove a temporary copy, logging instead of failing.
pub fn discard_temp(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("failed to remove temporary {}: {}", tmp.display(), e);
        }
    }
}
