//! Fingerprint engine.
//!
//! A fingerprint is computed by cutting the file into fixed-size segments
//! at absolute offsets, hashing each segment with SHA-256 on the hashing
//! pool, and folding the ordered segment digests left to right with
//! `combine(a, b) = SHA-256(a || b)`. A single segment's digest is the
//! fingerprint itself, so files no larger than one segment fingerprint to
//! their plain SHA-256.
//!
//! The file is stat'ed before and after hashing; if its modification time or
//! size moved, the result is discarded with `ECHANGED`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::unbounded;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::fs_ops;
use crate::model::{EntryKind, Fingerprint};
use crate::pool::WorkerPool;

/// SHA-256 of no bytes.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

const READ_BUFFER: usize = 64 * 1024;

/// One unit of hashing work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentJob {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// A fingerprint together with the stat it was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprinted {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub mtime: i64,
}

/// SHA-256 of `length` bytes starting at `offset`.
pub fn hash_segment(job: &SegmentJob) -> io::Result<Fingerprint> {
    let mut file = File::open(&job.path)?;
    file.seek(SeekFrom::Start(job.offset))?;
    let mut reader = file.take(job.length);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut remaining = job.length;
    while remaining > 0 {
        let n = match reader.read(&mut buffer) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while hashing",
                ))
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }
    Ok(finish(hasher))
}

fn finish(hasher: Sha256) -> Fingerprint {
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Fingerprint(out)
}

/// Two-input combiner used by the fold.
pub fn combine(left: &Fingerprint, right: &Fingerprint) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    finish(hasher)
}

/// Left fold of ordered segment digests; `None` for an empty list.
pub fn fold(digests: &[Fingerprint]) -> Option<Fingerprint> {
    let (first, rest) = digests.split_first()?;
    Some(rest.iter().fold(*first, |acc, d| combine(&acc, d)))
}

/// Contiguous `(offset, length)` segments covering `[0, size)`.
pub fn segments(size: u64, segment_size: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < size {
        let length = segment_size.min(size - offset);
        out.push((offset, length));
        offset += length;
    }
    out
}

pub struct Fingerprinter {
    segment_size: u64,
    pool: WorkerPool<SegmentJob, io::Result<Fingerprint>>,
}

impl Fingerprinter {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        Self::with_hasher(config.segment_size, config.hash_workers, hash_segment)
    }

    /// Build a fingerprinter with a custom segment hasher.
    pub fn with_hasher<F>(segment_size: u64, workers: usize, hasher: F) -> EngineResult<Self>
    where
        F: Fn(&SegmentJob) -> io::Result<Fingerprint> + Send + Sync + 'static,
    {
        if segment_size == 0 {
            return Err(EngineError::Config {
                message: "segment_size must be positive".to_string(),
            });
        }
        let hasher = Arc::new(hasher);
        let pool = WorkerPool::new("hash", workers, move |job: SegmentJob| hasher(&job))?;
        Ok(Fingerprinter { segment_size, pool })
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn fingerprint(&self, path: &Path) -> EngineResult<Fingerprint> {
        Ok(self.fingerprint_stat(path)?.fingerprint)
    }

    /// Fingerprint a file and report the stat the digest corresponds to.
    pub fn fingerprint_stat(&self, path: &Path) -> EngineResult<Fingerprinted> {
        let before = fs_ops::lstat(path)?;
        match fs_ops::entry_kind(&before) {
            Some(EntryKind::File) => {}
            Some(EntryKind::Directory) => {
                return Err(EngineError::NotAFile {
                    path: path.to_path_buf(),
                })
            }
            None => {
                return Err(EngineError::Unsupported {
                    path: path.to_path_buf(),
                })
            }
        }
        let size = before.len();
        let mtime = fs_ops::mtime_nanos(&before);
        if size == 0 {
            return Ok(Fingerprinted {
                fingerprint: EMPTY_FINGERPRINT,
                size,
                mtime,
            });
        }

        let parts = segments(size, self.segment_size);
        debug!("fingerprinting {} ({} bytes, {} segments)", path.display(), size, parts.len());

        let (tx, rx) = unbounded();
        let mut order = HashMap::with_capacity(parts.len());
        for (index, &(offset, length)) in parts.iter().enumerate() {
            let job = SegmentJob {
                path: path.to_path_buf(),
                offset,
                length,
            };
            order.insert(self.pool.submit(job, &tx)?, index);
        }

        let mut digests: Vec<Option<Fingerprint>> = vec![None; parts.len()];
        for _ in 0..parts.len() {
            let done = rx.recv().map_err(|_| EngineError::Worker {
                message: "hash pool stopped replying".to_string(),
            })?;
            let Some(&index) = order.get(&done.ticket) else {
                continue;
            };
            match done.result {
                Ok(Ok(digest)) => digests[index] = Some(digest),
                Ok(Err(e)) => return Err(EngineError::io(path, e)),
                Err(failure) => {
                    return Err(EngineError::Io {
                        path: path.to_path_buf(),
                        source: io::Error::new(io::ErrorKind::Other, failure.message),
                    })
                }
            }
        }

        let after = fs_ops::lstat(path)?;
        if fs_ops::mtime_nanos(&after) != mtime || after.len() != size {
            warn!("{} changed while it was fingerprinted", path.display());
            return Err(EngineError::ContentChanged {
                path: path.to_path_buf(),
            });
        }

        let ordered: Vec<Fingerprint> = digests.into_iter().flatten().collect();
        let fingerprint = fold(&ordered).ok_or_else(|| EngineError::Worker {
            message: "no segment digests".to_string(),
        })?;
        Ok(Fingerprinted {
            fingerprint,
            size,
            mtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use std::time::Duration;

    fn sha(bytes: &[u8]) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        finish(hasher)
    }

    fn small(segment_size: u64) -> Fingerprinter {
        Fingerprinter::with_hasher(segment_size, 4, hash_segment).unwrap()
    }

    #[test]
    fn test_empty_file_yields_empty_digest() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("empty");
        fs::write(&path, b"").unwrap();

        assert_eq!(small(4).fingerprint(&path).unwrap(), EMPTY_FINGERPRINT);
        assert_eq!(EMPTY_FINGERPRINT, sha(b""));
    }

    #[test]
    fn test_single_segment_is_plain_sha256() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("hello");
        fs::write(&path, b"hello").unwrap();

        let fp = small(1024).fingerprint(&path).unwrap();
        assert_eq!(
            fp.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_segments_fold_left_to_right() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("letters");
        fs::write(&path, b"abcdefghij").unwrap();

        let expected = combine(&combine(&sha(b"abcd"), &sha(b"efgh")), &sha(b"ij"));
        assert_eq!(small(4).fingerprint(&path).unwrap(), expected);
    }

    #[test]
    fn test_deterministic_across_calls() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data");
        fs::write(&path, vec![42u8; 1000]).unwrap();

        let engine = small(64);
        let first = engine.fingerprint(&path).unwrap();
        for _ in 0..3 {
            assert_eq!(engine.fingerprint(&path).unwrap(), first);
        }
    }

    #[test]
    fn test_segment_boundary() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let exact = temp_dir.path().join("exact");
        let plus_one = temp_dir.path().join("plus_one");
        fs::write(&exact, b"wxyz").unwrap();
        fs::write(&plus_one, b"wxyz!").unwrap();

        let engine = small(4);
        let a = engine.fingerprint(&exact).unwrap();
        let b = engine.fingerprint(&plus_one).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, sha(b"wxyz"));
        assert_eq!(b, combine(&sha(b"wxyz"), &sha(b"!")));
    }

    #[test]
    fn test_order_independent_of_completion() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("slow");
        fs::write(&path, b"0123456789abcdef").unwrap();

        // earlier segments finish last
        let engine = Fingerprinter::with_hasher(4, 4, |job: &SegmentJob| {
            thread::sleep(Duration::from_millis(40 - job.offset * 2));
            hash_segment(job)
        })
        .unwrap();
        assert_eq!(engine.fingerprint(&path).unwrap(), small(4).fingerprint(&path).unwrap());
    }

    #[test]
    fn test_mutation_during_hash_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("moving");
        fs::write(&path, b"0123456789").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_000_000_000, 0)).unwrap();

        let engine = Fingerprinter::with_hasher(4, 2, |job: &SegmentJob| {
            if job.offset == 0 {
                filetime::set_file_mtime(&job.path, filetime::FileTime::from_unix_time(1_000_000_500, 0))?;
            }
            hash_segment(job)
        })
        .unwrap();

        let err = engine.fingerprint(&path).unwrap_err();
        assert_eq!(err.code(), "ECHANGED");
    }

    #[test]
    fn test_segment_failure_fails_whole_operation() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("bad");
        fs::write(&path, b"0123456789").unwrap();

        let failing = Fingerprinter::with_hasher(4, 2, |job: &SegmentJob| {
            if job.offset == 4 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk error"));
            }
            hash_segment(job)
        })
        .unwrap();
        assert_eq!(failing.fingerprint(&path).unwrap_err().code(), "EIO");

        let panicking = Fingerprinter::with_hasher(4, 2, |job: &SegmentJob| {
            if job.offset == 8 {
                panic!("segment worker crashed");
            }
            hash_segment(job)
        })
        .unwrap();
        assert_eq!(panicking.fingerprint(&path).unwrap_err().code(), "EIO");
        // pool survives the crash
        fs::write(&path, b"0123").unwrap();
        assert_eq!(panicking.fingerprint(&path).unwrap(), sha(b"0123"));
    }

    #[test]
    fn test_rejects_directories_and_symlinks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = small(4);
        assert_eq!(engine.fingerprint(temp_dir.path()).unwrap_err().code(), "ENOTFILE");

        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(temp_dir.path(), &link).unwrap();
        assert_eq!(engine.fingerprint(&link).unwrap_err().code(), "EUNSUPPORTED");
    }

    #[test]
    fn test_segments_partition() {
        assert_eq!(segments(0, 4), vec![]);
        assert_eq!(segments(4, 4), vec![(0, 4)]);
        assert_eq!(segments(9, 4), vec![(0, 4), (4, 4), (8, 1)]);
        assert_eq!(fold(&[]), None);
    }
}
