//! Identity store.
//!
//! Every tracked file and directory carries a small JSON blob (uuid, content
//! hash, content type, mtime at hash time) attached out-of-band: in an
//! extended attribute, or in a sidecar index keyed by device and inode on
//! filesystems without xattr support. The blob travels with the entry, so a
//! renamed entry keeps its uuid.
//!
//! Writes to one entry are read-modify-write sequences serialized by a lock
//! stripe keyed by inode. Hash updates are guarded by the caller's expected
//! uuid and fail with `EUUIDMISMATCH` instead of silently overwriting.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, IdentityBackend};
use crate::error::{EngineError, EngineResult};
use crate::fs_ops;
use crate::magic::ContentType;
use crate::model::{EntryKind, Fingerprint};

const STRIPES: usize = 64;

// errno values for filesystems that cannot hold identity blobs
const EROFS: i32 = 30;
const ENOTSUP: i32 = 95;

/// Backend holding opaque identity blobs.
pub trait AttrStore: Send + Sync {
    fn load(&self, path: &Path, metadata: &fs::Metadata) -> io::Result<Option<Vec<u8>>>;

    fn store(&self, path: &Path, metadata: &fs::Metadata, blob: &[u8]) -> io::Result<()>;

    /// Drop the blob of an entry that is about to be deleted. Only needed by
    /// backends whose keys outlive the entry.
    fn forget(&self, _path: &Path, _metadata: &fs::Metadata) -> io::Result<()> {
        Ok(())
    }

    /// True when blobs are keyed by inode rather than attached to the entry.
    fn keyed_by_inode(&self) -> bool {
        false
    }

    /// Persist buffered state, if any.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Blobs kept in an extended attribute on the entry itself.
pub struct XattrStore {
    name: OsString,
}

impl XattrStore {
    pub fn new(name: impl Into<OsString>) -> Self {
        XattrStore { name: name.into() }
    }
}

impl AttrStore for XattrStore {
    fn load(&self, path: &Path, _metadata: &fs::Metadata) -> io::Result<Option<Vec<u8>>> {
        xattr::get(path, &self.name)
    }

    fn store(&self, path: &Path, _metadata: &fs::Metadata, blob: &[u8]) -> io::Result<()> {
        xattr::set(path, &self.name, blob)
    }
}

#[derive(Serialize, Deserialize)]
struct SidecarRecord {
    dev: u64,
    ino: u64,
    blob: String,
}

/// Blobs kept in an index keyed by `(device, inode)`.
///
/// Renames keep the inode, so identities survive them. An inode reused after
/// deletion inherits the stale blob; the forest treats that as a new entry
/// only if the uuid is unknown to it.
pub struct SidecarStore {
    index: Mutex<HashMap<(u64, u64), String>>,
    path: Option<PathBuf>,
}

impl SidecarStore {
    /// In-memory index, lost on drop.
    pub fn in_memory() -> Self {
        SidecarStore {
            index: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Index persisted as JSON at `path` on flush.
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let mut index = HashMap::new();
        match fs::read(&path) {
            Ok(bytes) => {
                let records: Vec<SidecarRecord> = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                for r in records {
                    index.insert((r.dev, r.ino), r.blob);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        debug!("sidecar index {} loaded with {} records", path.display(), index.len());
        Ok(SidecarStore {
            index: Mutex::new(index),
            path: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(u64, u64), String>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AttrStore for SidecarStore {
    fn load(&self, _path: &Path, metadata: &fs::Metadata) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .get(&(metadata.dev(), metadata.ino()))
            .map(|blob| blob.as_bytes().to_vec()))
    }

    fn store(&self, _path: &Path, metadata: &fs::Metadata, blob: &[u8]) -> io::Result<()> {
        let blob = String::from_utf8(blob.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.lock().insert((metadata.dev(), metadata.ino()), blob);
        Ok(())
    }

    fn forget(&self, _path: &Path, metadata: &fs::Metadata) -> io::Result<()> {
        self.lock().remove(&(metadata.dev(), metadata.ino()));
        Ok(())
    }

    fn keyed_by_inode(&self) -> bool {
        true
    }

    fn flush(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records: Vec<SidecarRecord> = self
            .lock()
            .iter()
            .map(|(&(dev, ino), blob)| SidecarRecord {
                dev,
                ino,
                blob: blob.clone(),
            })
            .collect();
        let json = serde_json::to_vec(&records)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }
}

/// On-disk identity blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredIdentity {
    uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    magic: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    htime: Option<i64>,
}

impl StoredIdentity {
    fn fresh(uuid: Uuid) -> Self {
        StoredIdentity {
            uuid,
            hash: None,
            magic: None,
            htime: None,
        }
    }
}

/// Identity record of one entry, combined with its current `lstat`.
///
/// `hash`, `magic` and `hash_time` are only present while the stored hash
/// time equals the entry's current modification time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Xstat {
    pub uuid: Uuid,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
    pub hash: Option<Fingerprint>,
    pub magic: Option<ContentType>,
    pub hash_time: Option<i64>,
}

impl Xstat {
    fn build(path: &Path, metadata: &fs::Metadata, kind: EntryKind, stored: &StoredIdentity) -> Self {
        let mtime = fs_ops::mtime_nanos(metadata);
        let valid = kind == EntryKind::File && stored.htime == Some(mtime);
        Xstat {
            uuid: stored.uuid,
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            kind,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
            mtime,
            hash: if valid { stored.hash } else { None },
            magic: if valid { stored.magic } else { None },
            hash_time: if valid { stored.htime } else { None },
        }
    }
}

/// The identity store: reads, assigns and updates identity records.
pub struct IdentityStore {
    backend: Box<dyn AttrStore>,
    stripes: Vec<Mutex<()>>,
}

impl IdentityStore {
    pub fn new(backend: Box<dyn AttrStore>) -> Self {
        IdentityStore {
            backend,
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        let backend: Box<dyn AttrStore> = match config.identity {
            IdentityBackend::Xattr => Box::new(XattrStore::new(&config.xattr_name)),
            IdentityBackend::Sidecar => match &config.sidecar_path {
                Some(path) => Box::new(SidecarStore::open(path.clone()).map_err(|e| EngineError::io(path, e))?),
                None => Box::new(SidecarStore::in_memory()),
            },
        };
        Ok(Self::new(backend))
    }

    fn stripe(&self, metadata: &fs::Metadata) -> MutexGuard<'_, ()> {
        let slot = (metadata.ino() as usize) % self.stripes.len();
        self.stripes[slot].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stat(path: &Path) -> EngineResult<(fs::Metadata, EntryKind)> {
        let metadata = fs_ops::lstat(path)?;
        match fs_ops::entry_kind(&metadata) {
            Some(kind) => Ok((metadata, kind)),
            None => Err(EngineError::Unsupported {
                path: path.to_path_buf(),
            }),
        }
    }

    fn load(&self, path: &Path, metadata: &fs::Metadata) -> EngineResult<Option<StoredIdentity>> {
        let blob = match self.backend.load(path, metadata) {
            Ok(blob) => blob,
            Err(e) => return Err(EngineError::io(path, e)),
        };
        Ok(blob.and_then(|bytes| match serde_json::from_slice(&bytes) {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!("discarding malformed identity at {}: {}", path.display(), e);
                None
            }
        }))
    }

    fn save(&self, path: &Path, metadata: &fs::Metadata, stored: &StoredIdentity) -> EngineResult<()> {
        let blob = serde_json::to_vec(stored).map_err(|e| EngineError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        self.backend
            .store(path, metadata, &blob)
            .map_err(|e| match e.raw_os_error() {
                Some(EROFS) | Some(ENOTSUP) => EngineError::IdentityStoreUnwritable {
                    path: path.to_path_buf(),
                    source: e,
                },
                _ if e.kind() == io::ErrorKind::Unsupported => EngineError::IdentityStoreUnwritable {
                    path: path.to_path_buf(),
                    source: e,
                },
                _ => EngineError::io(path, e),
            })
    }

    /// Read the identity of an entry, assigning one on first observation.
    pub fn read(&self, path: &Path) -> EngineResult<Xstat> {
        self.force_assign(path, None)
    }

    /// Assign `uuid` (or a fresh one) unless the entry already has an identity.
    pub fn force_assign(&self, path: &Path, uuid: Option<Uuid>) -> EngineResult<Xstat> {
        let (metadata, kind) = Self::stat(path)?;
        let _guard = self.stripe(&metadata);
        let stored = match self.load(path, &metadata)? {
            Some(stored) => stored,
            None => {
                let stored = StoredIdentity::fresh(uuid.unwrap_or_else(Uuid::new_v4));
                self.save(path, &metadata, &stored)?;
                debug!("assigned {} to {}", stored.uuid, path.display());
                stored
            }
        };
        Ok(Xstat::build(path, &metadata, kind, &stored))
    }

    /// Record a content hash computed for the file at modification time
    /// `mtime_at_hash`.
    ///
    /// Fails with `EUUIDMISMATCH` when the entry no longer carries `uuid`,
    /// and with `ETIMESTAMP` when the file changed after it was hashed.
    pub fn update_hash(
        &self,
        path: &Path,
        uuid: Uuid,
        hash: Fingerprint,
        magic: Option<ContentType>,
        mtime_at_hash: i64,
    ) -> EngineResult<Xstat> {
        let (metadata, kind) = Self::stat(path)?;
        if kind != EntryKind::File {
            return Err(EngineError::NotAFile {
                path: path.to_path_buf(),
            });
        }
        let _guard = self.stripe(&metadata);
        let mut stored = match self.load(path, &metadata)? {
            Some(stored) => stored,
            None => {
                return Err(EngineError::UuidMismatch {
                    path: path.to_path_buf(),
                    expected: uuid,
                    actual: Uuid::nil(),
                })
            }
        };
        if stored.uuid != uuid {
            return Err(EngineError::UuidMismatch {
                path: path.to_path_buf(),
                expected: uuid,
                actual: stored.uuid,
            });
        }
        if fs_ops::mtime_nanos(&metadata) != mtime_at_hash {
            return Err(EngineError::TimestampMismatch {
                path: path.to_path_buf(),
            });
        }
        stored.hash = Some(hash);
        stored.magic = magic;
        stored.htime = Some(mtime_at_hash);
        self.save(path, &metadata, &stored)?;
        Ok(Xstat::build(path, &metadata, kind, &stored))
    }

    /// Forget the identities of an entry and everything below it ahead of
    /// deleting them, so a reused inode does not inherit them.
    pub fn forget(&self, path: &Path) -> EngineResult<()> {
        if !self.backend.keyed_by_inode() {
            return Ok(());
        }
        let metadata = match fs_ops::lstat(path) {
            Ok(metadata) => metadata,
            Err(EngineError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if metadata.is_dir() {
            for name in fs_ops::list_dir(path)? {
                self.forget(&path.join(name))?;
            }
        }
        let _guard = self.stripe(&metadata);
        self.backend
            .forget(path, &metadata)
            .map_err(|e| EngineError::io(path, e))
    }

    pub fn flush(&self) -> EngineResult<()> {
        self.backend.flush().map_err(|e| EngineError::io(PathBuf::new(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    fn sidecar() -> IdentityStore {
        IdentityStore::new(Box::new(SidecarStore::in_memory()))
    }

    fn xattrs_supported(path: &Path) -> bool {
        match xattr::set(path, "user.shelf_probe", b"1") {
            Ok(()) => {
                let _ = xattr::remove(path, "user.shelf_probe");
                true
            }
            Err(_) => false,
        }
    }

    #[test]
    fn test_read_assigns_once() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("hello");
        fs::write(&path, b"hello").unwrap();
        let store = sidecar();

        let first = store.read(&path).expect("Failed to read identity");
        let second = store.read(&path).expect("Failed to read identity");
        assert_eq!(first.uuid, second.uuid);
        assert_eq!(first.kind, EntryKind::File);
        assert_eq!(first.size, 5);
        assert_eq!(first.name, "hello");
        assert!(first.hash.is_none());
    }

    #[test]
    fn test_identity_survives_renames() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = sidecar();
        let mut path = temp_dir.path().join("a");
        fs::create_dir(&path).unwrap();
        let uuid = store.read(&path).unwrap().uuid;

        for name in ["b", "c", "d"] {
            let next = temp_dir.path().join(name);
            fs::rename(&path, &next).unwrap();
            path = next;
            assert_eq!(store.read(&path).unwrap().uuid, uuid);
        }
    }

    #[test]
    fn test_force_assign_never_overwrites() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        let store = sidecar();

        let wanted = Uuid::new_v4();
        assert_eq!(store.force_assign(&path, Some(wanted)).unwrap().uuid, wanted);
        let again = store.force_assign(&path, Some(Uuid::new_v4())).unwrap();
        assert_eq!(again.uuid, wanted);
    }

    #[test]
    fn test_update_hash_guarded_by_uuid() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        let store = sidecar();
        let xstat = store.read(&path).unwrap();
        let hash = Fingerprint([7; 32]);

        let err = store
            .update_hash(&path, Uuid::new_v4(), hash, None, xstat.mtime)
            .unwrap_err();
        assert_eq!(err.code(), "EUUIDMISMATCH");

        let updated = store
            .update_hash(&path, xstat.uuid, hash, Some(ContentType::Other), xstat.mtime)
            .expect("Failed to update hash");
        assert_eq!(updated.hash, Some(hash));
        assert_eq!(store.read(&path).unwrap().hash, Some(hash));
    }

    #[test]
    fn test_update_hash_rejects_stale_mtime() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        let store = sidecar();
        let xstat = store.read(&path).unwrap();

        let err = store
            .update_hash(&path, xstat.uuid, Fingerprint([1; 32]), None, xstat.mtime - 1)
            .unwrap_err();
        assert_eq!(err.code(), "ETIMESTAMP");
    }

    #[test]
    fn test_hash_invalidated_by_mtime_drift() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(1_500_000_000, 0)).unwrap();
        let store = sidecar();
        let xstat = store.read(&path).unwrap();
        store
            .update_hash(&path, xstat.uuid, Fingerprint([2; 32]), None, xstat.mtime)
            .unwrap();

        set_file_mtime(&path, FileTime::from_unix_time(1_500_000_100, 0)).unwrap();
        let drifted = store.read(&path).unwrap();
        assert_eq!(drifted.uuid, xstat.uuid);
        assert!(drifted.hash.is_none());
        assert!(drifted.hash_time.is_none());

        // drift is lazy: restoring the mtime revives the record
        set_file_mtime(&path, FileTime::from_unix_time(1_500_000_000, 0)).unwrap();
        assert_eq!(store.read(&path).unwrap().hash, Some(Fingerprint([2; 32])));
    }

    #[test]
    fn test_unsupported_and_missing_entries() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = sidecar();
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink("/nowhere", &link).unwrap();

        assert_eq!(store.read(&link).unwrap_err().code(), "EUNSUPPORTED");
        assert_eq!(store.read(&temp_dir.path().join("gone")).unwrap_err().code(), "ENOENT");
    }

    #[test]
    fn test_update_hash_rejects_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = sidecar();
        let xstat = store.read(temp_dir.path()).unwrap();
        let err = store
            .update_hash(temp_dir.path(), xstat.uuid, Fingerprint([0; 32]), None, xstat.mtime)
            .unwrap_err();
        assert_eq!(err.code(), "ENOTFILE");
    }

    #[test]
    fn test_forget_drops_sidecar_records() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = sidecar();
        let dir = temp_dir.path().join("d");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("f"), b"x").unwrap();
        let dir_uuid = store.read(&dir).unwrap().uuid;
        let file_uuid = store.read(&dir.join("f")).unwrap().uuid;

        store.forget(&dir).expect("Failed to forget");
        assert_ne!(store.read(&dir).unwrap().uuid, dir_uuid);
        assert_ne!(store.read(&dir.join("f")).unwrap().uuid, file_uuid);
        store.forget(&temp_dir.path().join("gone")).expect("missing entries are fine");
    }

    #[test]
    fn test_sidecar_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let index = temp_dir.path().join("sidecar.json");
        let path = temp_dir.path().join("f");
        fs::write(&path, b"x").unwrap();

        let store = IdentityStore::new(Box::new(SidecarStore::open(index.clone()).unwrap()));
        let uuid = store.read(&path).unwrap().uuid;
        store.flush().expect("Failed to flush");

        let reopened = IdentityStore::new(Box::new(SidecarStore::open(index).unwrap()));
        assert_eq!(reopened.read(&path).unwrap().uuid, uuid);
    }

    #[test]
    fn test_xattr_backend_round_trip() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        if !xattrs_supported(&path) {
            eprintln!("xattrs unsupported here, skipping");
            return;
        }

        let store = IdentityStore::new(Box::new(XattrStore::new("user.shelf")));
        let uuid = store.read(&path).unwrap().uuid;
        let raw = xattr::get(&path, "user.shelf").unwrap().expect("blob should be stored");
        let stored: StoredIdentity = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored.uuid, uuid);

        let moved = temp_dir.path().join("g");
        fs::rename(&path, &moved).unwrap();
        assert_eq!(store.read(&moved).unwrap().uuid, uuid);
    }
}
