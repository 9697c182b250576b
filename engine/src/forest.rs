//! Forest: in-memory tree of every tracked drive.
//!
//! Nodes live in a generational arena; a `NodeId` whose slot has been freed
//! never resolves again, even after the slot is reused. Each directory runs
//! a small scan state machine:
//!
//! ```text
//! Init ──► Reading ──► Idle ──► Reading ...
//!             │
//!             └──► Failed (subtree destroyed)
//! ```
//!
//! Scans run on the scan pool and report back to the coordinator, which
//! reconciles the listing against the current children by uuid. At most one
//! scan per directory is in flight; requests that arrive meanwhile set a
//! single rescan flag. An entry whose uuid the forest already holds in
//! another directory is moved only after a pool worker confirms the old
//! location no longer carries that identity.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::fs_ops;
use crate::magic::ContentType;
use crate::model::{EntryKind, Fingerprint, TreeEntry};
use crate::pool::{Completion, WorkerFailure, WorkerPool};
use crate::xstat::{IdentityStore, Xstat};

/// Handle to a node in the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Scan state of a directory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirState {
    /// Never scanned
    Init,
    /// A scan is in flight; `rescan` is set when another was requested meanwhile
    Reading { attempt: u32, rescan: bool },
    Idle,
    /// Last scan failed with the given error code
    Failed { code: &'static str },
}

#[derive(Debug)]
struct DirData {
    children: Vec<NodeId>,
    /// Directory mtime the children reflect; `None` when unknown
    mtime: Option<i64>,
    state: DirState,
}

impl DirData {
    fn new() -> Self {
        DirData {
            children: Vec::new(),
            mtime: None,
            state: DirState::Init,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub size: u64,
    pub mtime: i64,
    pub hash: Option<Fingerprint>,
    pub magic: Option<ContentType>,
}

#[derive(Debug)]
enum Body {
    Directory(DirData),
    File(FileData),
}

#[derive(Debug)]
pub struct Node {
    uuid: Uuid,
    name: String,
    parent: Option<NodeId>,
    body: Body,
}

impl Node {
    fn from_xstat(entry: &Xstat, parent: NodeId) -> Self {
        let body = match entry.kind {
            EntryKind::Directory => Body::Directory(DirData::new()),
            EntryKind::File => Body::File(FileData {
                size: entry.size,
                mtime: entry.mtime,
                hash: entry.hash,
                magic: entry.magic,
            }),
        };
        Node {
            uuid: entry.uuid,
            name: entry.name.clone(),
            parent: Some(parent),
            body,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` for drive roots.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn kind(&self) -> EntryKind {
        match self.body {
            Body::Directory(_) => EntryKind::Directory,
            Body::File(_) => EntryKind::File,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.body {
            Body::Directory(dir) => &dir.children,
            Body::File(_) => &[],
        }
    }

    pub fn dir_state(&self) -> Option<&DirState> {
        match &self.body {
            Body::Directory(dir) => Some(&dir.state),
            Body::File(_) => None,
        }
    }

    /// Recorded mtime of a directory, or the mtime of a file.
    pub fn mtime(&self) -> Option<i64> {
        match &self.body {
            Body::Directory(dir) => dir.mtime,
            Body::File(file) => Some(file.mtime),
        }
    }

    pub fn file(&self) -> Option<&FileData> {
        match &self.body {
            Body::File(file) => Some(file),
            Body::Directory(_) => None,
        }
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Result of listing one directory on a scan worker.
#[derive(Debug, Clone)]
pub struct Listing {
    /// Identity of the directory itself, stat'ed before listing
    pub dir: Xstat,
    pub entries: Vec<Xstat>,
    /// Directory mtime after listing
    pub mtime_after: i64,
}

/// List a directory and read (or assign) the identity of every entry.
///
/// Symlinks and special files are left out, as are entries that vanish
/// between the listing and the stat.
pub fn scan_directory(store: &IdentityStore, path: &Path) -> EngineResult<Listing> {
    let dir = store.read(path)?;
    if dir.kind != EntryKind::Directory {
        return Err(EngineError::NotADirectory {
            path: path.to_path_buf(),
        });
    }
    let names = fs_ops::list_dir(path)?;
    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let child = path.join(&name);
        match store.read(&child) {
            Ok(xstat) => entries.push(xstat),
            Err(EngineError::Unsupported { .. }) => trace!("ignoring {}", child.display()),
            Err(EngineError::NotFound { .. }) => trace!("{} vanished during listing", child.display()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("skipping {}: {}", child.display(), e),
        }
    }
    let after = fs_ops::lstat(path)?;
    Ok(Listing {
        dir,
        entries,
        mtime_after: fs_ops::mtime_nanos(&after),
    })
}

enum ScanJob {
    List { path: PathBuf, delay: Duration },
    /// Which of these paths still carry the given identity
    Holders(Vec<(Uuid, PathBuf)>),
}

pub type ScanResult = EngineResult<Listing>;

enum ScanReply {
    Listing(ScanResult),
    Holders(Vec<bool>),
}

/// Pool work the coordinator is waiting on.
enum InFlight {
    Scan(NodeId),
    /// Entries listed under `parent` that the forest holds elsewhere
    Moves { parent: NodeId, moves: Vec<Move> },
}

struct Move {
    from: PathBuf,
    entry: Xstat,
}

fn holds(store: &IdentityStore, path: &Path, uuid: Uuid) -> bool {
    matches!(store.read(path), Ok(xstat) if xstat.uuid == uuid)
}

/// Counters for scan activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub dispatched: u64,
    pub retries: u64,
    pub failures: u64,
}

/// A file still lacking a valid fingerprint.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub node: NodeId,
    pub uuid: Uuid,
    pub path: PathBuf,
    pub mtime: i64,
}

/// A fingerprinted file.
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub uuid: Uuid,
    pub hash: Fingerprint,
    pub magic: Option<ContentType>,
    pub path: PathBuf,
}

pub struct Forest {
    root: PathBuf,
    store: Arc<IdentityStore>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    drives: HashMap<Uuid, NodeId>,
    by_uuid: HashMap<Uuid, NodeId>,
    pool: WorkerPool<ScanJob, ScanReply>,
    reply_tx: Sender<Completion<ScanReply>>,
    reply_rx: Receiver<Completion<ScanReply>>,
    in_flight: HashMap<u64, InFlight>,
    retry_limit: u32,
    backoff: Duration,
    stats: ScanStats,
}

impl Forest {
    pub fn new(config: &EngineConfig, store: Arc<IdentityStore>) -> EngineResult<Self> {
        Self::with_scanner(config, store, scan_directory)
    }

    /// Build a forest whose scan workers list directories with `scanner`.
    pub fn with_scanner<F>(config: &EngineConfig, store: Arc<IdentityStore>, scanner: F) -> EngineResult<Self>
    where
        F: Fn(&IdentityStore, &Path) -> ScanResult + Send + Sync + 'static,
    {
        let worker_store = Arc::clone(&store);
        let pool = WorkerPool::new("scan", config.scan_workers, move |job: ScanJob| match job {
            ScanJob::List { path, delay } => {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                ScanReply::Listing(scanner(&worker_store, &path))
            }
            ScanJob::Holders(paths) => ScanReply::Holders(
                paths
                    .iter()
                    .map(|(uuid, path)| holds(&worker_store, path, *uuid))
                    .collect(),
            ),
        })?;
        let (reply_tx, reply_rx) = unbounded();
        Ok(Forest {
            root: config.root.clone(),
            store,
            slots: Vec::new(),
            free: Vec::new(),
            drives: HashMap::new(),
            by_uuid: HashMap::new(),
            pool,
            reply_tx,
            reply_rx,
            in_flight: HashMap::new(),
            retry_limit: config.scan_retry_limit.max(1),
            backoff: Duration::from_millis(config.scan_backoff_ms),
            stats: ScanStats::default(),
        })
    }

    // ---- arena ----

    fn alloc(&mut self, node: Node) -> NodeId {
        let uuid = node.uuid;
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId { index, generation: 0 }
            }
        };
        self.by_uuid.insert(uuid, id);
        id
    }

    fn take(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        if self.by_uuid.get(&node.uuid) == Some(&id) {
            self.by_uuid.remove(&node.uuid);
        }
        Some(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn dir(&self, id: NodeId) -> Option<&DirData> {
        match &self.get(id)?.body {
            Body::Directory(dir) => Some(dir),
            Body::File(_) => None,
        }
    }

    fn dir_mut(&mut self, id: NodeId) -> Option<&mut DirData> {
        match &mut self.get_mut(id)?.body {
            Body::Directory(dir) => Some(dir),
            Body::File(_) => None,
        }
    }

    fn live(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    NodeId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }

    /// Number of live nodes across all drives.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy a node and its whole subtree. The parent's child list is left
    /// to the caller.
    fn destroy(&mut self, id: NodeId) {
        let mut stack = vec![id];
        let mut count = 0usize;
        while let Some(next) = stack.pop() {
            let Some(node) = self.take(next) else {
                continue;
            };
            if let Body::Directory(dir) = node.body {
                stack.extend(dir.children);
            }
            count += 1;
        }
        if count > 0 {
            debug!("destroyed {} nodes", count);
        }
    }

    fn destroy_children(&mut self, id: NodeId) {
        let children = match self.dir_mut(id) {
            Some(dir) => std::mem::take(&mut dir.children),
            None => return,
        };
        for child in children {
            self.destroy(child);
        }
    }

    // ---- drives and paths ----

    pub fn drive_path(&self, drive: Uuid) -> PathBuf {
        self.root.join("drives").join(drive.to_string())
    }

    /// Mount a drive, creating `<root>/drives/<uuid>` when needed, and
    /// schedule its first scan.
    pub fn create_root(&mut self, drive: Uuid) -> EngineResult<NodeId> {
        if let Some(&id) = self.drives.get(&drive) {
            return Ok(id);
        }
        let path = self.drive_path(drive);
        fs::create_dir_all(&path).map_err(|e| EngineError::io(&path, e))?;
        let xstat = self.store.force_assign(&path, Some(drive))?;
        if xstat.kind != EntryKind::Directory {
            return Err(EngineError::NotADirectory { path });
        }
        if xstat.uuid != drive {
            return Err(EngineError::UuidMismatch {
                path,
                expected: drive,
                actual: xstat.uuid,
            });
        }
        let id = self.alloc(Node {
            uuid: drive,
            name: drive.to_string(),
            parent: None,
            body: Body::Directory(DirData::new()),
        });
        self.drives.insert(drive, id);
        info!("mounted drive {} at {}", drive, path.display());
        self.request_scan(id)?;
        Ok(id)
    }

    pub fn remove_root(&mut self, drive: Uuid) -> EngineResult<()> {
        let id = self
            .drives
            .remove(&drive)
            .ok_or(EngineError::DriveNotFound { drive })?;
        self.destroy(id);
        info!("unmounted drive {}", drive);
        Ok(())
    }

    pub fn root_of(&self, drive: Uuid) -> Option<NodeId> {
        self.drives.get(&drive).copied()
    }

    pub fn drives(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.drives.keys().copied()
    }

    pub fn find_by_uuid(&self, uuid: Uuid) -> Option<NodeId> {
        self.by_uuid.get(&uuid).copied()
    }

    /// Drive the node belongs to.
    pub fn drive_of(&self, id: NodeId) -> Option<Uuid> {
        let mut cur = id;
        loop {
            let node = self.get(cur)?;
            match node.parent {
                Some(parent) => cur = parent,
                None => return Some(node.uuid),
            }
        }
    }

    pub fn abs_path(&self, id: NodeId) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut cur = id;
        loop {
            let node = self.get(cur)?;
            match node.parent {
                Some(parent) => {
                    names.push(node.name.as_str());
                    cur = parent;
                }
                None => {
                    let mut path = self.drive_path(node.uuid);
                    path.extend(names.iter().rev());
                    return Some(path);
                }
            }
        }
    }

    /// Absolute path of directory `dir` on `drive`.
    pub fn resolve_dir(&self, drive: Uuid, dir: Uuid) -> EngineResult<PathBuf> {
        if !self.drives.contains_key(&drive) {
            return Err(EngineError::DriveNotFound { drive });
        }
        let id = self
            .find_by_uuid(dir)
            .filter(|&id| self.drive_of(id) == Some(drive))
            .ok_or(EngineError::NodeNotFound { uuid: dir })?;
        let path = self.abs_path(id).ok_or(EngineError::NodeNotFound { uuid: dir })?;
        if self.dir(id).is_none() {
            return Err(EngineError::NotADirectory { path });
        }
        Ok(path)
    }

    pub fn child_named(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.get(dir)?
            .children()
            .iter()
            .copied()
            .find(|&c| self.get(c).map_or(false, |n| n.name == name))
    }

    /// Node at a path relative to the drive root.
    pub fn lookup(&self, drive: Uuid, rel: &Path) -> Option<NodeId> {
        let mut cur = self.root_of(drive)?;
        for component in rel.components() {
            match component {
                Component::Normal(name) => cur = self.child_named(cur, name.to_str()?)?,
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(cur)
    }

    fn is_ancestor(&self, ancestor: NodeId, of: NodeId) -> bool {
        let mut cur = Some(of);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.get(id).and_then(|n| n.parent);
        }
        false
    }

    /// Detached snapshot of a drive.
    pub fn get_tree(&self, drive: Uuid) -> EngineResult<TreeEntry> {
        let id = self.root_of(drive).ok_or(EngineError::DriveNotFound { drive })?;
        self.snapshot(id).ok_or(EngineError::DriveNotFound { drive })
    }

    pub fn snapshot(&self, id: NodeId) -> Option<TreeEntry> {
        let node = self.get(id)?;
        let entry = match &node.body {
            Body::Directory(dir) => {
                let children = dir.children.iter().filter_map(|&c| self.snapshot(c)).collect();
                let mut entry = TreeEntry::directory(node.uuid, node.name.clone(), children);
                entry.mtime = dir.mtime;
                entry
            }
            Body::File(file) => {
                let mut entry = TreeEntry::file(node.uuid, node.name.clone(), file.size);
                entry.mtime = Some(file.mtime);
                entry.hash = file.hash;
                entry.magic = file.magic;
                entry
            }
        };
        Some(entry)
    }

    // ---- scanning ----

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Ask for a directory to be (re)read. Coalesces with a scan in flight.
    pub fn request_scan(&mut self, id: NodeId) -> EngineResult<()> {
        let Some(dir) = self.dir_mut(id) else {
            trace!("scan requested for a node that is gone or not a directory");
            return Ok(());
        };
        if let DirState::Reading { rescan, .. } = &mut dir.state {
            *rescan = true;
            return Ok(());
        }
        self.dispatch(id, 0)
    }

    fn dispatch(&mut self, id: NodeId, attempt: u32) -> EngineResult<()> {
        let Some(path) = self.abs_path(id) else {
            return Ok(());
        };
        let delay = self.backoff * attempt;
        trace!("scanning {} (attempt {})", path.display(), attempt);
        let ticket = self.pool.submit(ScanJob::List { path, delay }, &self.reply_tx)?;
        self.in_flight.insert(ticket, InFlight::Scan(id));
        if let Some(dir) = self.dir_mut(id) {
            dir.state = DirState::Reading {
                attempt,
                rescan: false,
            };
        }
        self.stats.dispatched += 1;
        Ok(())
    }

    /// Rescan the directory if its mtime no longer matches the recorded one.
    pub fn check_stale(&mut self, id: NodeId) -> EngineResult<bool> {
        let recorded = match self.dir(id) {
            Some(dir) if dir.state == DirState::Idle => dir.mtime,
            _ => return Ok(false),
        };
        let Some(path) = self.abs_path(id) else {
            return Ok(false);
        };
        let current = fs_ops::lstat(&path).ok().map(|m| fs_ops::mtime_nanos(&m));
        if current.is_some() && current == recorded {
            return Ok(false);
        }
        debug!("{} is stale", path.display());
        self.request_scan(id)?;
        Ok(true)
    }

    /// Run `check_stale` on every idle directory; returns how many were rescheduled.
    pub fn check_stale_all(&mut self) -> EngineResult<usize> {
        let dirs: Vec<NodeId> = self
            .live()
            .filter(|(_, node)| node.dir_state() == Some(&DirState::Idle))
            .map(|(id, _)| id)
            .collect();
        let mut count = 0;
        for id in dirs {
            if self.check_stale(id)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Apply the scan results that have already arrived.
    pub fn poll(&mut self) -> EngineResult<usize> {
        let mut applied = 0;
        loop {
            match self.reply_rx.try_recv() {
                Ok(done) => {
                    self.apply(done)?;
                    applied += 1;
                }
                Err(TryRecvError::Empty) => return Ok(applied),
                Err(TryRecvError::Disconnected) => {
                    return Err(EngineError::Worker {
                        message: "scan pool stopped replying".to_string(),
                    })
                }
            }
        }
    }

    /// Block until no scan is in flight, applying results as they arrive.
    pub fn settle(&mut self) -> EngineResult<()> {
        while !self.in_flight.is_empty() {
            let done = self.reply_rx.recv().map_err(|_| EngineError::Worker {
                message: "scan pool stopped replying".to_string(),
            })?;
            self.apply(done)?;
        }
        Ok(())
    }

    fn fail_dir(&mut self, id: NodeId, code: &'static str) {
        self.destroy_children(id);
        if let Some(dir) = self.dir_mut(id) {
            dir.state = DirState::Failed { code };
            dir.mtime = None;
        }
        self.stats.failures += 1;
    }

    fn apply(&mut self, done: Completion<ScanReply>) -> EngineResult<()> {
        match (self.in_flight.remove(&done.ticket), done.result) {
            (Some(InFlight::Scan(id)), Ok(ScanReply::Listing(result))) => self.apply_listing(id, Ok(result)),
            (Some(InFlight::Scan(id)), Err(failure)) => self.apply_listing(id, Err(failure)),
            (Some(InFlight::Moves { parent, moves }), Ok(ScanReply::Holders(held))) => {
                self.apply_moves(parent, moves, held)
            }
            (Some(InFlight::Moves { parent, .. }), Err(failure)) => {
                warn!("identity check failed: {}; rescanning", failure.message);
                self.request_scan(parent)
            }
            (Some(_), Ok(_)) => Err(EngineError::Worker {
                message: "scan pool replied with the wrong kind of result".to_string(),
            }),
            (None, _) => Ok(()),
        }
    }

    fn apply_listing(&mut self, id: NodeId, result: Result<ScanResult, WorkerFailure>) -> EngineResult<()> {
        let (attempt, rescan) = match self.dir(id).map(|d| &d.state) {
            Some(DirState::Reading { attempt, rescan }) => (*attempt, *rescan),
            _ => {
                trace!("dropping scan result for a destroyed directory");
                return Ok(());
            }
        };
        let (uuid, parent) = match self.get(id) {
            Some(node) => (node.uuid, node.parent),
            None => return Ok(()),
        };

        let listing = match result {
            Ok(Ok(listing)) => listing,
            Ok(Err(e)) => {
                warn!("scan of {} failed: {}", uuid, e);
                self.fail_dir(id, e.code());
                if e.is_fatal() {
                    return Err(e);
                }
                let vanished = matches!(
                    e,
                    EngineError::NotFound { .. }
                        | EngineError::NotADirectory { .. }
                        | EngineError::Unsupported { .. }
                );
                if vanished {
                    if let Some(parent) = parent {
                        self.request_scan(parent)?;
                    }
                } else if rescan {
                    self.dispatch(id, 0)?;
                }
                return Ok(());
            }
            Err(failure) => {
                warn!("scan worker failed on {}: {}", uuid, failure.message);
                self.fail_dir(id, "EWORKER");
                return Ok(());
            }
        };

        if listing.dir.uuid != uuid {
            warn!(
                "identity of directory {} changed to {}; voiding subtree",
                uuid, listing.dir.uuid
            );
            self.fail_dir(id, "EUUIDMISMATCH");
            if let Some(parent) = parent {
                self.request_scan(parent)?;
            }
            return Ok(());
        }

        let stable = listing.dir.mtime == listing.mtime_after;
        if !stable {
            if attempt < self.retry_limit {
                debug!("{} changed while listing, retry {}", uuid, attempt + 1);
                self.stats.retries += 1;
                return self.dispatch(id, attempt + 1);
            }
            warn!(
                "{} kept changing after {} retries; applying last listing",
                uuid, attempt
            );
        }

        self.reconcile(id, listing.entries)?;
        if let Some(dir) = self.dir_mut(id) {
            dir.mtime = stable.then_some(listing.dir.mtime);
            dir.state = DirState::Idle;
        }
        if rescan {
            self.dispatch(id, 0)?;
        }
        Ok(())
    }

    fn reconcile(&mut self, id: NodeId, entries: Vec<Xstat>) -> EngineResult<()> {
        let old = match self.dir(id) {
            Some(dir) => dir.children.clone(),
            None => return Ok(()),
        };
        let mut current: HashMap<Uuid, NodeId> = old
            .iter()
            .filter_map(|&c| self.get(c).map(|n| (n.uuid, c)))
            .collect();
        let mut children = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        let mut to_scan = Vec::new();
        let mut moves = Vec::new();

        for entry in entries {
            if !seen.insert(entry.uuid) {
                warn!("identity {} appears twice in one directory; skipping {}", entry.uuid, entry.name);
                continue;
            }
            let child = match current.remove(&entry.uuid) {
                Some(child) if self.get(child).map(Node::kind) == Some(entry.kind) => {
                    self.refresh(child, &entry);
                    child
                }
                Some(child) => {
                    self.destroy(child);
                    self.alloc(Node::from_xstat(&entry, id))
                }
                None => match self.find_by_uuid(entry.uuid) {
                    Some(other) => {
                        if let Some(from) = self.movable(other, id, &entry) {
                            moves.push(Move { from, entry });
                        }
                        continue;
                    }
                    None => self.alloc(Node::from_xstat(&entry, id)),
                },
            };
            if self.needs_scan(child, &entry) {
                to_scan.push(child);
            }
            children.push(child);
        }

        for (_, gone) in current {
            self.destroy(gone);
        }
        if let Some(dir) = self.dir_mut(id) {
            dir.children = children;
        }
        for child in to_scan {
            self.request_scan(child)?;
        }
        if !moves.is_empty() {
            let paths = moves.iter().map(|m| (m.entry.uuid, m.from.clone())).collect();
            let ticket = self.pool.submit(ScanJob::Holders(paths), &self.reply_tx)?;
            self.in_flight.insert(ticket, InFlight::Moves { parent: id, moves });
        }
        Ok(())
    }

    fn needs_scan(&self, id: NodeId, entry: &Xstat) -> bool {
        self.dir(id)
            .map_or(false, |dir| dir.state != DirState::Idle || dir.mtime != Some(entry.mtime))
    }

    fn refresh(&mut self, id: NodeId, entry: &Xstat) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        if node.name != entry.name {
            debug!("{} renamed {} -> {}", node.uuid, node.name, entry.name);
            node.name = entry.name.clone();
        }
        if let Body::File(file) = &mut node.body {
            file.size = entry.size;
            file.mtime = entry.mtime;
            file.hash = entry.hash;
            file.magic = entry.magic;
        }
    }

    /// Current path of a node that could move under `parent` as `entry`.
    fn movable(&self, id: NodeId, parent: NodeId, entry: &Xstat) -> Option<PathBuf> {
        let node = self.get(id)?;
        if node.parent.is_none() {
            warn!("drive root {} listed inside another directory; skipping", entry.uuid);
            return None;
        }
        if node.kind() != entry.kind || self.is_ancestor(id, parent) {
            warn!("cannot move {} under {}; skipping", entry.uuid, entry.name);
            return None;
        }
        self.abs_path(id)
    }

    /// Finish the moves a listing of `parent` found, given whether each old
    /// location still carries the identity.
    fn apply_moves(&mut self, parent: NodeId, moves: Vec<Move>, held: Vec<bool>) -> EngineResult<()> {
        match self.dir(parent) {
            Some(dir) if !matches!(dir.state, DirState::Failed { .. }) => {}
            _ => {
                trace!("dropping moves into a directory that is gone or failed");
                return Ok(());
            }
        }
        for (Move { from, entry }, held) in moves.into_iter().zip(held) {
            let child = match self.find_by_uuid(entry.uuid) {
                Some(id) if self.get(id).and_then(Node::parent) == Some(parent) => continue,
                Some(_) if held => {
                    warn!(
                        "identity {} is held by both {} and {}; skipping the latter",
                        entry.uuid,
                        from.display(),
                        entry.name
                    );
                    continue;
                }
                Some(id) => {
                    // moved again while the check ran
                    if self.movable(id, parent, &entry).as_ref() != Some(&from) {
                        self.request_scan(parent)?;
                        continue;
                    }
                    self.reparent(id, parent, &entry);
                    id
                }
                None => self.alloc(Node::from_xstat(&entry, parent)),
            };
            self.insert_child(parent, child);
            if self.needs_scan(child, &entry) {
                self.request_scan(child)?;
            }
        }
        Ok(())
    }

    fn reparent(&mut self, id: NodeId, parent: NodeId, entry: &Xstat) {
        let old_parent = self.get(id).and_then(Node::parent);
        if let Some(dir) = old_parent.and_then(|p| self.dir_mut(p)) {
            dir.children.retain(|&c| c != id);
        }
        if let Some(node) = self.get_mut(id) {
            node.parent = Some(parent);
        }
        self.refresh(id, entry);
        debug!("{} moved into a new directory as {}", entry.uuid, entry.name);
    }

    /// Add `child` to `parent` keeping children in name order.
    fn insert_child(&mut self, parent: NodeId, child: NodeId) {
        let Some(name) = self.get(child).map(|n| n.name.clone()) else {
            return;
        };
        let at = match self.dir(parent) {
            Some(dir) if !dir.children.contains(&child) => dir
                .children
                .partition_point(|&c| self.get(c).map_or(false, |n| n.name < name)),
            _ => return,
        };
        if let Some(dir) = self.dir_mut(parent) {
            dir.children.insert(at, child);
        }
    }

    // ---- content hashes ----

    /// Files whose fingerprint is unknown or stale.
    pub fn pending_files(&self) -> Vec<PendingFile> {
        self.live()
            .filter_map(|(id, node)| match node.file() {
                Some(file) if file.hash.is_none() => Some(PendingFile {
                    node: id,
                    uuid: node.uuid,
                    path: self.abs_path(id)?,
                    mtime: file.mtime,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn hashed_files(&self) -> Vec<HashedFile> {
        self.live()
            .filter_map(|(id, node)| {
                let file = node.file()?;
                Some(HashedFile {
                    uuid: node.uuid,
                    hash: file.hash?,
                    magic: file.magic,
                    path: self.abs_path(id)?,
                })
            })
            .collect()
    }

    /// Record a fingerprint on a file node if it still is the file that was hashed.
    pub fn set_file_hash(
        &mut self,
        id: NodeId,
        uuid: Uuid,
        hash: Fingerprint,
        magic: Option<ContentType>,
        mtime: i64,
    ) -> bool {
        let Some(node) = self.get_mut(id) else {
            return false;
        };
        if node.uuid != uuid {
            return false;
        }
        match &mut node.body {
            Body::File(file) if file.mtime == mtime => {
                file.hash = Some(hash);
                file.magic = magic;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use filetime::{set_file_mtime, FileTime};

    fn config(root: &Path) -> EngineConfig {
        let mut config = EngineConfig::sidecar(root);
        config.scan_workers = 2;
        config.scan_backoff_ms = 1;
        config
    }

    fn store(config: &EngineConfig) -> Arc<IdentityStore> {
        Arc::new(IdentityStore::from_config(config).expect("Failed to open identity store"))
    }

    fn mount(forest: &mut Forest) -> (Uuid, NodeId, PathBuf) {
        let drive = Uuid::new_v4();
        let root = forest.create_root(drive).expect("Failed to create drive");
        forest.settle().expect("Failed to settle");
        let path = forest.drive_path(drive);
        (drive, root, path)
    }

    fn rescan(forest: &mut Forest, id: NodeId) {
        forest.request_scan(id).expect("Failed to request scan");
        forest.settle().expect("Failed to settle");
    }

    fn names(forest: &Forest, dir: NodeId) -> Vec<String> {
        let node = forest.get(dir).expect("directory should be alive");
        node.children()
            .iter()
            .map(|&c| forest.get(c).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_scan_builds_tree() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (drive, root, path) = mount(&mut forest);

        fs::create_dir(path.join("a")).unwrap();
        fs::write(path.join("a").join("one.txt"), b"one").unwrap();
        fs::write(path.join("two.txt"), b"two!").unwrap();
        rescan(&mut forest, root);

        assert_eq!(names(&forest, root), vec!["a", "two.txt"]);
        let tree = forest.get_tree(drive).unwrap();
        assert_eq!(tree.uuid, drive);
        assert_eq!(tree.count(), 4);
        let one = tree.child("a").and_then(|a| a.child("one.txt")).expect("one.txt tracked");
        assert_eq!(one.size, Some(3));
        assert_eq!(tree.child("two.txt").unwrap().size, Some(4));
        assert_eq!(forest.get(root).unwrap().dir_state(), Some(&DirState::Idle));
    }

    #[test]
    fn test_drive_root_carries_drive_uuid() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let store = store(&config);
        let mut forest = Forest::new(&config, Arc::clone(&store)).unwrap();
        let (drive, root, path) = mount(&mut forest);

        assert_eq!(store.read(&path).unwrap().uuid, drive);
        assert_eq!(forest.create_root(drive).unwrap(), root);
        assert_eq!(forest.abs_path(root).unwrap(), path);
    }

    #[test]
    fn test_rename_keeps_node() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::create_dir(path.join("a")).unwrap();
        fs::write(path.join("a").join("inner"), b"x").unwrap();
        rescan(&mut forest, root);
        let a = forest.child_named(root, "a").unwrap();
        let before = forest.len();

        fs::rename(path.join("a"), path.join("b")).unwrap();
        rescan(&mut forest, root);

        assert_eq!(forest.get(a).unwrap().name(), "b");
        assert_eq!(forest.child_named(root, "b"), Some(a));
        assert_eq!(forest.len(), before);
        assert_eq!(names(&forest, a), vec!["inner"]);
    }

    #[test]
    fn test_removed_directory_destroys_subtree() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::create_dir(path.join("sub")).unwrap();
        fs::write(path.join("sub").join("f"), b"x").unwrap();
        rescan(&mut forest, root);
        let sub = forest.child_named(root, "sub").unwrap();
        let file = forest.child_named(sub, "f").unwrap();
        let file_uuid = forest.get(file).unwrap().uuid();

        fs::remove_dir_all(path.join("sub")).unwrap();
        rescan(&mut forest, root);

        assert!(forest.get(sub).is_none());
        assert!(forest.get(file).is_none());
        assert!(forest.find_by_uuid(file_uuid).is_none());
        assert_eq!(forest.len(), 1);
    }

    #[test]
    fn test_stale_handles_never_alias() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::write(path.join("old"), b"x").unwrap();
        rescan(&mut forest, root);
        let old = forest.child_named(root, "old").unwrap();

        fs::remove_file(path.join("old")).unwrap();
        rescan(&mut forest, root);
        fs::write(path.join("new"), b"y").unwrap();
        rescan(&mut forest, root);

        let new = forest.child_named(root, "new").unwrap();
        assert_ne!(old, new);
        assert!(forest.get(old).is_none());
    }

    #[test]
    fn test_move_between_directories_reparents() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::create_dir(path.join("x")).unwrap();
        fs::create_dir(path.join("y")).unwrap();
        fs::create_dir(path.join("x").join("moving")).unwrap();
        fs::write(path.join("x").join("moving").join("deep"), b"d").unwrap();
        rescan(&mut forest, root);
        let x = forest.child_named(root, "x").unwrap();
        let y = forest.child_named(root, "y").unwrap();
        let moving = forest.child_named(x, "moving").unwrap();

        fs::rename(path.join("x").join("moving"), path.join("y").join("moving")).unwrap();
        rescan(&mut forest, y);

        assert_eq!(forest.get(moving).unwrap().parent(), Some(y));
        assert!(names(&forest, x).is_empty());
        assert_eq!(names(&forest, moving), vec!["deep"]);

        rescan(&mut forest, x);
        assert!(forest.get(moving).is_some());
        assert_eq!(forest.abs_path(moving).unwrap(), path.join("y").join("moving"));
    }

    #[test]
    fn test_move_seen_from_both_directories_at_once() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::create_dir_all(path.join("x").join("moving")).unwrap();
        fs::create_dir(path.join("y")).unwrap();
        fs::write(path.join("y").join("a"), b"a").unwrap();
        fs::write(path.join("y").join("z"), b"z").unwrap();
        rescan(&mut forest, root);
        let x = forest.child_named(root, "x").unwrap();
        let y = forest.child_named(root, "y").unwrap();
        let uuid = forest.get(forest.child_named(x, "moving").unwrap()).unwrap().uuid();

        fs::rename(path.join("x").join("moving"), path.join("y").join("moving")).unwrap();
        forest.request_scan(y).unwrap();
        forest.request_scan(x).unwrap();
        forest.settle().unwrap();

        let moved = forest.find_by_uuid(uuid).expect("moved directory should be tracked");
        assert_eq!(forest.get(moved).unwrap().parent(), Some(y));
        assert_eq!(forest.abs_path(moved).unwrap(), path.join("y").join("moving"));
        assert!(names(&forest, x).is_empty());
        assert_eq!(names(&forest, y), vec!["a", "moving", "z"]);
        assert_eq!(forest.in_flight(), 0);
    }

    #[test]
    fn test_duplicated_identity_is_skipped() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        // hard links share an inode, so the sidecar hands both names one identity
        fs::create_dir(path.join("x")).unwrap();
        fs::create_dir(path.join("y")).unwrap();
        fs::write(path.join("x").join("f"), b"shared").unwrap();
        fs::hard_link(path.join("x").join("f"), path.join("y").join("f")).unwrap();
        rescan(&mut forest, root);

        let x = forest.child_named(root, "x").unwrap();
        let y = forest.child_named(root, "y").unwrap();
        assert_eq!(names(&forest, x).len() + names(&forest, y).len(), 1);
    }

    #[test]
    fn test_requests_coalesce_while_reading() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::with_scanner(&config, store(&config), |store: &IdentityStore, path: &Path| {
            thread::sleep(Duration::from_millis(30));
            scan_directory(store, path)
        })
        .unwrap();
        let (_, root, _) = mount(&mut forest);
        let before = forest.stats().dispatched;

        forest.request_scan(root).unwrap();
        forest.request_scan(root).unwrap();
        forest.request_scan(root).unwrap();
        assert!(matches!(
            forest.get(root).unwrap().dir_state(),
            Some(DirState::Reading { rescan: true, .. })
        ));
        forest.settle().unwrap();

        assert_eq!(forest.stats().dispatched - before, 2);
        assert_eq!(forest.get(root).unwrap().dir_state(), Some(&DirState::Idle));
    }

    fn churning(limit: usize) -> impl Fn(&IdentityStore, &Path) -> ScanResult + Send + Sync + 'static {
        let calls = AtomicUsize::new(0);
        move |store: &IdentityStore, path: &Path| {
            let mut listing = scan_directory(store, path)?;
            if path.ends_with("busy") && calls.fetch_add(1, Ordering::SeqCst) < limit {
                listing.mtime_after += 1;
            }
            Ok(listing)
        }
    }

    #[test]
    fn test_retry_when_directory_changes_during_scan() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::with_scanner(&config, store(&config), churning(1)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::create_dir(path.join("busy")).unwrap();
        fs::write(path.join("busy").join("f"), b"x").unwrap();
        rescan(&mut forest, root);

        let busy = forest.child_named(root, "busy").unwrap();
        assert_eq!(forest.stats().retries, 1);
        assert!(forest.get(busy).unwrap().mtime().is_some());
        assert_eq!(names(&forest, busy), vec!["f"]);
    }

    #[test]
    fn test_retry_ceiling_applies_listing_without_mtime() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = config(temp_dir.path());
        config.scan_retry_limit = 2;
        let mut forest = Forest::with_scanner(&config, store(&config), churning(usize::MAX)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::create_dir(path.join("busy")).unwrap();
        fs::write(path.join("busy").join("f"), b"x").unwrap();
        rescan(&mut forest, root);

        let busy = forest.child_named(root, "busy").unwrap();
        assert_eq!(forest.stats().retries, 2);
        let node = forest.get(busy).unwrap();
        assert_eq!(node.dir_state(), Some(&DirState::Idle));
        assert_eq!(node.mtime(), None);
        assert_eq!(names(&forest, busy), vec!["f"]);
    }

    #[test]
    fn test_stale_directory_is_rescanned() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);
        assert!(!forest.check_stale(root).unwrap());

        fs::write(path.join("late"), b"x").unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        assert!(forest.check_stale(root).unwrap());
        forest.settle().unwrap();

        assert_eq!(names(&forest, root), vec!["late"]);
        assert_eq!(forest.check_stale_all().unwrap(), 0);
    }

    #[test]
    fn test_identity_mismatch_voids_subtree() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::create_dir(path.join("sub")).unwrap();
        fs::write(path.join("sub").join("inner"), b"x").unwrap();
        rescan(&mut forest, root);
        let sub = forest.child_named(root, "sub").unwrap();

        // a different directory now sits at the old name
        fs::rename(path.join("sub"), path.join("sub_old")).unwrap();
        fs::create_dir(path.join("sub")).unwrap();
        rescan(&mut forest, sub);

        assert_eq!(forest.get(sub).unwrap().name(), "sub_old");
        assert_eq!(names(&forest, sub), vec!["inner"]);
        let replacement = forest.child_named(root, "sub").unwrap();
        assert_ne!(replacement, sub);
        assert!(forest.stats().failures >= 1);
    }

    #[test]
    fn test_unsupported_entries_are_ignored() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::write(path.join("real"), b"x").unwrap();
        std::os::unix::fs::symlink(path.join("real"), path.join("link")).unwrap();
        rescan(&mut forest, root);

        assert_eq!(names(&forest, root), vec!["real"]);
    }

    #[test]
    fn test_resolve_and_lookup() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (drive, root, path) = mount(&mut forest);
        let (other_drive, _, _) = mount(&mut forest);

        fs::create_dir_all(path.join("a").join("b")).unwrap();
        fs::write(path.join("a").join("file"), b"x").unwrap();
        rescan(&mut forest, root);

        let b = forest.lookup(drive, Path::new("a/b")).expect("a/b tracked");
        let b_uuid = forest.get(b).unwrap().uuid();
        assert_eq!(forest.resolve_dir(drive, b_uuid).unwrap(), path.join("a").join("b"));
        assert_eq!(forest.resolve_dir(other_drive, b_uuid).unwrap_err().code(), "ENONODE");
        assert_eq!(forest.resolve_dir(Uuid::new_v4(), b_uuid).unwrap_err().code(), "ENODRIVE");

        let file = forest.lookup(drive, Path::new("a/file")).unwrap();
        let file_uuid = forest.get(file).unwrap().uuid();
        assert_eq!(forest.resolve_dir(drive, file_uuid).unwrap_err().code(), "ENOTDIR");
        assert!(forest.lookup(drive, Path::new("../escape")).is_none());
    }

    #[test]
    fn test_pending_and_hashed_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (_, root, path) = mount(&mut forest);

        fs::write(path.join("f"), b"x").unwrap();
        rescan(&mut forest, root);
        let pending = forest.pending_files();
        assert_eq!(pending.len(), 1);
        let p = &pending[0];

        assert!(!forest.set_file_hash(p.node, Uuid::new_v4(), Fingerprint([1; 32]), None, p.mtime));
        assert!(!forest.set_file_hash(p.node, p.uuid, Fingerprint([1; 32]), None, p.mtime + 1));
        assert!(forest.set_file_hash(p.node, p.uuid, Fingerprint([1; 32]), None, p.mtime));

        assert!(forest.pending_files().is_empty());
        let hashed = forest.hashed_files();
        assert_eq!(hashed.len(), 1);
        assert_eq!(hashed[0].path, path.join("f"));
    }

    #[test]
    fn test_remove_root() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = config(temp_dir.path());
        let mut forest = Forest::new(&config, store(&config)).unwrap();
        let (drive, root, path) = mount(&mut forest);
        fs::write(path.join("f"), b"x").unwrap();
        rescan(&mut forest, root);

        forest.remove_root(drive).unwrap();
        assert!(forest.is_empty());
        assert_eq!(forest.get_tree(drive).unwrap_err().code(), "ENODRIVE");
        assert_eq!(forest.remove_root(drive).unwrap_err().code(), "ENODRIVE");
        assert!(path.join("f").exists());
    }
}
