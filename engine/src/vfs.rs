//! The storage facade.
//!
//! `Vfs` owns the identity store, the forest, the fingerprint engine, the
//! digest registry and every batch. Open it once, drive it from one thread,
//! and `shutdown` it to persist the registry and identity index.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::fingerprint::Fingerprinter;
use crate::fs_ops;
use crate::forest::{Forest, NodeId};
use crate::magic::{self, ContentType};
use crate::model::{Fingerprint, Mode, Policy, TreeEntry};
use crate::progress::ProgressCallback;
use crate::registry::{DigestRegistry, HeaderExtractor, MetadataExtractor};
use crate::sink::{group_entries, BatchEntry, FailureRule, Sink, SinkState, SinkSummary};
use crate::task::TaskPolicies;
use crate::xstat::IdentityStore;
use crate::xtree::{expand_all, PolicyNode};

/// Outcome of one `index_pending` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Files fingerprinted in this pass
    pub hashed: usize,
    /// New registry entries
    pub registered: usize,
    /// Files that changed or vanished while being hashed
    pub skipped: usize,
}

struct Batch {
    sink: Arc<Mutex<Sink>>,
    /// Directories to rescan once the batch has run
    dirs: Vec<Uuid>,
}

pub struct Vfs {
    config: EngineConfig,
    store: Arc<IdentityStore>,
    forest: Forest,
    fingerprinter: Fingerprinter,
    registry: DigestRegistry,
    batches: HashMap<Uuid, Batch>,
}

fn lock(sink: &Mutex<Sink>) -> MutexGuard<'_, Sink> {
    sink.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Vfs {
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        Self::open_with(config, Box::new(HeaderExtractor))
    }

    pub fn open_with(config: EngineConfig, extractor: Box<dyn MetadataExtractor>) -> EngineResult<Self> {
        config.validate()?;
        let store = Arc::new(IdentityStore::from_config(&config)?);
        let forest = Forest::new(&config, Arc::clone(&store))?;
        let fingerprinter = Fingerprinter::new(&config)?;
        let registry = DigestRegistry::open(config.registry_snapshot.clone(), extractor)?;
        info!(
            "opened {} ({:?} identities, {} registry entries)",
            config.root.display(),
            config.identity,
            registry.len()
        );
        Ok(Vfs {
            config,
            store,
            forest,
            fingerprinter,
            registry,
            batches: HashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn registry(&self) -> &DigestRegistry {
        &self.registry
    }

    /// Mount a drive and wait for its tree to be scanned.
    pub fn create_root(&mut self, drive: Uuid) -> EngineResult<NodeId> {
        let id = self.forest.create_root(drive)?;
        self.forest.settle()?;
        Ok(id)
    }

    pub fn remove_root(&mut self, drive: Uuid) -> EngineResult<()> {
        self.forest.remove_root(drive)
    }

    pub fn get_tree(&self, drive: Uuid) -> EngineResult<TreeEntry> {
        self.forest.get_tree(drive)
    }

    /// Apply every scan in flight.
    pub fn settle(&mut self) -> EngineResult<()> {
        self.forest.settle()
    }

    /// Rescan directories whose modification time moved, then settle.
    pub fn refresh(&mut self) -> EngineResult<usize> {
        let stale = self.forest.check_stale_all()?;
        self.forest.settle()?;
        Ok(stale)
    }

    pub fn fingerprint_file(&self, path: &Path) -> EngineResult<Fingerprint> {
        self.fingerprinter.fingerprint(path)
    }

    /// Queue a copy or move of `entries` into directory `dst_dir` on
    /// `dst_drive`. Nothing runs until `run_batch`.
    ///
    /// # Errors
    /// `ENODRIVE`, `ENONODE` or `ENOTDIR` when a source or destination
    /// directory cannot be resolved, `EINSIDESOURCE` when `dst_dir` is one of
    /// the entries or lies beneath one.
    pub fn create_batch_copy(
        &mut self,
        mode: Mode,
        entries: &[BatchEntry],
        dst_drive: Uuid,
        dst_dir: Uuid,
        policies: TaskPolicies,
        on_failure: FailureRule,
    ) -> EngineResult<Uuid> {
        let dst_path = self.forest.resolve_dir(dst_drive, dst_dir)?;
        let forest = &self.forest;
        let groups = group_entries(entries, |drive, dir| forest.resolve_dir(drive, dir))?;
        for group in &groups {
            for name in &group.names {
                let entry = group.path.join(name);
                if fs_ops::is_within(&dst_path, &entry)? {
                    return Err(EngineError::InsideSource {
                        entry,
                        destination: dst_path,
                    });
                }
            }
        }

        let mut dirs: Vec<Uuid> = groups.iter().map(|g| g.dir).collect();
        dirs.push(dst_dir);
        let mut sink = Sink::new(mode, groups, dst_path, policies, on_failure, Arc::clone(&self.store));
        sink.set_verify(self.config.verify_copies);
        let uuid = sink.uuid();
        info!("created {} batch {} with {} entries", mode, uuid, entries.len());
        self.batches.insert(
            uuid,
            Batch {
                sink: Arc::new(Mutex::new(sink)),
                dirs,
            },
        );
        Ok(uuid)
    }

    fn batch(&self, sink: Uuid) -> EngineResult<&Batch> {
        self.batches.get(&sink).ok_or(EngineError::TaskNotFound { uuid: sink })
    }

    /// Shared handle to a batch, for running it on another thread. Call
    /// `refresh_batch` afterwards to bring the forest up to date.
    pub fn sink(&self, sink: Uuid) -> EngineResult<Arc<Mutex<Sink>>> {
        Ok(Arc::clone(&self.batch(sink)?.sink))
    }

    /// Run a batch on this thread, then rescan the directories it touched.
    pub fn run_batch(&mut self, sink: Uuid, progress: Option<&dyn ProgressCallback>) -> EngineResult<SinkState> {
        let handle = self.sink(sink)?;
        let state = lock(&handle).run(progress).clone();
        self.refresh_batch(sink)?;
        Ok(state)
    }

    /// Rescan the source and destination directories of a batch.
    pub fn refresh_batch(&mut self, sink: Uuid) -> EngineResult<()> {
        let dirs = self.batch(sink)?.dirs.clone();
        for dir in dirs {
            match self.forest.find_by_uuid(dir) {
                Some(id) => self.forest.request_scan(id)?,
                None => debug!("directory {} is gone, not rescanning", dir),
            }
        }
        self.forest.settle()
    }

    pub fn batch_summary(&self, sink: Uuid) -> EngineResult<SinkSummary> {
        Ok(lock(&self.batch(sink)?.sink).summary())
    }

    pub fn batches(&self) -> Vec<SinkSummary> {
        self.batches.values().map(|b| lock(&b.sink).summary()).collect()
    }

    /// Forget a batch that has settled.
    pub fn remove_batch(&mut self, sink: Uuid) -> EngineResult<SinkSummary> {
        let batch = self.batches.remove(&sink).ok_or(EngineError::TaskNotFound { uuid: sink })?;
        let summary = lock(&batch.sink).summary();
        Ok(summary)
    }

    /// Resolve a conflict of the current task of a batch.
    pub fn update_task_node(
        &mut self,
        sink: Uuid,
        task: Uuid,
        node: Uuid,
        policy: Policy,
        apply_to_all: bool,
    ) -> EngineResult<()> {
        let handle = self.sink(sink)?;
        let mut sink = lock(&handle);
        sink.update_task_node(task, node, policy, apply_to_all)
    }

    /// Work out the collisions `entries` would meet in `dst_dir`, from the
    /// forest as last scanned.
    pub fn preview_conflicts(
        &self,
        entries: &[BatchEntry],
        dst_drive: Uuid,
        dst_dir: Uuid,
    ) -> EngineResult<Vec<PolicyNode>> {
        let dest = self.dir_snapshot(dst_drive, dst_dir)?;
        let mut sources = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = self.forest.resolve_dir(entry.drive, entry.dir)?;
            let source = self
                .forest
                .find_by_uuid(entry.dir)
                .and_then(|dir| self.forest.child_named(dir, &entry.name))
                .and_then(|id| self.forest.snapshot(id))
                .ok_or_else(|| EngineError::NotFound {
                    path: path.join(&entry.name),
                })?;
            sources.push(source);
        }
        Ok(expand_all(&sources, &dest.children))
    }

    fn dir_snapshot(&self, drive: Uuid, dir: Uuid) -> EngineResult<TreeEntry> {
        self.forest.resolve_dir(drive, dir)?;
        self.forest
            .find_by_uuid(dir)
            .and_then(|id| self.forest.snapshot(id))
            .ok_or(EngineError::NodeNotFound { uuid: dir })
    }

    /// Fingerprint every file lacking a valid hash and register its content.
    ///
    /// Files that change while being hashed are left for a later pass.
    pub fn index_pending(&mut self) -> EngineResult<IndexReport> {
        let mut report = IndexReport::default();
        for file in self.forest.pending_files() {
            let hashed = match self.fingerprinter.fingerprint_stat(&file.path) {
                Ok(hashed) => hashed,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("not indexing {}: {}", file.path.display(), e);
                    report.skipped += 1;
                    continue;
                }
            };
            if hashed.mtime != file.mtime {
                report.skipped += 1;
                continue;
            }
            let content_type = match magic::sniff_file(&file.path) {
                Ok(content_type) => content_type,
                Err(e) => {
                    warn!("cannot sniff {}: {}", file.path.display(), e);
                    ContentType::Other
                }
            };
            match self
                .store
                .update_hash(&file.path, file.uuid, hashed.fingerprint, Some(content_type), hashed.mtime)
            {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("hash of {} is stale: {}", file.path.display(), e);
                    report.skipped += 1;
                    continue;
                }
            }
            self.forest
                .set_file_hash(file.node, file.uuid, hashed.fingerprint, Some(content_type), hashed.mtime);
            report.hashed += 1;
            if self
                .registry
                .index(hashed.fingerprint, content_type, file.uuid, &file.path)?
            {
                report.registered += 1;
            }
        }

        // hashes carried over by copies or found on disk
        for file in self.forest.hashed_files() {
            if self.registry.contains_node(&file.hash, file.uuid) {
                continue;
            }
            let content_type = file.magic.unwrap_or(ContentType::Other);
            if self.registry.index(file.hash, content_type, file.uuid, &file.path)? {
                report.registered += 1;
            }
        }
        info!(
            "indexed {} files ({} new contents, {} skipped)",
            report.hashed, report.registered, report.skipped
        );
        Ok(report)
    }

    /// Persist the registry and identity index.
    pub fn shutdown(mut self) -> EngineResult<()> {
        for (uuid, batch) in &self.batches {
            let sink = lock(&batch.sink);
            if matches!(sink.state(), SinkState::Running) {
                warn!("batch {} still running at shutdown", uuid);
            }
        }
        self.registry.shutdown()?;
        self.store.flush()?;
        info!("closed {}", self.config.root.display());
        Ok(())
    }
}
