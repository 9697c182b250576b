//! Copy/move tasks.
//!
//! A task transfers named entries from one source directory into one
//! destination directory. Every entry (and, once a directory is created or
//! merged, every entry below it) becomes a `TaskNode` with its own state
//! machine:
//!
//! ```text
//! Pending ──► Working ──► Done
//!                 ├─────► Conflict ──(update_node)──► Pending
//!                 └─────► Failed
//! ```
//!
//! Each operation is guarded by the identities last observed for its source
//! and destination. When either moved on, the node parks in `Conflict`
//! instead of acting on the wrong entry. Entry-level errors fail only the
//! node; a missing or invalid destination directory fails the whole task.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::fs_ops;
use crate::model::{Conflict, ConflictReason, EntryKind, Mode, NodeState, Outcome, Policy, TaskState};
use crate::progress::ProgressCallback;
use crate::xstat::{IdentityStore, Xstat};
use crate::xtree::{auto_name, legal_policies};

// errno for removing a directory that still has entries
const ENOTEMPTY: i32 = 39;

/// Task-wide policies, one per conflict class. A class policy resolves
/// every matching collision without asking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPolicies {
    /// Directory onto an existing directory
    pub dir_same: Option<Policy>,
    /// Directory onto an existing file
    pub dir_diff: Option<Policy>,
    /// File onto an existing file
    pub file_same: Option<Policy>,
    /// File onto an existing directory
    pub file_diff: Option<Policy>,
}

impl TaskPolicies {
    /// `policy` for every class it is legal in.
    pub fn uniform(policy: Policy) -> Self {
        let diff = (policy != Policy::Keep).then_some(policy);
        TaskPolicies {
            dir_same: Some(policy),
            dir_diff: diff,
            file_same: Some(policy),
            file_diff: diff,
        }
    }

    fn slot(&mut self, src: EntryKind, dst: EntryKind) -> &mut Option<Policy> {
        match (src, src == dst) {
            (EntryKind::Directory, true) => &mut self.dir_same,
            (EntryKind::Directory, false) => &mut self.dir_diff,
            (EntryKind::File, true) => &mut self.file_same,
            (EntryKind::File, false) => &mut self.file_diff,
        }
    }

    pub fn get(&self, src: EntryKind, dst: EntryKind) -> Option<Policy> {
        match (src, src == dst) {
            (EntryKind::Directory, true) => self.dir_same,
            (EntryKind::Directory, false) => self.dir_diff,
            (EntryKind::File, true) => self.file_same,
            (EntryKind::File, false) => self.file_diff,
        }
    }

    pub fn set(&mut self, src: EntryKind, dst: EntryKind, policy: Policy) {
        *self.slot(src, dst) = Some(policy);
    }
}

/// One entry of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    pub uuid: Uuid,
    #[serde(skip)]
    parent: Option<usize>,
    /// Name in the source directory
    pub name: String,
    /// Name at the destination; differs from `name` after a rename
    pub target_name: String,
    pub kind: EntryKind,
    /// Identity of the source entry when it was planned
    pub source_uuid: Uuid,
    /// Identity of the colliding destination `policy` was chosen against
    pub dest_uuid: Option<Uuid>,
    pub policy: Option<Policy>,
    pub state: NodeState,
    /// Bytes copied
    pub bytes: u64,
}

impl TaskNode {
    pub fn is_conflict(&self) -> bool {
        matches!(self.state, NodeState::Conflict(_))
    }
}

/// Stops a running task before its next node.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Serializable overview of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub uuid: Uuid,
    pub mode: Mode,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub state: TaskState,
    pub total: usize,
    pub done: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub pending: usize,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

fn failed(e: &EngineError) -> NodeState {
    NodeState::Failed {
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

fn done(outcome: Outcome) -> NodeState {
    NodeState::Done { outcome }
}

pub struct Task {
    uuid: Uuid,
    mode: Mode,
    src_dir: PathBuf,
    dst_dir: PathBuf,
    nodes: Vec<TaskNode>,
    queue: VecDeque<usize>,
    policies: TaskPolicies,
    state: TaskState,
    abort: AbortHandle,
    store: Arc<IdentityStore>,
    verify: bool,
    created_at: DateTime<Utc>,
    /// Source directories merged into existing ones (move only)
    merged: Vec<usize>,
}

impl Task {
    /// Plan a task over `names` in `src_dir`.
    ///
    /// Each name's identity is read now; later operations are guarded by it.
    /// Names that cannot be read become failed nodes rather than errors.
    pub fn new(
        mode: Mode,
        src_dir: impl Into<PathBuf>,
        dst_dir: impl Into<PathBuf>,
        names: &[String],
        policies: TaskPolicies,
        store: Arc<IdentityStore>,
    ) -> Self {
        let mut task = Task {
            uuid: Uuid::new_v4(),
            mode,
            src_dir: src_dir.into(),
            dst_dir: dst_dir.into(),
            nodes: Vec::new(),
            queue: VecDeque::new(),
            policies,
            state: TaskState::Pending,
            abort: AbortHandle::new(),
            store,
            verify: true,
            created_at: Utc::now(),
            merged: Vec::new(),
        };
        for name in names {
            task.plan(None, name.clone(), true);
        }
        debug!("planned {} task {} with {} entries", mode, task.uuid, task.nodes.len());
        task
    }

    /// Re-hash copies before publishing them (on by default).
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    pub fn dst_dir(&self) -> &Path {
        &self.dst_dir
    }

    pub fn policies(&self) -> TaskPolicies {
        self.policies
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, uuid: Uuid) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.uuid == uuid)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter().filter(|n| n.is_conflict())
    }

    /// Source path of a node, if the node belongs to this task.
    pub fn source_path_of(&self, uuid: Uuid) -> Option<PathBuf> {
        let index = self.index_of(uuid)?;
        Some(self.src_path(index))
    }

    /// Destination path of a node, if the node belongs to this task.
    pub fn target_path_of(&self, uuid: Uuid) -> Option<PathBuf> {
        let index = self.index_of(uuid)?;
        Some(self.dst_path(index))
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Abort together with everything else holding `handle`.
    pub fn share_abort(&mut self, handle: AbortHandle) {
        self.abort = handle;
    }

    /// Stop scheduling nodes. Nodes not yet started stay pending.
    pub fn abort(&mut self) {
        self.abort.abort();
        if !matches!(self.state, TaskState::Finished | TaskState::Failed { .. }) {
            self.state = TaskState::Aborted;
        }
    }

    pub fn summary(&self) -> TaskSummary {
        let mut summary = TaskSummary {
            uuid: self.uuid,
            mode: self.mode,
            source: self.src_dir.clone(),
            destination: self.dst_dir.clone(),
            state: self.state.clone(),
            total: self.nodes.len(),
            done: 0,
            conflicts: 0,
            failed: 0,
            pending: 0,
            bytes: 0,
            created_at: self.created_at,
        };
        for node in &self.nodes {
            match node.state {
                NodeState::Done { .. } => summary.done += 1,
                NodeState::Conflict(_) => summary.conflicts += 1,
                NodeState::Failed { .. } => summary.failed += 1,
                NodeState::Pending | NodeState::Working => summary.pending += 1,
            }
            summary.bytes += node.bytes;
        }
        summary
    }

    fn index_of(&self, uuid: Uuid) -> Option<usize> {
        self.nodes.iter().position(|n| n.uuid == uuid)
    }

    fn path_of(&self, index: usize, base: &Path, name: impl Fn(&TaskNode) -> &str) -> PathBuf {
        let mut names = Vec::new();
        let mut cur = Some(index);
        while let Some(i) = cur {
            names.push(name(&self.nodes[i]));
            cur = self.nodes[i].parent;
        }
        let mut path = base.to_path_buf();
        path.extend(names.iter().rev());
        path
    }

    fn src_path(&self, index: usize) -> PathBuf {
        self.path_of(index, &self.src_dir, |n| n.name.as_str())
    }

    fn dst_path(&self, index: usize) -> PathBuf {
        self.path_of(index, &self.dst_dir, |n| n.target_name.as_str())
    }

    /// Directory a node is transferred into.
    fn dst_parent(&self, index: usize) -> PathBuf {
        match self.nodes[index].parent {
            Some(parent) => self.dst_path(parent),
            None => self.dst_dir.clone(),
        }
    }

    fn plan(&mut self, parent: Option<usize>, name: String, explicit: bool) {
        let src = match parent {
            Some(p) => self.src_path(p).join(&name),
            None => self.src_dir.join(&name),
        };
        let (kind, source_uuid, state) = match self.store.read(&src) {
            Ok(xstat) => (xstat.kind, xstat.uuid, NodeState::Pending),
            Err(EngineError::Unsupported { .. }) if !explicit => {
                trace!("not transferring {}", src.display());
                return;
            }
            Err(e) => (EntryKind::File, Uuid::nil(), failed(&e)),
        };
        let index = self.nodes.len();
        self.nodes.push(TaskNode {
            uuid: Uuid::new_v4(),
            parent,
            target_name: name.clone(),
            name,
            kind,
            source_uuid,
            dest_uuid: None,
            policy: None,
            state,
            bytes: 0,
        });
        if self.nodes[index].state == NodeState::Pending {
            self.queue.push_back(index);
        }
    }

    fn enqueue_children(&mut self, index: usize, src: &Path) -> EngineResult<()> {
        for name in fs_ops::list_dir(src)? {
            self.plan(Some(index), name, false);
        }
        Ok(())
    }

    fn check_structure(&self) -> EngineResult<()> {
        let dst = match fs_ops::lstat(&self.dst_dir) {
            Ok(metadata) => metadata,
            Err(EngineError::NotFound { path }) => return Err(EngineError::DestinationMissing { path }),
            Err(e) => return Err(e),
        };
        if !dst.is_dir() {
            return Err(EngineError::NotADirectory {
                path: self.dst_dir.clone(),
            });
        }
        if !fs_ops::lstat(&self.src_dir)?.is_dir() {
            return Err(EngineError::NotADirectory {
                path: self.src_dir.clone(),
            });
        }
        for node in self.nodes.iter().filter(|n| n.parent.is_none()) {
            let entry = self.src_dir.join(&node.name);
            if fs_ops::is_within(&self.dst_dir, &entry)? {
                return Err(EngineError::InsideSource {
                    entry,
                    destination: self.dst_dir.clone(),
                });
            }
        }
        Ok(())
    }

    /// Run until every queued node has settled, the task is aborted, or a
    /// structural error stops it.
    ///
    /// # Arguments
    /// * `progress` - Optional callback for progress updates
    ///
    /// # Returns
    /// The resulting state: `Finished`, `Blocked` when conflicts await a
    /// policy, `Aborted`, or `Failed`.
    pub fn run(&mut self, progress: Option<&dyn ProgressCallback>) -> &TaskState {
        if matches!(
            self.state,
            TaskState::Finished | TaskState::Failed { .. } | TaskState::Aborted
        ) {
            return &self.state;
        }
        self.state = TaskState::Running;
        info!("task {} running with {} queued entries", self.uuid, self.queue.len());
        if let Some(callback) = progress {
            callback.on_task_started(self);
        }

        if let Err(e) = self.check_structure() {
            warn!("task {} cannot run: {}", self.uuid, e);
            self.state = TaskState::Failed {
                code: e.code().to_string(),
                message: e.to_string(),
            };
        }

        while self.state == TaskState::Running {
            let Some(index) = self.queue.pop_front() else {
                break;
            };
            if self.abort.is_aborted() {
                self.queue.push_front(index);
                self.state = TaskState::Aborted;
                break;
            }
            if let Err(e) = self.step(index, progress) {
                warn!("task {} stopped: {}", self.uuid, e);
                self.state = TaskState::Failed {
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
            }
        }

        if self.state == TaskState::Running {
            if self.mode == Mode::Move {
                self.remove_emptied_dirs();
            }
            self.state = if self.nodes.iter().any(TaskNode::is_conflict) {
                TaskState::Blocked
            } else {
                TaskState::Finished
            };
        }
        let summary = self.summary();
        info!(
            "task {} {:?}: {} done, {} conflicts, {} failed",
            self.uuid, self.state, summary.done, summary.conflicts, summary.failed
        );
        if let Some(callback) = progress {
            callback.on_task_completed(self);
        }
        &self.state
    }

    /// Process one node. Only fatal errors are returned.
    fn step(&mut self, index: usize, progress: Option<&dyn ProgressCallback>) -> EngineResult<()> {
        let src = self.src_path(index);
        let dst_dir = self.dst_parent(index);
        self.nodes[index].state = NodeState::Working;
        if let Some(callback) = progress {
            let target = dst_dir.join(&self.nodes[index].target_name);
            callback.on_node_started(self, &self.nodes[index], &src, &target);
        }

        let result = self.perform(index, &src, &dst_dir, progress);
        let fatal = match result {
            Ok(state) => {
                self.nodes[index].state = state;
                None
            }
            Err(e) => {
                debug!("{} failed: {}", src.display(), e);
                self.nodes[index].state = failed(&e);
                e.is_fatal().then_some(e)
            }
        };
        trace!("node {} -> {:?}", self.nodes[index].uuid, self.nodes[index].state);
        if let Some(callback) = progress {
            callback.on_node_completed(self, &self.nodes[index]);
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Kind and identity of whatever holds `target`, if anything.
    fn occupant(&self, target: &Path) -> EngineResult<Option<(EntryKind, Option<Uuid>)>> {
        match self.store.read(target) {
            Ok(xstat) => Ok(Some((xstat.kind, Some(xstat.uuid)))),
            Err(EngineError::NotFound { .. }) => Ok(None),
            Err(EngineError::Unsupported { .. }) => Ok(Some((EntryKind::File, None))),
            Err(e) => Err(e),
        }
    }

    fn perform(
        &mut self,
        index: usize,
        src: &Path,
        dst_dir: &Path,
        progress: Option<&dyn ProgressCallback>,
    ) -> EngineResult<NodeState> {
        let (kind, expected) = (self.nodes[index].kind, self.nodes[index].source_uuid);
        let source = match self.store.read(src) {
            Ok(xstat) => Some(xstat),
            Err(EngineError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let source = match source {
            Some(xstat) if xstat.uuid == expected => xstat,
            other => {
                let actual = other.map(|x| x.uuid);
                let policies = match actual {
                    Some(_) => vec![Policy::Skip, Policy::Replace],
                    None => vec![Policy::Skip],
                };
                return Ok(NodeState::Conflict(Conflict {
                    reason: ConflictReason::IdentityChanged { expected, actual },
                    policies,
                }));
            }
        };

        let target = dst_dir.join(&self.nodes[index].target_name);
        let Some((dest_kind, dest_uuid)) = self.occupant(&target)? else {
            return self.transfer(index, src, &source, dst_dir, None, progress);
        };

        let node = &self.nodes[index];
        let legal = legal_policies(kind, dest_kind);
        let policy = node
            .policy
            .filter(|_| node.dest_uuid == dest_uuid)
            .or_else(|| self.policies.get(kind, dest_kind))
            .filter(|p| legal.contains(p));
        let Some(policy) = policy else {
            return Ok(NodeState::Conflict(Conflict {
                reason: ConflictReason::NameTaken { dest_kind, dest_uuid },
                policies: legal,
            }));
        };

        debug!("{} onto existing {}: {}", src.display(), dest_kind, policy);
        match policy {
            Policy::Skip => Ok(done(Outcome::Skipped)),
            Policy::Keep if kind == EntryKind::File => Ok(done(Outcome::Kept)),
            Policy::Keep => {
                self.enqueue_children(index, src)?;
                if self.mode == Mode::Move {
                    self.merged.push(index);
                }
                Ok(done(Outcome::Merged))
            }
            Policy::Replace => self.transfer(index, src, &source, dst_dir, Some(dest_kind), progress),
            Policy::Rename => {
                let name = auto_name(&self.nodes[index].target_name, |n| {
                    fs::symlink_metadata(dst_dir.join(n)).is_ok()
                });
                self.nodes[index].target_name = name;
                self.transfer(index, src, &source, dst_dir, None, progress)
            }
        }
    }

    /// Remove an entry (and the identities under it) at the destination.
    fn discard(&self, target: &Path, kind: EntryKind) -> EngineResult<()> {
        self.store.forget(target)?;
        fs_ops::remove_entry(target, kind)
    }

    fn transfer(
        &mut self,
        index: usize,
        src: &Path,
        source: &Xstat,
        dst_dir: &Path,
        replacing: Option<EntryKind>,
        progress: Option<&dyn ProgressCallback>,
    ) -> EngineResult<NodeState> {
        let target = dst_dir.join(&self.nodes[index].target_name);
        match (self.mode, source.kind) {
            (Mode::Copy, EntryKind::File) => self.copy_file(index, src, source, dst_dir, &target, replacing, progress),
            (Mode::Copy, EntryKind::Directory) => {
                if let Some(kind) = replacing {
                    self.discard(&target, kind)?;
                }
                fs::create_dir(&target).map_err(|e| EngineError::io(&target, e))?;
                self.store.forget(&target)?;
                let created = self.store.force_assign(&target, Some(Uuid::new_v4()))?;
                trace!("created {} as {}", target.display(), created.uuid);
                self.enqueue_children(index, src)?;
                Ok(done(Outcome::Transferred))
            }
            (Mode::Move, _) => {
                match replacing {
                    Some(kind) => self.discard(&target, kind)?,
                    None if fs::symlink_metadata(&target).is_ok() => {
                        return Err(EngineError::AlreadyExists { path: target });
                    }
                    None => {}
                }
                fs::rename(src, &target).map_err(|e| EngineError::io(&target, e))?;
                Ok(done(Outcome::Transferred))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file(
        &mut self,
        index: usize,
        src: &Path,
        source: &Xstat,
        dst_dir: &Path,
        target: &Path,
        replacing: Option<EntryKind>,
        progress: Option<&dyn ProgressCallback>,
    ) -> EngineResult<NodeState> {
        let tmp = fs_ops::temp_path(dst_dir);
        let copied = {
            let node = &self.nodes[index];
            let this = &*self;
            fs_ops::copy_file_verified(src, &tmp, self.verify, |bytes| {
                if let Some(callback) = progress {
                    callback.on_node_progress(this, node, bytes);
                }
            })
        };
        let result = copied.and_then(|report| {
            self.nodes[index].bytes = report.bytes;
            self.publish_copy(src, source, &tmp, target, replacing)
        });
        fs_ops::discard_temp(&tmp);
        result
    }

    fn publish_copy(
        &self,
        src: &Path,
        source: &Xstat,
        tmp: &Path,
        target: &Path,
        replacing: Option<EntryKind>,
    ) -> EngineResult<NodeState> {
        let after = fs_ops::lstat(src)?;
        if fs_ops::mtime_nanos(&after) != source.mtime || after.len() != source.size {
            return Err(EngineError::ContentChanged {
                path: src.to_path_buf(),
            });
        }

        self.store.forget(tmp)?;
        let copy = self.store.force_assign(tmp, Some(Uuid::new_v4()))?;
        if let Some(hash) = source.hash {
            self.store.update_hash(tmp, copy.uuid, hash, source.magic, copy.mtime)?;
        }

        if let Some(kind) = replacing {
            self.discard(target, kind)?;
        }
        match fs_ops::publish_no_replace(tmp, target) {
            Ok(()) => Ok(done(Outcome::Transferred)),
            Err(EngineError::AlreadyExists { .. }) => {
                // someone else took the name while we copied
                self.store.forget(tmp)?;
                let (dest_kind, dest_uuid) = self.occupant(target)?.unwrap_or((EntryKind::File, None));
                Ok(NodeState::Conflict(Conflict {
                    reason: ConflictReason::NameTaken { dest_kind, dest_uuid },
                    policies: legal_policies(source.kind, dest_kind),
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Remove merged source directories that the move left empty, deepest first.
    fn remove_emptied_dirs(&mut self) {
        for &index in self.merged.iter().rev() {
            if self.nodes[index].state != done(Outcome::Merged) {
                continue;
            }
            let src = self.src_path(index);
            match fs_ops::list_dir(&src) {
                Ok(names) if names.is_empty() => {}
                _ => continue,
            }
            let removed = self
                .store
                .forget(&src)
                .and_then(|_| fs::remove_dir(&src).map_err(|e| EngineError::io(&src, e)));
            match removed {
                Ok(()) => debug!("removed emptied directory {}", src.display()),
                Err(EngineError::NotFound { .. }) => {}
                Err(e) if e.raw_os_error() == Some(ENOTEMPTY) => {}
                Err(e) => warn!("cannot remove {}: {}", src.display(), e),
            }
        }
    }

    /// Resolve a conflicted node with `policy`.
    ///
    /// With `apply_to_all` the policy also becomes the task-wide policy for
    /// the node's conflict class and resolves every other conflict of that
    /// class. Resolved nodes are re-queued; call `run` to process them.
    ///
    /// # Errors
    /// `ENONODE` for an unknown node, `ENOCONFLICT` when the node is not in
    /// conflict, `EINVALIDPOLICY` when `policy` is not legal for it.
    pub fn update_node(&mut self, node: Uuid, policy: Policy, apply_to_all: bool) -> EngineResult<()> {
        let index = self.index_of(node).ok_or(EngineError::NodeNotFound { uuid: node })?;
        let NodeState::Conflict(conflict) = self.nodes[index].state.clone() else {
            return Err(EngineError::NoConflict { node });
        };
        if !conflict.policies.contains(&policy) {
            return Err(EngineError::InvalidPolicy {
                policy,
                reason: format!(
                    "allowed here: {}",
                    conflict
                        .policies
                        .iter()
                        .map(Policy::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }

        match conflict.reason {
            ConflictReason::NameTaken { dest_kind, dest_uuid } => {
                self.resolve_name(index, policy, dest_uuid);
                if apply_to_all {
                    let kind = self.nodes[index].kind;
                    self.policies.set(kind, dest_kind, policy);
                    for other in 0..self.nodes.len() {
                        let same_class = match &self.nodes[other].state {
                            NodeState::Conflict(Conflict {
                                reason: ConflictReason::NameTaken { dest_kind: dk, dest_uuid: du },
                                ..
                            }) if self.nodes[other].kind == kind && *dk == dest_kind => Some(*du),
                            _ => None,
                        };
                        if let Some(du) = same_class {
                            self.resolve_name(other, policy, du);
                        }
                    }
                }
            }
            ConflictReason::IdentityChanged { .. } => {
                self.resolve_identity(index, policy);
                if apply_to_all {
                    for other in 0..self.nodes.len() {
                        let applies = matches!(
                            &self.nodes[other].state,
                            NodeState::Conflict(c)
                                if matches!(c.reason, ConflictReason::IdentityChanged { .. })
                                    && c.policies.contains(&policy)
                        );
                        if applies {
                            self.resolve_identity(other, policy);
                        }
                    }
                }
            }
        }
        if self.state == TaskState::Blocked {
            self.state = TaskState::Pending;
        }
        Ok(())
    }

    fn resolve_name(&mut self, index: usize, policy: Policy, dest_uuid: Option<Uuid>) {
        let node = &mut self.nodes[index];
        node.policy = Some(policy);
        node.dest_uuid = dest_uuid;
        node.state = NodeState::Pending;
        self.queue.push_back(index);
    }

    fn resolve_identity(&mut self, index: usize, policy: Policy) {
        if policy == Policy::Skip {
            self.nodes[index].state = done(Outcome::Skipped);
            return;
        }
        // accept whatever now sits at the source path
        let src = self.src_path(index);
        match self.store.read(&src) {
            Ok(xstat) => {
                let node = &mut self.nodes[index];
                node.source_uuid = xstat.uuid;
                node.kind = xstat.kind;
                node.state = NodeState::Pending;
                self.queue.push_back(index);
            }
            Err(e) => self.nodes[index].state = failed(&e),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("uuid", &self.uuid)
            .field("mode", &self.mode)
            .field("src_dir", &self.src_dir)
            .field("dst_dir", &self.dst_dir)
            .field("state", &self.state)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
