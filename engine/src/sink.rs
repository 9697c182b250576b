//! Batches of copy/move tasks.
//!
//! A sink takes an ordered list of `(drive, dir, name)` entries headed for one
//! destination directory, groups them by source directory in first-seen
//! order, and runs one `Task` per group. It advances to the next group only
//! when the current task has finished, so a conflict parks the whole batch
//! until it is resolved. Sinks share nothing but the identity store and can
//! run on separate threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{Mode, Policy, TaskState};
use crate::progress::ProgressCallback;
use crate::task::{AbortHandle, Task, TaskPolicies, TaskSummary};
use crate::xstat::IdentityStore;

/// One source entry of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub drive: Uuid,
    /// Directory holding the entry
    pub dir: Uuid,
    pub name: String,
}

/// Entries sharing a source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub drive: Uuid,
    pub dir: Uuid,
    pub path: PathBuf,
    pub names: Vec<String>,
}

/// Group `entries` by source directory, keeping first-seen order.
///
/// `resolve` maps a `(drive, dir)` pair to the directory's path; its errors
/// are returned unchanged.
pub fn group_entries<F>(entries: &[BatchEntry], mut resolve: F) -> EngineResult<Vec<Group>>
where
    F: FnMut(Uuid, Uuid) -> EngineResult<PathBuf>,
{
    let mut groups: Vec<Group> = Vec::new();
    for entry in entries {
        let existing = groups
            .iter_mut()
            .find(|g| g.drive == entry.drive && g.dir == entry.dir);
        match existing {
            Some(group) => {
                if !group.names.contains(&entry.name) {
                    group.names.push(entry.name.clone());
                }
            }
            None => groups.push(Group {
                drive: entry.drive,
                dir: entry.dir,
                path: resolve(entry.drive, entry.dir)?,
                names: vec![entry.name.clone()],
            }),
        }
    }
    Ok(groups)
}

/// What to do when a task fails structurally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureRule {
    /// Record the failure and move on to the next group
    Skip,
    /// Stop the batch until `retry_current` or `skip_current`
    #[default]
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SinkState {
    Pending,
    Running,
    /// The current task waits on conflicts
    Blocked,
    /// The current task failed and the rule is `Stop`
    Stopped { code: String, message: String },
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkSummary {
    pub uuid: Uuid,
    pub mode: Mode,
    pub destination: PathBuf,
    #[serde(flatten)]
    pub state: SinkState,
    pub groups: usize,
    pub tasks: Vec<TaskSummary>,
}

pub struct Sink {
    uuid: Uuid,
    mode: Mode,
    dst_dir: PathBuf,
    groups: Vec<Group>,
    next: usize,
    current: Option<Task>,
    finished: Vec<TaskSummary>,
    policies: TaskPolicies,
    on_failure: FailureRule,
    store: Arc<IdentityStore>,
    verify: bool,
    abort: AbortHandle,
    state: SinkState,
}

impl Sink {
    pub fn new(
        mode: Mode,
        groups: Vec<Group>,
        dst_dir: impl Into<PathBuf>,
        policies: TaskPolicies,
        on_failure: FailureRule,
        store: Arc<IdentityStore>,
    ) -> Self {
        Sink {
            uuid: Uuid::new_v4(),
            mode,
            dst_dir: dst_dir.into(),
            groups,
            next: 0,
            current: None,
            finished: Vec::new(),
            policies,
            on_failure,
            store,
            verify: true,
            abort: AbortHandle::new(),
            state: SinkState::Pending,
        }
    }

    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> &SinkState {
        &self.state
    }

    pub fn dst_dir(&self) -> &Path {
        &self.dst_dir
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current.as_ref()
    }

    /// Summaries of the completed tasks followed by the current one.
    pub fn summaries(&self) -> Vec<TaskSummary> {
        let mut all = self.finished.clone();
        all.extend(self.current.as_ref().map(Task::summary));
        all
    }

    pub fn summary(&self) -> SinkSummary {
        SinkSummary {
            uuid: self.uuid,
            mode: self.mode,
            destination: self.dst_dir.clone(),
            state: self.state.clone(),
            groups: self.groups.len(),
            tasks: self.summaries(),
        }
    }

    /// Handle that aborts the batch from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&mut self) {
        self.abort.abort();
        if let Some(task) = self.current.as_mut() {
            task.abort();
        }
        if !matches!(self.state, SinkState::Finished) {
            self.state = SinkState::Aborted;
        }
    }

    fn start_group(&mut self, index: usize) {
        let group = &self.groups[index];
        let mut task = Task::new(
            self.mode,
            &group.path,
            &self.dst_dir,
            &group.names,
            self.policies,
            Arc::clone(&self.store),
        );
        task.set_verify(self.verify);
        task.share_abort(self.abort.clone());
        info!(
            "sink {}: group {}/{} from {}",
            self.uuid,
            index + 1,
            self.groups.len(),
            group.path.display()
        );
        self.current = Some(task);
    }

    fn complete_current(&mut self) {
        if let Some(task) = self.current.take() {
            self.finished.push(task.summary());
        }
    }

    /// Run groups in order until the batch finishes or a task needs
    /// attention.
    pub fn run(&mut self, progress: Option<&dyn ProgressCallback>) -> &SinkState {
        if matches!(
            self.state,
            SinkState::Finished | SinkState::Aborted | SinkState::Stopped { .. }
        ) {
            return &self.state;
        }
        self.state = SinkState::Running;

        loop {
            if self.abort.is_aborted() {
                self.state = SinkState::Aborted;
                break;
            }
            if self.current.is_none() {
                if self.next >= self.groups.len() {
                    self.state = SinkState::Finished;
                    break;
                }
                self.start_group(self.next);
                self.next += 1;
            }
            let Some(task) = self.current.as_mut() else {
                break;
            };
            match task.run(progress).clone() {
                TaskState::Finished => self.complete_current(),
                TaskState::Aborted => {
                    self.state = SinkState::Aborted;
                    break;
                }
                TaskState::Failed { code, message } => match self.on_failure {
                    FailureRule::Skip => {
                        warn!("sink {}: skipping failed task ({}: {})", self.uuid, code, message);
                        self.complete_current();
                    }
                    FailureRule::Stop => {
                        warn!("sink {}: stopped ({}: {})", self.uuid, code, message);
                        self.state = SinkState::Stopped { code, message };
                        break;
                    }
                },
                TaskState::Blocked | TaskState::Pending | TaskState::Running => {
                    self.state = SinkState::Blocked;
                    break;
                }
            }
        }
        info!("sink {} {:?}", self.uuid, self.state);
        &self.state
    }

    /// Resolve a conflict in the current task.
    ///
    /// # Errors
    /// `ENOTASK` when `task` is not the current task, plus the errors of
    /// [`Task::update_node`].
    pub fn update_task_node(&mut self, task: Uuid, node: Uuid, policy: Policy, apply_to_all: bool) -> EngineResult<()> {
        let current = self
            .current
            .as_mut()
            .filter(|t| t.uuid() == task)
            .ok_or(EngineError::TaskNotFound { uuid: task })?;
        current.update_node(node, policy, apply_to_all)?;
        if self.state == SinkState::Blocked {
            self.state = SinkState::Pending;
        }
        Ok(())
    }

    /// Rebuild the stopped task from its group and resume the batch on the
    /// next `run`.
    pub fn retry_current(&mut self) -> EngineResult<()> {
        let uuid = self.current.as_ref().map(Task::uuid).unwrap_or_default();
        if !matches!(self.state, SinkState::Stopped { .. }) || self.current.is_none() {
            return Err(EngineError::TaskNotFound { uuid });
        }
        self.start_group(self.next - 1);
        self.state = SinkState::Pending;
        Ok(())
    }

    /// Give up on the current task (stopped or blocked) and resume with the
    /// next group on the next `run`.
    pub fn skip_current(&mut self) -> EngineResult<()> {
        let uuid = self.current.as_ref().map(Task::uuid).unwrap_or_default();
        if !matches!(self.state, SinkState::Stopped { .. } | SinkState::Blocked) || self.current.is_none() {
            return Err(EngineError::TaskNotFound { uuid });
        }
        self.complete_current();
        self.state = SinkState::Pending;
        Ok(())
    }
}
