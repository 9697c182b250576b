//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the
//! copy/move engine from whatever front end is watching it (CLI, service,
//! tests).

use std::path::Path;

use crate::task::{Task, TaskNode};

/// Trait for receiving progress updates from a copy/move task.
///
/// All methods are called synchronously on the thread running the task.
/// Every method has an empty default so implementors pick what they need.
pub trait ProgressCallback: Send + Sync {
    /// Called when a task starts (or resumes after conflicts were resolved).
    fn on_task_started(&self, _task: &Task) {}

    /// Called before a node's filesystem operation, with the source and the
    /// destination path it is headed for.
    fn on_node_started(&self, _task: &Task, _node: &TaskNode, _src: &Path, _dst: &Path) {}

    /// Called as bytes are copied for the current file.
    fn on_node_progress(&self, _task: &Task, _node: &TaskNode, _bytes: u64) {}

    /// Called when a node settles (done, conflict or failed).
    fn on_node_completed(&self, _task: &Task, _node: &TaskNode) {}

    /// Called when the task stops running, whatever the reason.
    fn on_task_completed(&self, _task: &Task) {}
}
