//! Per-attempt context handed to [`Task::run`](super::task::Task::run).
//!
//! The context borrows everything from the convergence context that owns
//! the run: the active target, the collaborator handles and the
//! existing-state policy. Tasks cannot keep any of it past the attempt.

use super::handles::{CaStore, Cloud, Handles, SecretStore};
use super::types::TaskId;
use crate::target::Target;

/// What a task sees while it is being applied.
pub struct TaskContext<'a> {
    task_id: &'a TaskId,
    target: &'a dyn Target,
    check_existing: bool,
    handles: &'a Handles,
    attempt: u32,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        task_id: &'a TaskId,
        target: &'a dyn Target,
        check_existing: bool,
        handles: &'a Handles,
        attempt: u32,
    ) -> Self {
        Self {
            task_id,
            target,
            check_existing,
            handles,
            attempt,
        }
    }

    /// The target that realizes this task's effects.
    pub fn target(&self) -> &'a dyn Target {
        self.target
    }

    /// Whether the task may probe real state before acting.
    ///
    /// False when rendering for a host that does not exist yet; tasks must
    /// then emit unconditional, convergent operations.
    pub fn check_existing(&self) -> bool {
        self.check_existing
    }

    pub fn task_id(&self) -> &TaskId {
        self.task_id
    }

    /// 1 for the first attempt of this task in the run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cloud(&self) -> Option<&'a dyn Cloud> {
        self.handles.cloud()
    }

    pub fn ca_store(&self) -> Option<&'a dyn CaStore> {
        self.handles.ca_store()
    }

    pub fn secret_store(&self) -> Option<&'a dyn SecretStore> {
        self.handles.secret_store()
    }
}
