//! Outcome of a successful run and per-task status.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::types::{RunId, TaskId};

/// Status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Not yet done; waiting on dependencies or retrying.
    Pending,
    /// An attempt is in progress.
    Running,
    /// Converged. Never reverts within a run.
    Done,
    /// Failed permanently; the run aborted.
    Failed,
}

/// Summary of a run in which every task converged.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    /// Passes over the task collection, including unproductive ones.
    pub passes: u32,
    /// Tasks in the order they reached Done.
    pub completed: Vec<TaskId>,
    /// Attempts made per task.
    pub attempts: BTreeMap<TaskId, u32>,
    pub duration: Duration,
}

impl RunReport {
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.values().sum()
    }

    /// Attempts made for one task, zero if it never ran.
    pub fn attempts_for(&self, id: &TaskId) -> u32 {
        self.attempts.get(id).copied().unwrap_or(0)
    }

    /// Tasks that needed more than one attempt.
    pub fn retried(&self) -> Vec<&TaskId> {
        self.attempts
            .iter()
            .filter(|(_, n)| **n > 1)
            .map(|(id, _)| id)
            .collect()
    }
}
