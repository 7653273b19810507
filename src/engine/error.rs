//! Terminal errors of a convergence run.

use std::fmt;
use thiserror::Error;

use crate::core::graph::GraphError;
use crate::core::task::TaskError;
use crate::core::types::TaskId;
use crate::target::TargetError;

/// Why a task was still pending when the run gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallReason {
    /// Waiting on dependencies that never completed.
    Blocked { waiting_on: Vec<TaskId> },
    /// Ready, but every attempt failed transiently.
    Failing { attempts: u32, last_error: String },
}

/// A task left pending by a stagnant run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledTask {
    pub task: TaskId,
    pub reason: StallReason,
}

impl fmt::Display for StalledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            StallReason::Blocked { waiting_on } => {
                let names: Vec<&str> = waiting_on.iter().map(TaskId::as_str).collect();
                write!(f, "{} (waiting on {})", self.task, names.join(", "))
            }
            StallReason::Failing {
                attempts,
                last_error,
            } => write!(
                f,
                "{} (failed {attempts} attempt(s), last error: {last_error})",
                self.task
            ),
        }
    }
}

fn list_stalled(stalled: &[StalledTask]) -> String {
    stalled
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The single terminal error of a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The dependency graph is unusable; no task was run.
    #[error("invalid task graph: {0}")]
    Config(#[from] GraphError),

    /// A task failed permanently.
    #[error("task '{task}' failed: {source}")]
    TaskFailed {
        task: TaskId,
        #[source]
        source: TaskError,
    },

    /// The no-progress budget ran out with tasks still pending.
    #[error("not making progress after {passes} pass(es); pending: {}", list_stalled(.stalled))]
    Stagnation {
        passes: u32,
        stalled: Vec<StalledTask>,
    },

    /// Shutdown was requested between passes.
    #[error("run cancelled with {} task(s) pending", .pending.len())]
    Cancelled { pending: Vec<TaskId> },

    /// `finish` was called without a successful run.
    #[error("cannot finish: the last run did not converge")]
    NotConverged,

    /// The target failed to finalize.
    #[error("finishing target: {0}")]
    Target(#[from] TargetError),
}

impl RunError {
    /// Whether the error was detected before any task ran.
    pub fn is_config(&self) -> bool {
        matches!(self, RunError::Config(_))
    }

    /// Tasks the error names.
    pub fn tasks(&self) -> Vec<TaskId> {
        match self {
            RunError::Config(err) => err.tasks(),
            RunError::TaskFailed { task, .. } => vec![task.clone()],
            RunError::Stagnation { stalled, .. } => {
                stalled.iter().map(|s| s.task.clone()).collect()
            }
            RunError::Cancelled { pending } => pending.clone(),
            RunError::NotConverged | RunError::Target(_) => Vec::new(),
        }
    }
}
