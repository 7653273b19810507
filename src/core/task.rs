//! Task trait, task collection, and error types.
//!
//! The `Task` trait is the unit of desired state the engine converges.
//! Implement this trait to describe a piece of node or cloud configuration.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::context::TaskContext;
use super::deps::TaskRef;
use super::types::TaskId;
use crate::target::TargetError;

/// Errors that can occur while applying a task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A transient condition; a later pass may succeed.
    #[error("transient error: {0}")]
    Transient(String),

    /// The task timed out.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The task failed and retrying will not help.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// A command run through the target exited unsuccessfully.
    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    /// The target refused or failed an operation.
    #[error(transparent)]
    Target(#[from] TargetError),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Check if this error is transient (the run loop leaves the task Pending).
    pub fn is_transient(&self) -> bool {
        match self {
            TaskError::Transient(_) | TaskError::Timeout(_) => true,
            TaskError::Target(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// The core trait for describing desired state.
///
/// `run` must be idempotent: a task interrupted part way through is run
/// again on a later pass (or a later invocation) and must repair whatever
/// it left behind. All side effects go through the target in the context;
/// a task never asks which target variant it is talking to.
///
/// # Example
///
/// ```no_run
/// use converge::{FileSpec, References, Task, TaskContext, TaskError, TaskRef};
/// use async_trait::async_trait;
///
/// struct KubeletConfig {
///     name: String,
///     directory: TaskRef,
/// }
///
/// #[async_trait]
/// impl Task for KubeletConfig {
///     fn name(&self) -> &str {
///         &self.name
///     }
///
///     fn references(&self) -> Vec<TaskRef> {
///         References::new().field(&self.directory).build()
///     }
///
///     async fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
///         ctx.target()
///             .write_file(&FileSpec::new("/etc/kubernetes/kubelet.conf", "..."))
///             .await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// The unique name of this task within its collection.
    fn name(&self) -> &str;

    /// References to other tasks held by this task's fields.
    ///
    /// Default implementation declares no references.
    fn references(&self) -> Vec<TaskRef> {
        Vec::new()
    }

    /// The tasks this task must wait on, given the whole collection.
    ///
    /// The default resolves [`references`](Self::references): strong
    /// references are always returned (an absent one is reported by the
    /// dependency graph), weak references only when present in `all`.
    fn dependencies(&self, all: &TaskMap) -> BTreeSet<TaskId> {
        self.references()
            .into_iter()
            .filter(|r| r.is_strong() || all.contains(r.id()))
            .map(|r| r.id().clone())
            .collect()
    }

    /// Converge this task's piece of state through the context's target.
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError>;

    /// Optional description for display/logging purposes.
    fn description(&self) -> Option<&str> {
        None
    }
}

/// A collection of tasks keyed by their unique names.
#[derive(Clone, Default)]
pub struct TaskMap {
    tasks: BTreeMap<TaskId, Arc<dyn Task>>,
}

/// Raised when two tasks in one collection share a name.
#[derive(Debug, Error)]
#[error("duplicate task: {0}")]
pub struct DuplicateTask(pub TaskId);

impl TaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection, rejecting duplicate names.
    pub fn from_tasks<I>(tasks: I) -> Result<Self, DuplicateTask>
    where
        I: IntoIterator<Item = Arc<dyn Task>>,
    {
        let mut map = Self::new();
        for task in tasks {
            map.insert(task)?;
        }
        Ok(map)
    }

    /// Add a task under its own name.
    pub fn insert(&mut self, task: Arc<dyn Task>) -> Result<(), DuplicateTask> {
        let id = TaskId::new(task.name());
        if self.tasks.contains_key(&id) {
            return Err(DuplicateTask(id));
        }
        self.tasks.insert(id, task);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&Arc<dyn Task>> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task names in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskId, &Arc<dyn Task>)> {
        self.tasks.iter()
    }
}

impl std::fmt::Debug for TaskMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tasks.keys()).finish()
    }
}
