//! converge - a dependency-aware convergence engine for node provisioning.
//!
//! Tasks declare what they depend on; the engine runs them in repeated
//! passes until everything is done, the no-progress budget runs out, or a
//! task fails permanently. Every side effect goes through a [`Target`],
//! which either applies it, previews it or renders it into a script.
//!
//! ```rust
//! use converge::testing::{RunLog, StubTask};
//! use converge::{ConvergenceContext, DirectTarget, RunOptions, Task, TaskMap};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), converge::RunError> {
//! let log = RunLog::new();
//! let tasks: Vec<Arc<dyn Task>> = vec![
//!     Arc::new(StubTask::new("network").logging_to(&log)),
//!     Arc::new(StubTask::new("kubelet").depends_on("network").logging_to(&log)),
//! ];
//! let tasks = TaskMap::from_tasks(tasks).unwrap();
//!
//! let target = Box::new(DirectTarget::new("/"));
//! let mut ctx = ConvergenceContext::new(target, true, RunOptions::default());
//! let report = ctx.run_tasks(&tasks).await?;
//!
//! assert_eq!(report.passes, 2);
//! assert_eq!(log.entries(), vec!["network", "kubelet"]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod events;
pub mod target;
pub mod tasks;
pub mod testing;

pub use config::{ConfigError, ManifestLoader, NodeConfig};
pub use core::budget::{BudgetError, ProgressBudget};
pub use core::context::TaskContext;
pub use core::deps::{IntoReferences, RefKind, References, TaskRef};
pub use core::environment::Environment;
pub use core::graph::{DependencyGraph, GraphError};
pub use core::handles::{CaStore, Cloud, Handles, SecretStore};
pub use core::task::{DuplicateTask, Task, TaskError, TaskMap};
pub use core::types::{RunId, TaskId};
pub use engine::{ConvergenceContext, RunError, RunOptions, RunReport, StallReason, TaskStatus};
pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use target::{
    CommandOutput, CommandSpec, DirectTarget, DirectorySpec, DryRunTarget, FileSpec, PathStat,
    PlannedChange, ResourceSpec, ScriptFormat, ScriptTarget, Target, TargetError, TargetKind,
};
