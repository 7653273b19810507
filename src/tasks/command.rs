//! External command task.
//!
//! [`CommandTask`] runs a program through the active target. A command is
//! only idempotent if it is written that way; give it a `creates` path to
//! let it be skipped once its output exists.
//!
//! ```rust
//! use converge::tasks::CommandTask;
//! use std::time::Duration;
//!
//! let task = CommandTask::builder("kubeadm")
//!     .name("kubeadm-join")
//!     .args(["join", "--config", "/etc/kubernetes/join.yaml"])
//!     .env("KUBECONFIG", "/etc/kubernetes/admin.conf")
//!     .timeout(Duration::from_secs(300))
//!     .creates("/etc/kubernetes/kubelet.conf")
//!     .build();
//! ```
//!
//! A non-zero exit is a permanent [`TaskError::CommandFailed`]; a timeout
//! is transient and the command is tried again on the next pass.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::core::context::TaskContext;
use crate::core::deps::TaskRef;
use crate::core::environment::Environment;
use crate::core::task::{Task, TaskError};
use crate::target::CommandSpec;

/// A task that runs an external command through the target.
#[derive(Debug, Clone)]
pub struct CommandTask {
    name: String,
    command: CommandSpec,
    creates: Option<PathBuf>,
    references: Vec<TaskRef>,
}

impl CommandTask {
    /// Create a new builder for a command task.
    pub fn builder(program: impl Into<String>) -> CommandTaskBuilder {
        CommandTaskBuilder::new(program)
    }

    pub fn program(&self) -> &str {
        &self.command.program
    }

    pub fn args(&self) -> &[String] {
        &self.command.args
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.command.working_dir.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.command.timeout
    }

    /// Path whose existence means the command has already run.
    pub fn creates(&self) -> Option<&PathBuf> {
        self.creates.as_ref()
    }
}

#[async_trait]
impl Task for CommandTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.references.clone()
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        let target = ctx.target();
        if let (true, Some(path)) = (ctx.check_existing(), &self.creates) {
            if target.path_exists(path).await? {
                debug!(path = %path.display(), "output exists, skipping command");
                return Ok(());
            }
        }

        let output = target.run_command(&self.command).await?;
        if output.success() {
            Ok(())
        } else {
            Err(TaskError::CommandFailed {
                code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }
}

/// Builder for creating `CommandTask` instances.
#[derive(Debug, Clone)]
pub struct CommandTaskBuilder {
    name: Option<String>,
    command: CommandSpec,
    creates: Option<PathBuf>,
    references: Vec<TaskRef>,
}

impl CommandTaskBuilder {
    /// Create a new builder with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            name: None,
            command: CommandSpec::new(program),
            creates: None,
            references: Vec::new(),
        }
    }

    /// Set the task name. Defaults to the program.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.command = self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = self.command.args(args);
        self
    }

    /// Replace the environment.
    pub fn environment(mut self, env: Environment) -> Self {
        self.command.env = env;
        self
    }

    /// Add a single environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.env.set(key, value);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.command = self.command.working_dir(dir);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.command = self.command.timeout(duration);
        self
    }

    /// Skip the command when this path already exists.
    pub fn creates(mut self, path: impl Into<PathBuf>) -> Self {
        self.creates = Some(path.into());
        self
    }

    pub fn depends_on(mut self, reference: TaskRef) -> Self {
        self.references.push(reference);
        self
    }

    /// Build the `CommandTask`.
    pub fn build(self) -> CommandTask {
        let name = self.name.unwrap_or_else(|| self.command.program.clone());
        CommandTask {
            name,
            command: self.command,
            creates: self.creates,
            references: self.references,
        }
    }
}
