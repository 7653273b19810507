//! Execution targets.
//!
//! A [`Target`] decides what applying a task actually means. Tasks only
//! ever call the capability methods below; the three variants realize
//! them differently:
//!
//! - [`DirectTarget`]: perform the operation now, on this host.
//! - [`DryRunTarget`]: observe real state, but record mutations instead of
//!   performing them.
//! - [`ScriptTarget`]: append every operation to an ordered script that an
//!   independent process replays later (for example at first boot).

mod direct;
mod dryrun;
mod script;

pub use direct::DirectTarget;
pub use dryrun::{DryRunTarget, PlannedChange};
pub use script::{ScriptFormat, ScriptOp, ScriptTarget};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::environment::Environment;
use crate::core::task::TaskMap;

/// Errors raised by a target while realizing an operation.
#[derive(Debug, Error)]
pub enum TargetError {
    /// Filesystem access failed.
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A command could not be started.
    #[error("failed to spawn '{program}': {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A command did not finish in time.
    #[error("command '{program}' timed out after {after:?}")]
    CommandTimeout { program: String, after: Duration },

    /// The target cannot realize this kind of operation at all.
    #[error("{target} target does not support {operation}")]
    Unsupported {
        target: TargetKind,
        operation: String,
    },

    /// The target cannot observe existing state.
    #[error("existing state of '{0}' cannot be observed by this target")]
    Unobservable(String),

    /// A provisioner failed to bring a resource into existence.
    #[error("provisioning {resource} failed: {message}")]
    Provision {
        resource: String,
        message: String,
        transient: bool,
    },

    /// The accumulated output could not be rendered.
    #[error("render error: {0}")]
    Render(String),

    /// Internal target state lock was poisoned.
    #[error("target state lock poisoned")]
    LockPoisoned,
}

impl TargetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TargetError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a later attempt at the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TargetError::CommandTimeout { .. } => true,
            TargetError::Provision { transient, .. } => *transient,
            TargetError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Which realization strategy a target implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Direct,
    #[serde(rename = "dryrun")]
    DryRun,
    #[serde(rename = "script", alias = "cloudinit")]
    ScriptRender,
}

impl TargetKind {
    /// Whether tasks may probe real state before acting under this target.
    pub fn checks_existing(self) -> bool {
        !matches!(self, TargetKind::ScriptRender)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetKind::Direct => "direct",
            TargetKind::DryRun => "dryrun",
            TargetKind::ScriptRender => "script",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported target type '{0}' (expected direct, dryrun, cloudinit or script)")]
pub struct UnknownTargetKind(pub String);

impl FromStr for TargetKind {
    type Err = UnknownTargetKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(TargetKind::Direct),
            "dryrun" | "dry-run" => Ok(TargetKind::DryRun),
            "cloudinit" | "script" => Ok(TargetKind::ScriptRender),
            other => Err(UnknownTargetKind(other.to_string())),
        }
    }
}

/// A command to run through a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub env: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Side-effect free; a dry run may execute it to observe state.
    #[serde(default)]
    pub probe: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Environment::new(),
            working_dir: None,
            timeout: None,
            probe: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark the command as read-only.
    pub fn probe(mut self) -> Self {
        self.probe = true;
        self
    }

    /// The command line, shell-quoted.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A file whose full contents are desired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub mode: Option<u32>,
    pub owner: Option<String>,
}

impl FileSpec {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: None,
            owner: None,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// A directory that must exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySpec {
    pub path: PathBuf,
    pub mode: Option<u32>,
}

impl DirectorySpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: None,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Observed metadata of an existing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStat {
    pub is_dir: bool,
    /// Permission bits, `0o7777` mask.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl PathStat {
    /// Whether `mode`, when given, matches the observed permission bits.
    pub fn mode_matches(&self, mode: Option<u32>) -> bool {
        mode.is_none_or(|mode| self.mode == mode & 0o7777)
    }
}

/// An external resource (usually a cloud object) that must exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ResourceSpec {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Creates or updates an external resource; supplied by the task.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, spec: &ResourceSpec) -> Result<(), TargetError>;
}

/// The capability surface every target exposes to tasks.
#[async_trait]
pub trait Target: Send + Sync {
    fn kind(&self) -> TargetKind;

    /// Run a command. A non-zero exit is reported in the output, not as an error.
    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput, TargetError>;

    /// Ensure a file exists with exactly the given contents.
    async fn write_file(&self, file: &FileSpec) -> Result<(), TargetError>;

    /// Ensure a directory (and its parents) exists.
    async fn ensure_directory(&self, dir: &DirectorySpec) -> Result<(), TargetError>;

    /// Read the current contents of a file, `None` if it does not exist.
    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, TargetError>;

    /// Observe a path's type, mode and ownership, `None` if it does not exist.
    async fn stat(&self, path: &Path) -> Result<Option<PathStat>, TargetError>;

    /// Whether anything exists at `path`.
    async fn path_exists(&self, path: &Path) -> Result<bool, TargetError> {
        Ok(self.stat(path).await?.is_some())
    }

    /// Resolve a `user[:group]` owner to numeric ids as the target would
    /// apply it. `None` in either position means "not constrained".
    async fn resolve_owner(&self, owner: &str) -> Result<(Option<u32>, Option<u32>), TargetError>;

    /// Ensure an external resource exists.
    async fn ensure_resource(
        &self,
        spec: &ResourceSpec,
        provisioner: &dyn Provisioner,
    ) -> Result<(), TargetError>;

    /// Flush accumulated output. Called once after a successful run;
    /// calling it again has no further effect.
    async fn finish(&self, tasks: &TaskMap) -> Result<(), TargetError>;
}

/// Resolve an absolute node path under a filesystem root.
pub(crate) fn resolve_under(root: &Path, path: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if out != root {
                    out.pop();
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Quote a word for a POSIX shell.
pub(crate) fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
