//! Dry-run target: decide like Direct, change nothing.
//!
//! Reads go to the real filesystem so tasks make the same decisions they
//! would make for real. Every mutating request is recorded as a
//! [`PlannedChange`] and reported when the target is finished.

use async_trait::async_trait;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::direct::{execute, read_existing, resolve_owner_ids, stat_existing};
use super::{
    CommandOutput, CommandSpec, DirectorySpec, FileSpec, PathStat, Provisioner, ResourceSpec,
    Target, TargetError, TargetKind, resolve_under,
};
use crate::core::task::TaskMap;

/// A mutation a dry run would have performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedChange {
    WriteFile {
        path: PathBuf,
        bytes: usize,
        mode: Option<u32>,
        /// Whether a file already existed at the path.
        replaces: bool,
    },
    CreateDirectory {
        path: PathBuf,
    },
    SetMode {
        path: PathBuf,
        from: u32,
        to: u32,
    },
    RunCommand {
        command_line: String,
    },
    EnsureResource {
        resource: String,
    },
}

impl fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedChange::WriteFile {
                path,
                bytes,
                mode,
                replaces,
            } => {
                let verb = if *replaces { "update" } else { "create" };
                write!(f, "{verb} file {} ({bytes} bytes", path.display())?;
                if let Some(mode) = mode {
                    write!(f, ", mode {mode:04o}")?;
                }
                write!(f, ")")
            }
            PlannedChange::CreateDirectory { path } => {
                write!(f, "create directory {}", path.display())
            }
            PlannedChange::SetMode { path, from, to } => {
                write!(f, "change mode of {} from {from:04o} to {to:04o}", path.display())
            }
            PlannedChange::RunCommand { command_line } => write!(f, "run {command_line}"),
            PlannedChange::EnsureResource { resource } => write!(f, "ensure {resource}"),
        }
    }
}

struct DryRunState {
    changes: Vec<PlannedChange>,
    out: Box<dyn Write + Send>,
    finished: bool,
}

/// Records what would change instead of changing it.
pub struct DryRunTarget {
    fs_root: PathBuf,
    state: Mutex<DryRunState>,
}

impl DryRunTarget {
    /// `out` receives the change report when the target is finished.
    pub fn new(fs_root: impl Into<PathBuf>, out: impl Write + Send + 'static) -> Self {
        Self {
            fs_root: fs_root.into(),
            state: Mutex::new(DryRunState {
                changes: Vec::new(),
                out: Box::new(out),
                finished: false,
            }),
        }
    }

    /// Changes recorded so far, in request order.
    pub fn changes(&self) -> Result<Vec<PlannedChange>, TargetError> {
        let state = self.state.lock().map_err(|_| TargetError::LockPoisoned)?;
        Ok(state.changes.clone())
    }

    /// The report `finish` writes.
    pub fn report(&self) -> Result<String, TargetError> {
        let state = self.state.lock().map_err(|_| TargetError::LockPoisoned)?;
        Ok(render_report(&state.changes))
    }

    fn record(&self, change: PlannedChange) -> Result<(), TargetError> {
        debug!(change = %change, "dry run: recording change");
        let mut state = self.state.lock().map_err(|_| TargetError::LockPoisoned)?;
        state.changes.push(change);
        Ok(())
    }
}

fn render_report(changes: &[PlannedChange]) -> String {
    if changes.is_empty() {
        return "No changes.\n".to_string();
    }
    let mut out = format!("Will make {} change(s):\n", changes.len());
    for change in changes {
        out.push_str("  ");
        out.push_str(&change.to_string());
        out.push('\n');
    }
    out
}

#[async_trait]
impl Target for DryRunTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::DryRun
    }

    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput, TargetError> {
        if command.probe {
            return execute(command).await;
        }
        self.record(PlannedChange::RunCommand {
            command_line: command.command_line(),
        })?;
        Ok(CommandOutput::default())
    }

    async fn write_file(&self, file: &FileSpec) -> Result<(), TargetError> {
        let replaces = read_existing(&resolve_under(&self.fs_root, &file.path))
            .await?
            .is_some();
        self.record(PlannedChange::WriteFile {
            path: file.path.clone(),
            bytes: file.contents.len(),
            mode: file.mode,
            replaces,
        })
    }

    async fn ensure_directory(&self, dir: &DirectorySpec) -> Result<(), TargetError> {
        let existing = stat_existing(&resolve_under(&self.fs_root, &dir.path))
            .await?
            .filter(|stat| stat.is_dir);
        match (existing, dir.mode) {
            (None, _) => self.record(PlannedChange::CreateDirectory {
                path: dir.path.clone(),
            }),
            (Some(stat), Some(mode)) if !stat.mode_matches(Some(mode)) => {
                self.record(PlannedChange::SetMode {
                    path: dir.path.clone(),
                    from: stat.mode,
                    to: mode & 0o7777,
                })
            }
            (Some(_), _) => Ok(()),
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, TargetError> {
        read_existing(&resolve_under(&self.fs_root, path)).await
    }

    async fn stat(&self, path: &Path) -> Result<Option<PathStat>, TargetError> {
        stat_existing(&resolve_under(&self.fs_root, path)).await
    }

    async fn resolve_owner(&self, owner: &str) -> Result<(Option<u32>, Option<u32>), TargetError> {
        resolve_owner_ids(owner).await
    }

    async fn ensure_resource(
        &self,
        spec: &ResourceSpec,
        _provisioner: &dyn Provisioner,
    ) -> Result<(), TargetError> {
        self.record(PlannedChange::EnsureResource {
            resource: spec.to_string(),
        })
    }

    async fn finish(&self, _tasks: &TaskMap) -> Result<(), TargetError> {
        let mut state = self.state.lock().map_err(|_| TargetError::LockPoisoned)?;
        if state.finished {
            return Ok(());
        }
        let report = render_report(&state.changes);
        state
            .out
            .write_all(report.as_bytes())
            .and_then(|_| state.out.flush())
            .map_err(|e| TargetError::io("<dry-run report>", e))?;
        state.finished = true;
        Ok(())
    }
}
