//! Files and directories on the node.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::context::TaskContext;
use crate::core::deps::TaskRef;
use crate::core::task::{Task, TaskError};
use crate::target::{DirectorySpec, FileSpec, Target};

/// Ensures a file has exactly the given contents, mode and owner.
///
/// When existing state may be checked, a file that already matches on all
/// three is left alone; any drift rewrites the whole file.
#[derive(Debug, Clone)]
pub struct FileTask {
    name: String,
    spec: FileSpec,
    references: Vec<TaskRef>,
}

impl FileTask {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        contents: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            spec: FileSpec::new(path, contents),
            references: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.spec = self.spec.mode(mode);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.spec = self.spec.owner(owner);
        self
    }

    /// Add a reference to another task.
    pub fn depends_on(mut self, reference: TaskRef) -> Self {
        self.references.push(reference);
        self
    }

    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    async fn is_current(&self, target: &dyn Target) -> Result<bool, TaskError> {
        let current = target.read_file(&self.spec.path).await?;
        if current.as_deref() != Some(self.spec.contents.as_slice()) {
            return Ok(false);
        }
        if self.spec.mode.is_none() && self.spec.owner.is_none() {
            return Ok(true);
        }
        let Some(stat) = target.stat(&self.spec.path).await? else {
            return Ok(false);
        };
        if !stat.mode_matches(self.spec.mode) {
            debug!(
                path = %self.spec.path.display(),
                mode = format!("{:04o}", stat.mode),
                "file mode drifted"
            );
            return Ok(false);
        }
        if let Some(owner) = &self.spec.owner {
            let (uid, gid) = target.resolve_owner(owner).await?;
            if uid.is_some_and(|uid| uid != stat.uid) || gid.is_some_and(|gid| gid != stat.gid) {
                debug!(
                    path = %self.spec.path.display(),
                    uid = stat.uid,
                    gid = stat.gid,
                    "file owner drifted"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Task for FileTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.references.clone()
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        let target = ctx.target();
        if ctx.check_existing() && self.is_current(target).await? {
            debug!(path = %self.spec.path.display(), "file already up to date");
            return Ok(());
        }
        target.write_file(&self.spec).await?;
        Ok(())
    }
}

/// Ensures a directory exists.
#[derive(Debug, Clone)]
pub struct DirectoryTask {
    name: String,
    spec: DirectorySpec,
    references: Vec<TaskRef>,
}

impl DirectoryTask {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            spec: DirectorySpec::new(path),
            references: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.spec = self.spec.mode(mode);
        self
    }

    pub fn depends_on(mut self, reference: TaskRef) -> Self {
        self.references.push(reference);
        self
    }

    pub fn path(&self) -> &Path {
        &self.spec.path
    }
}

#[async_trait]
impl Task for DirectoryTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.references.clone()
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        ctx.target().ensure_directory(&self.spec).await?;
        Ok(())
    }
}
