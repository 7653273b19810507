//! Container images preloaded onto the node.

use async_trait::async_trait;
use std::path::PathBuf;

use super::download::CachedDownload;
use crate::core::context::TaskContext;
use crate::core::deps::TaskRef;
use crate::core::task::{Task, TaskError};
use crate::target::CommandSpec;

/// Downloads an image tarball into the cache, verifies it and loads it
/// into the container runtime.
///
/// The hash selects the digest tool by length: 40 hex characters is SHA-1,
/// 64 is SHA-256.
#[derive(Debug, Clone)]
pub struct LoadImageTask {
    name: String,
    download: CachedDownload,
    references: Vec<TaskRef>,
}

impl LoadImageTask {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        hash: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            download: CachedDownload::new(source, hash, cache_dir),
            references: Vec::new(),
        }
    }

    pub fn depends_on(mut self, reference: TaskRef) -> Self {
        self.references.push(reference);
        self
    }

    pub fn source(&self) -> &str {
        self.download.source()
    }

    pub fn hash(&self) -> &str {
        self.download.hash()
    }

    /// Where the tarball is cached on the node.
    pub fn cached_path(&self) -> PathBuf {
        self.download.cached_path()
    }
}

#[async_trait]
impl Task for LoadImageTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.references.clone()
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        let path = self.download.ensure(ctx).await?;
        let path_arg = path.display().to_string();

        let load = ctx
            .target()
            .run_command(&CommandSpec::new("docker").args(["load", "-i", path_arg.as_str()]))
            .await?;
        if !load.success() {
            return Err(TaskError::CommandFailed {
                code: load.exit_code,
                stderr: load.stderr,
            });
        }
        Ok(())
    }
}
