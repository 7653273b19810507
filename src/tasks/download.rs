//! Verified downloads into the node's cache directory.
//!
//! The cache path is used both for the directory the target creates and
//! for the commands that fill it, so it must mean the same place to both.
//! Manifests guarantee that by only allowing downloads when `fs_root` is
//! `/` or when the work is rendered into a script.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::context::TaskContext;
use crate::core::deps::TaskRef;
use crate::core::task::{Task, TaskError};
use crate::target::{CommandSpec, DirectorySpec, Target};

/// A hashed remote file and where it lives in the cache.
#[derive(Debug, Clone)]
pub(crate) struct CachedDownload {
    source: String,
    hash: String,
    cache_dir: PathBuf,
}

impl CachedDownload {
    pub(crate) fn new(
        source: impl Into<String>,
        hash: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            hash: hash.into().to_ascii_lowercase(),
            cache_dir: cache_dir.into(),
        }
    }

    pub(crate) fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn hash(&self) -> &str {
        &self.hash
    }

    /// The source's file name under the cache directory, or the hash when
    /// the URL has none.
    pub(crate) fn cached_path(&self) -> PathBuf {
        let file = self
            .source
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.tar", self.hash));
        self.cache_dir.join(file)
    }

    /// 40 hex characters is SHA-1, 64 is SHA-256.
    pub(crate) fn digest_tool(&self) -> Result<&'static str, TaskError> {
        match self.hash.len() {
            40 => Ok("sha1sum"),
            64 => Ok("sha256sum"),
            n => Err(TaskError::ExecutionFailed(format!(
                "hash for {} has unsupported length {n}",
                self.source
            ))),
        }
    }

    fn verify_command(&self, tool: &str, path: &Path) -> CommandSpec {
        let line = format!("{}  {}", self.hash, path.display());
        CommandSpec::new("sh").args([
            "-c".to_string(),
            format!("echo \"$1\" | {tool} -c --status -"),
            "verify".to_string(),
            line,
        ])
    }

    /// Make sure a verified copy is in the cache and return its path.
    ///
    /// A valid cached copy is reused when existing state may be checked.
    /// Download and verification failures are transient.
    pub(crate) async fn ensure(&self, ctx: &TaskContext<'_>) -> Result<PathBuf, TaskError> {
        let target = ctx.target();
        let tool = self.digest_tool()?;
        let path = self.cached_path();

        if ctx.check_existing() && self.is_cached(target, tool, &path).await? {
            debug!(path = %path.display(), "already in cache");
            return Ok(path);
        }

        target
            .ensure_directory(&DirectorySpec::new(&self.cache_dir))
            .await?;
        let path_arg = path.display().to_string();
        let download = target
            .run_command(&CommandSpec::new("curl").args([
                "-fsSL",
                "--retry",
                "3",
                "-o",
                path_arg.as_str(),
                self.source.as_str(),
            ]))
            .await?;
        if !download.success() {
            return Err(TaskError::Transient(format!(
                "downloading {} failed: {}",
                self.source,
                download.stderr.trim()
            )));
        }
        let verify = target.run_command(&self.verify_command(tool, &path)).await?;
        if !verify.success() {
            return Err(TaskError::Transient(format!(
                "downloaded {} does not match hash {}",
                self.source, self.hash
            )));
        }
        Ok(path)
    }

    async fn is_cached(
        &self,
        target: &dyn Target,
        tool: &str,
        path: &Path,
    ) -> Result<bool, TaskError> {
        if !target.path_exists(path).await? {
            return Ok(false);
        }
        let output = target
            .run_command(&self.verify_command(tool, path).probe())
            .await?;
        Ok(output.success())
    }
}

/// Fetches a hashed asset into the cache directory for other tasks to use.
#[derive(Debug, Clone)]
pub struct FetchAssetTask {
    name: String,
    download: CachedDownload,
    references: Vec<TaskRef>,
}

impl FetchAssetTask {
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

    /// Where the asset is cached on the node.
    pub fn cached_path(&self) -> PathBuf {
        self.download.cached_path()
    }
}

#[async_trait]
impl Task for FetchAssetTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> Vec<TaskRef> {
        self.references.clone()
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        self.download.ensure(ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handles::Handles;
    use crate::core::types::TaskId;
    use crate::target::{DryRunTarget, PlannedChange, ScriptFormat, ScriptTarget};
    use tempfile::TempDir;

    /// SHA-256 of the empty string.
    const EMPTY_SHA256: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    async fn apply(task: &dyn Task, target: &dyn Target, check_existing: bool) {
        let id = TaskId::new(task.name());
        let handles = Handles::new();
        let ctx = TaskContext::new(&id, target, check_existing, &handles, 1);
        task.run(&ctx).await.unwrap();
    }

    #[test]
    fn test_digest_tool_by_hash_length() {
        let sha1 = CachedDownload::new("https://e.com/a", "A".repeat(40), "/c");
        let sha256 = CachedDownload::new("https://e.com/a", EMPTY_SHA256, "/c");
        let short = CachedDownload::new("https://e.com/a", "abc", "/c");

        assert_eq!(sha1.digest_tool().unwrap(), "sha1sum");
        assert_eq!(sha1.hash(), "a".repeat(40));
        assert_eq!(sha256.digest_tool().unwrap(), "sha256sum");
        assert!(!short.digest_tool().unwrap_err().is_transient());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_valid_cached_asset_is_not_fetched_again() {
        let cache = TempDir::new().unwrap();
        std::fs::write(cache.path().join("cni.tgz"), "").unwrap();
        let target = DryRunTarget::new("/", Vec::new());
        let task = FetchAssetTask::new(
            "Asset.0",
            "https://example.com/cni.tgz",
            EMPTY_SHA256,
            cache.path(),
        );

        apply(&task, &target, true).await;

        assert!(target.changes().unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_corrupt_cached_asset_is_fetched() {
        let cache = TempDir::new().unwrap();
        std::fs::write(cache.path().join("cni.tgz"), "truncated").unwrap();
        let target = DryRunTarget::new("/", Vec::new());
        let task = FetchAssetTask::new(
            "Asset.0",
            "https://example.com/cni.tgz",
            EMPTY_SHA256,
            cache.path(),
        );

        apply(&task, &target, true).await;

        let changes = target.changes().unwrap();
        assert_eq!(changes.len(), 2);
        assert!(matches!(
            &changes[0],
            PlannedChange::RunCommand { command_line } if command_line.starts_with("curl -fsSL")
        ));
        assert!(changes[1].to_string().contains("sha256sum -c --status -"));
    }

    #[tokio::test]
    async fn test_script_render_fetches_unconditionally() {
        let target = ScriptTarget::new(ScriptFormat::Shell, Vec::new());
        let task = FetchAssetTask::new(
            "Asset.0",
            "https://example.com/cni.tgz",
            EMPTY_SHA256,
            "/var/cache/converge",
        );

        apply(&task, &target, false).await;

        let script = target.render().unwrap();
        assert!(script.contains("mkdir -p /var/cache/converge"));
        assert!(script.contains("-o /var/cache/converge/cni.tgz https://example.com/cni.tgz"));
        assert!(!script.contains("docker"));
        assert_eq!(
            task.cached_path(),
            PathBuf::from("/var/cache/converge/cni.tgz")
        );
    }
}
