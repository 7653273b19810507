//! Direct target: apply every operation immediately on this host.
//!
//! File operations are rooted at `fs_root`, so a node image mounted at
//! `/mnt/image` can be converged from outside. Commands run on the host.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{
    CommandOutput, CommandSpec, DirectorySpec, FileSpec, PathStat, Provisioner, ResourceSpec,
    Target, TargetError, TargetKind, resolve_under,
};
use crate::core::task::TaskMap;

/// Applies operations against the real environment.
#[derive(Debug)]
pub struct DirectTarget {
    fs_root: PathBuf,
    mutations: AtomicUsize,
}

impl DirectTarget {
    pub fn new(fs_root: impl Into<PathBuf>) -> Self {
        Self {
            fs_root: fs_root.into(),
            mutations: AtomicUsize::new(0),
        }
    }

    pub fn fs_root(&self) -> &Path {
        &self.fs_root
    }

    /// Number of mutating operations performed so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        resolve_under(&self.fs_root, path)
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Spawn a command and capture its output.
pub(crate) async fn execute(command: &CommandSpec) -> Result<CommandOutput, TargetError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    for (key, value) in command.env.iter() {
        cmd.env(key, value);
    }
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let spawn_error = |source| TargetError::CommandSpawn {
        program: command.program.clone(),
        source,
    };

    let output = match command.timeout {
        Some(after) => timeout(after, cmd.output())
            .await
            .map_err(|_| TargetError::CommandTimeout {
                program: command.program.clone(),
                after,
            })?
            .map_err(spawn_error)?,
        None => cmd.output().await.map_err(spawn_error)?,
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Read a file, mapping "not found" to `None`.
pub(crate) async fn read_existing(path: &Path) -> Result<Option<Vec<u8>>, TargetError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(TargetError::io(path, err)),
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), TargetError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| TargetError::io(path, e))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<(), TargetError> {
    Ok(())
}

/// Stat a path, mapping "not found" to `None`.
pub(crate) async fn stat_existing(path: &Path) -> Result<Option<PathStat>, TargetError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(TargetError::io(path, err)),
    };
    Ok(Some(path_stat(&meta)))
}

#[cfg(unix)]
fn path_stat(meta: &std::fs::Metadata) -> PathStat {
    use std::os::unix::fs::MetadataExt;
    PathStat {
        is_dir: meta.is_dir(),
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
    }
}

#[cfg(not(unix))]
fn path_stat(meta: &std::fs::Metadata) -> PathStat {
    PathStat {
        is_dir: meta.is_dir(),
        mode: 0,
        uid: 0,
        gid: 0,
    }
}

/// Resolve `user[:group]` to numeric ids the way `chown` on this host would.
pub(crate) async fn resolve_owner_ids(
    owner: &str,
) -> Result<(Option<u32>, Option<u32>), TargetError> {
    let (user, group) = match owner.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (owner, None),
    };
    let uid = match user {
        "" => None,
        name => Some(lookup_id(name, CommandSpec::new("id").args(["-u", name])).await?),
    };
    let gid = match group {
        None | Some("") => None,
        Some(name) => Some(lookup_id(name, CommandSpec::new("getent").args(["group", name])).await?),
    };
    Ok((uid, gid))
}

/// A numeric name is its own id; otherwise ask the host's user database.
/// Accepts both `id -u` output and a `getent` record.
async fn lookup_id(name: &str, query: CommandSpec) -> Result<u32, TargetError> {
    if let Ok(id) = name.parse() {
        return Ok(id);
    }
    let output = execute(&query.probe()).await?;
    let line = output.stdout.trim();
    let field = line.split(':').nth(2).unwrap_or(line);
    match field.parse() {
        Ok(id) if output.success() => Ok(id),
        _ => Err(TargetError::io(
            PathBuf::from(name),
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown user or group '{name}'"),
            ),
        )),
    }
}

async fn chown(path: &Path, owner: &str) -> Result<(), TargetError> {
    let command = CommandSpec::new("chown").arg(owner).arg(path.display().to_string());
    let output = execute(&command).await?;
    if output.success() {
        Ok(())
    } else {
        Err(TargetError::io(
            path,
            std::io::Error::other(format!("chown {owner} failed: {}", output.stderr.trim())),
        ))
    }
}

/// Write, chown and chmod a staging file so the rename publishes it complete.
async fn stage_file(staging: &Path, file: &FileSpec) -> Result<(), TargetError> {
    tokio::fs::write(staging, &file.contents)
        .await
        .map_err(|e| TargetError::io(staging, e))?;
    // chown may clear setuid bits, so it goes first
    if let Some(owner) = &file.owner {
        chown(staging, owner).await?;
    }
    if let Some(mode) = file.mode {
        set_mode(staging, mode).await?;
    }
    Ok(())
}

#[async_trait]
impl Target for DirectTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Direct
    }

    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput, TargetError> {
        debug!(command = %command.command_line(), "running command");
        let output = execute(command).await?;
        if !command.probe {
            self.record_mutation();
        }
        Ok(output)
    }

    async fn write_file(&self, file: &FileSpec) -> Result<(), TargetError> {
        let path = self.resolve(&file.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TargetError::io(parent, e))?;
        }

        // staged beside the destination; rename within one filesystem is atomic
        let mut staging = path.clone().into_os_string();
        staging.push(".converge-tmp");
        let staging = PathBuf::from(staging);
        let staged = match stage_file(&staging, file).await {
            Ok(()) => tokio::fs::rename(&staging, &path)
                .await
                .map_err(|e| TargetError::io(&path, e)),
            Err(err) => Err(err),
        };
        if let Err(err) = staged {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }

        debug!(path = %path.display(), bytes = file.contents.len(), "wrote file");
        self.record_mutation();
        Ok(())
    }

    async fn ensure_directory(&self, dir: &DirectorySpec) -> Result<(), TargetError> {
        let path = self.resolve(&dir.path);
        let existing = stat_existing(&path).await?.filter(|stat| stat.is_dir);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| TargetError::io(&path, e))?;

        let chmod = match (existing, dir.mode) {
            (Some(stat), mode) => !stat.mode_matches(mode),
            (None, mode) => mode.is_some(),
        };
        if let (true, Some(mode)) = (chmod, dir.mode) {
            set_mode(&path, mode).await?;
        }
        if existing.is_none() || chmod {
            self.record_mutation();
        }
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, TargetError> {
        read_existing(&self.resolve(path)).await
    }

    async fn stat(&self, path: &Path) -> Result<Option<PathStat>, TargetError> {
        stat_existing(&self.resolve(path)).await
    }

    async fn resolve_owner(&self, owner: &str) -> Result<(Option<u32>, Option<u32>), TargetError> {
        resolve_owner_ids(owner).await
    }

    async fn ensure_resource(
        &self,
        spec: &ResourceSpec,
        provisioner: &dyn Provisioner,
    ) -> Result<(), TargetError> {
        debug!(resource = %spec, "provisioning resource");
        provisioner.provision(spec).await?;
        self.record_mutation();
        Ok(())
    }

    async fn finish(&self, _tasks: &TaskMap) -> Result<(), TargetError> {
        Ok(())
    }
}
