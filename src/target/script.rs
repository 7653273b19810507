//! Script-rendering target.
//!
//! Nothing is applied. Each operation is appended to an ordered buffer and
//! the buffer is rendered once, on finish, as either a cloud-config
//! document or a POSIX shell script. Existing state cannot be observed, so
//! tasks run under this target always emit their full set of operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{
    CommandOutput, CommandSpec, DirectorySpec, FileSpec, PathStat, Provisioner, ResourceSpec,
    Target, TargetError, TargetKind, shell_quote,
};
use crate::core::task::TaskMap;

/// Output format of a [`ScriptTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFormat {
    /// `#cloud-config` YAML with `write_files` and `runcmd`.
    #[default]
    CloudConfig,
    /// A `#!/bin/sh` script.
    Shell,
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOp {
    WriteFile(FileSpec),
    Mkdir(DirectorySpec),
    Run(CommandSpec),
}

struct ScriptState {
    ops: Vec<ScriptOp>,
    out: Box<dyn Write + Send>,
    finished: bool,
}

/// Accumulates operations into a script for later replay.
pub struct ScriptTarget {
    format: ScriptFormat,
    state: Mutex<ScriptState>,
}

impl ScriptTarget {
    pub fn new(format: ScriptFormat, out: impl Write + Send + 'static) -> Self {
        Self {
            format,
            state: Mutex::new(ScriptState {
                ops: Vec::new(),
                out: Box::new(out),
                finished: false,
            }),
        }
    }

    pub fn format(&self) -> ScriptFormat {
        self.format
    }

    /// Operations recorded so far, in request order.
    pub fn ops(&self) -> Result<Vec<ScriptOp>, TargetError> {
        let state = self.state.lock().map_err(|_| TargetError::LockPoisoned)?;
        Ok(state.ops.clone())
    }

    /// Render the buffer in the configured format.
    pub fn render(&self) -> Result<String, TargetError> {
        let state = self.state.lock().map_err(|_| TargetError::LockPoisoned)?;
        render(self.format, &state.ops)
    }

    fn push(&self, op: ScriptOp) -> Result<(), TargetError> {
        let mut state = self.state.lock().map_err(|_| TargetError::LockPoisoned)?;
        state.ops.push(op);
        Ok(())
    }
}

fn render(format: ScriptFormat, ops: &[ScriptOp]) -> Result<String, TargetError> {
    match format {
        ScriptFormat::Shell => render_shell(ops),
        ScriptFormat::CloudConfig => render_cloud_config(ops),
    }
}

fn utf8_contents(file: &FileSpec) -> Result<&str, TargetError> {
    std::str::from_utf8(&file.contents).map_err(|_| {
        TargetError::Render(format!(
            "contents of {} are not valid UTF-8",
            file.path.display()
        ))
    })
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

fn shell_mkdir(dir: &DirectorySpec) -> String {
    let path = quote_path(&dir.path);
    match dir.mode {
        Some(mode) => format!("mkdir -p {path} && chmod {mode:04o} {path}"),
        None => format!("mkdir -p {path}"),
    }
}

fn shell_write(file: &FileSpec) -> Result<String, TargetError> {
    let path = quote_path(&file.path);
    let mut parts = Vec::new();
    if let Some(parent) = file.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        parts.push(format!("mkdir -p {}", quote_path(parent)));
    }
    parts.push(format!(
        "printf '%s' {} > {path}",
        shell_quote(utf8_contents(file)?)
    ));
    if let Some(mode) = file.mode {
        parts.push(format!("chmod {mode:04o} {path}"));
    }
    if let Some(owner) = &file.owner {
        parts.push(format!("chown {} {path}", shell_quote(owner)));
    }
    Ok(parts.join(" && "))
}

fn shell_run(command: &CommandSpec) -> String {
    let mut line = String::new();
    if !command.env.is_empty() {
        line.push_str("env ");
        for (key, value) in command.env.iter() {
            line.push_str(&shell_quote(&format!("{key}={value}")));
            line.push(' ');
        }
    }
    line.push_str(&command.command_line());
    match &command.working_dir {
        Some(dir) => format!("(cd {} && {line})", quote_path(dir)),
        None => line,
    }
}

fn render_shell(ops: &[ScriptOp]) -> Result<String, TargetError> {
    let mut out = String::from("#!/bin/sh\nset -e\n");
    for op in ops {
        let line = match op {
            ScriptOp::WriteFile(file) => shell_write(file)?,
            ScriptOp::Mkdir(dir) => shell_mkdir(dir),
            ScriptOp::Run(command) => shell_run(command),
        };
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    write_files: Vec<CloudFile<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    runcmd: Vec<String>,
}

#[derive(Serialize)]
struct CloudFile<'a> {
    path: String,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    permissions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<&'a str>,
}

/// cloud-init applies `write_files` before `runcmd`, so only files requested
/// ahead of the first command can use it; later ones become shell writes.
fn render_cloud_config(ops: &[ScriptOp]) -> Result<String, TargetError> {
    let mut doc = CloudConfig {
        write_files: Vec::new(),
        runcmd: Vec::new(),
    };
    let mut seen_command = false;

    for op in ops {
        match op {
            ScriptOp::WriteFile(file) if !seen_command => doc.write_files.push(CloudFile {
                path: file.path.to_string_lossy().into_owned(),
                content: utf8_contents(file)?,
                permissions: file.mode.map(|m| format!("{m:04o}")),
                owner: file.owner.as_deref(),
            }),
            ScriptOp::WriteFile(file) => doc.runcmd.push(shell_write(file)?),
            ScriptOp::Mkdir(dir) => doc.runcmd.push(shell_mkdir(dir)),
            ScriptOp::Run(command) => {
                seen_command = true;
                doc.runcmd.push(shell_run(command));
            }
        }
    }

    let body = if doc.write_files.is_empty() && doc.runcmd.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(&doc).map_err(|e| TargetError::Render(e.to_string()))?
    };
    Ok(format!("#cloud-config\n{body}"))
}

#[async_trait]
impl Target for ScriptTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::ScriptRender
    }

    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput, TargetError> {
        if command.probe {
            return Err(TargetError::Unobservable(command.command_line()));
        }
        self.push(ScriptOp::Run(command.clone()))?;
        Ok(CommandOutput::default())
    }

    async fn write_file(&self, file: &FileSpec) -> Result<(), TargetError> {
        utf8_contents(file)?;
        self.push(ScriptOp::WriteFile(file.clone()))
    }

    async fn ensure_directory(&self, dir: &DirectorySpec) -> Result<(), TargetError> {
        self.push(ScriptOp::Mkdir(dir.clone()))
    }

    async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>, TargetError> {
        Err(TargetError::Unobservable(path.display().to_string()))
    }

    async fn stat(&self, path: &Path) -> Result<Option<PathStat>, TargetError> {
        Err(TargetError::Unobservable(path.display().to_string()))
    }

    async fn resolve_owner(&self, owner: &str) -> Result<(Option<u32>, Option<u32>), TargetError> {
        Err(TargetError::Unobservable(format!("owner {owner}")))
    }

    async fn ensure_resource(
        &self,
        spec: &ResourceSpec,
        _provisioner: &dyn Provisioner,
    ) -> Result<(), TargetError> {
        Err(TargetError::Unsupported {
            target: TargetKind::ScriptRender,
            operation: format!("ensuring resource {spec}"),
        })
    }

    async fn finish(&self, _tasks: &TaskMap) -> Result<(), TargetError> {
        let mut state = self.state.lock().map_err(|_| TargetError::LockPoisoned)?;
        if state.finished {
            return Ok(());
        }
        let rendered = render(self.format, &state.ops)?;
        state
            .out
            .write_all(rendered.as_bytes())
            .and_then(|_| state.out.flush())
            .map_err(|e| TargetError::io(PathBuf::from("<script output>"), e))?;
        state.finished = true;
        Ok(())
    }
}
