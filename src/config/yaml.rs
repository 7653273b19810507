//! YAML node manifest parsing.
//!
//! A manifest names the target, the node's filesystem root and cache, the
//! no-progress budget, container images to preload and the tasks to
//! converge:
//!
//! ```yaml
//! target: direct
//! fs_root: /
//! cache_dir: /var/cache/converge
//! max_attempts_with_no_progress: 100
//! assets:
//!   - source: https://example.com/cni-plugins.tgz
//!     hash: e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
//! images:
//!   - source: https://example.com/pause.tar
//!     hash: 0123456789abcdef0123456789abcdef01234567
//! tasks:
//!   - id: kubelet-dir
//!     type: directory
//!     path: /var/lib/kubelet
//!   - id: kubelet-config
//!     type: file
//!     path: /var/lib/kubelet/config.yaml
//!     contents: "kind: KubeletConfiguration\n"
//!     mode: "0600"
//!     depends_on: [kubelet-dir]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;
use crate::core::budget::{DEFAULT_MAX_PASSES_WITHOUT_PROGRESS, DEFAULT_PASS_DELAY, ProgressBudget};
use crate::engine::RunOptions;
use crate::target::{ScriptFormat, TargetKind};

/// Prefix of the task ids generated for `images`.
pub const LOAD_IMAGE_PREFIX: &str = "LoadImage.";

/// Prefix of the task ids generated for `assets`.
pub const ASSET_PREFIX: &str = "Asset.";

/// Node manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// How to apply the tasks.
    #[serde(default = "default_target")]
    pub target: TargetKind,
    /// Output format when rendering a script.
    #[serde(default)]
    pub script_format: ScriptFormat,
    /// Root under which node paths are resolved.
    #[serde(default = "default_fs_root")]
    pub fs_root: PathBuf,
    /// Where downloaded assets and images are cached. Required.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Consecutive passes allowed to complete nothing.
    #[serde(default = "default_max_no_progress")]
    pub max_attempts_with_no_progress: u32,
    /// Pause after an unproductive pass, in seconds.
    #[serde(default = "default_pass_delay_secs")]
    pub pass_delay_secs: u64,
    /// Task attempts in flight at once within a pass.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Hashed files to fetch into the cache directory.
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
    /// Container image tarballs to load.
    #[serde(default)]
    pub images: Vec<ImageConfig>,
    /// Task definitions.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

fn default_target() -> TargetKind {
    TargetKind::Direct
}

fn default_fs_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_max_no_progress() -> u32 {
    DEFAULT_MAX_PASSES_WITHOUT_PROGRESS
}

fn default_pass_delay_secs() -> u64 {
    DEFAULT_PASS_DELAY.as_secs()
}

/// A hashed file fetched into the cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetConfig {
    pub source: String,
    pub hash: String,
}

/// A container image tarball.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub source: String,
    pub hash: String,
}

/// Task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identifier (unique within the manifest).
    pub id: String,
    /// Task type and configuration.
    #[serde(flatten)]
    pub task_type: TaskTypeConfig,
    /// Tasks that must be done first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Tasks that must be done first if they are part of the run.
    #[serde(default)]
    pub weak_depends_on: Vec<String>,
}

/// Task type configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskTypeConfig {
    File {
        path: PathBuf,
        #[serde(default)]
        contents: String,
        mode: Option<ModeConfig>,
        owner: Option<String>,
    },
    Directory {
        path: PathBuf,
        mode: Option<ModeConfig>,
    },
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        environment: BTreeMap<String, String>,
        working_dir: Option<PathBuf>,
        timeout_secs: Option<u64>,
        /// Skip the command once this path exists.
        creates: Option<PathBuf>,
    },
}

/// A permission mode, written either as an octal string (`"0644"`) or as a
/// bare number whose digits are read as octal (`644`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModeConfig {
    Number(u32),
    Text(String),
}

impl ModeConfig {
    pub fn to_mode(&self) -> Result<u32, ConfigError> {
        let digits = match self {
            ModeConfig::Number(n) => n.to_string(),
            ModeConfig::Text(s) => s.trim().trim_start_matches("0o").to_string(),
        };
        u32::from_str_radix(&digits, 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .ok_or_else(|| ConfigError::InvalidConfig(format!("invalid file mode '{digits}'")))
    }
}

impl NodeConfig {
    /// The cache directory; required.
    pub fn cache_dir(&self) -> Result<&Path, ConfigError> {
        match &self.cache_dir {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir),
            _ => Err(ConfigError::MissingField("cache_dir".into())),
        }
    }

    /// Budget and concurrency for the run.
    pub fn run_options(&self) -> Result<RunOptions, ConfigError> {
        let budget = ProgressBudget::new(self.max_attempts_with_no_progress)?
            .with_pass_delay(Duration::from_secs(self.pass_delay_secs));
        Ok(RunOptions::new(budget).with_concurrency(self.max_concurrency.unwrap_or(1)))
    }

    /// Check the manifest for errors that do not need the task graph.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fs_root.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("fs_root".into()));
        }
        self.cache_dir()?;
        if self.max_attempts_with_no_progress == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_attempts_with_no_progress must be positive".into(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_concurrency cannot be zero".into(),
            ));
        }

        for (i, asset) in self.assets.iter().enumerate() {
            check_download("assets", i, &asset.source, &asset.hash)?;
        }
        for (i, image) in self.images.iter().enumerate() {
            check_download("images", i, &image.source, &image.hash)?;
        }
        // downloads run as host commands; only a script or the real root
        // gives the cache directory one meaning for both
        let has_downloads = !self.assets.is_empty() || !self.images.is_empty();
        if has_downloads
            && self.target != TargetKind::ScriptRender
            && self.fs_root != Path::new("/")
        {
            return Err(ConfigError::InvalidConfig(format!(
                "assets and images need fs_root '/' unless the target is script (fs_root is '{}')",
                self.fs_root.display()
            )));
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(ConfigError::MissingField("tasks[].id".into()));
            }
            if let Some(prefix) = [LOAD_IMAGE_PREFIX, ASSET_PREFIX]
                .into_iter()
                .find(|prefix| task.id.starts_with(prefix))
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "task id '{}' uses the reserved prefix '{prefix}'",
                    task.id
                )));
            }
            if !ids.insert(&task.id) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
        }

        let generated: Vec<String> = (0..self.images.len())
            .map(|i| format!("{LOAD_IMAGE_PREFIX}{i}"))
            .chain((0..self.assets.len()).map(|i| format!("{ASSET_PREFIX}{i}")))
            .collect();
        for task in &self.tasks {
            let mut seen = HashSet::new();
            for dep in task.depends_on.iter().chain(&task.weak_depends_on) {
                if dep == &task.id {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' cannot depend on itself",
                        task.id
                    )));
                }
                if !seen.insert(dep) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' has duplicate dependency '{}'",
                        task.id, dep
                    )));
                }
            }
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) && !generated.contains(dep) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_download(field: &str, i: usize, source: &str, hash: &str) -> Result<(), ConfigError> {
    if source.is_empty() {
        return Err(ConfigError::MissingField(format!("{field}[{i}].source")));
    }
    if hash.is_empty() {
        return Err(ConfigError::MissingField(format!("{field}[{i}].hash")));
    }
    Ok(())
}

/// YAML manifest loader.
pub struct ManifestLoader;

impl ManifestLoader {
    /// Read and validate a manifest file.
    pub fn load(path: impl AsRef<Path>) -> Result<NodeConfig, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a manifest.
    pub fn parse(yaml: &str) -> Result<NodeConfig, ConfigError> {
        let config = Self::parse_unvalidated(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a manifest without validating it, so overrides can be applied first.
    pub fn read(path: impl AsRef<Path>) -> Result<NodeConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse_unvalidated(&content)
    }

    pub fn parse_unvalidated(yaml: &str) -> Result<NodeConfig, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}
