//! Builders for converting manifest configuration into runnable tasks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::error::ConfigError;
use super::yaml::{
    ASSET_PREFIX, LOAD_IMAGE_PREFIX, ManifestLoader, NodeConfig, TaskConfig, TaskTypeConfig,
};
use crate::core::deps::TaskRef;
use crate::core::environment::Environment;
use crate::core::task::{Task, TaskMap};
use crate::tasks::{CommandTask, DirectoryTask, FetchAssetTask, FileTask, LoadImageTask};

impl ManifestLoader {
    /// Build the task collection a manifest describes.
    ///
    /// Every asset becomes an `Asset.<index>` task and every image a
    /// `LoadImage.<index>` task; the remaining tasks are built from their
    /// definitions in order.
    pub fn build_tasks(config: &NodeConfig) -> Result<TaskMap, ConfigError> {
        let cache_dir = config.cache_dir()?;
        let mut tasks = TaskMap::new();

        for (i, asset) in config.assets.iter().enumerate() {
            let task = FetchAssetTask::new(
                format!("{ASSET_PREFIX}{i}"),
                &asset.source,
                &asset.hash,
                cache_dir,
            );
            insert(&mut tasks, Arc::new(task))?;
        }

        for (i, image) in config.images.iter().enumerate() {
            let task = LoadImageTask::new(
                format!("{LOAD_IMAGE_PREFIX}{i}"),
                &image.source,
                &image.hash,
                cache_dir,
            );
            insert(&mut tasks, Arc::new(task))?;
        }

        for task_config in &config.tasks {
            insert(&mut tasks, build_task(task_config)?)?;
        }

        Ok(tasks)
    }

    /// Load a manifest file and build its tasks.
    pub fn load_tasks(path: impl AsRef<Path>) -> Result<(NodeConfig, TaskMap), ConfigError> {
        let config = Self::load(path)?;
        let tasks = Self::build_tasks(&config)?;
        Ok((config, tasks))
    }
}

fn insert(tasks: &mut TaskMap, task: Arc<dyn Task>) -> Result<(), ConfigError> {
    tasks
        .insert(task)
        .map_err(|dup| ConfigError::InvalidConfig(format!("duplicate task id: {}", dup.0)))
}

fn references(config: &TaskConfig) -> Vec<TaskRef> {
    let strong = config.depends_on.iter().map(|id| TaskRef::to(id.as_str()));
    let weak = config.weak_depends_on.iter().map(|id| TaskRef::weak(id.as_str()));
    strong.chain(weak).collect()
}

fn build_task(config: &TaskConfig) -> Result<Arc<dyn Task>, ConfigError> {
    let refs = references(config);

    let task: Arc<dyn Task> = match &config.task_type {
        TaskTypeConfig::File {
            path,
            contents,
            mode,
            owner,
        } => {
            let mut task = FileTask::new(&config.id, path, contents.as_bytes());
            if let Some(mode) = mode {
                task = task.mode(mode.to_mode()?);
            }
            if let Some(owner) = owner {
                task = task.owner(owner);
            }
            Arc::new(refs.into_iter().fold(task, FileTask::depends_on))
        }
        TaskTypeConfig::Directory { path, mode } => {
            let mut task = DirectoryTask::new(&config.id, path);
            if let Some(mode) = mode {
                task = task.mode(mode.to_mode()?);
            }
            Arc::new(refs.into_iter().fold(task, DirectoryTask::depends_on))
        }
        TaskTypeConfig::Command {
            command,
            args,
            environment,
            working_dir,
            timeout_secs,
            creates,
        } => {
            if command.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "tasks[{}].command",
                    config.id
                )));
            }
            let mut env = Environment::new();
            for (key, value) in environment {
                env.set(key, value);
            }
            let mut builder = CommandTask::builder(command)
                .name(&config.id)
                .args(args)
                .environment(env);
            if let Some(dir) = working_dir {
                builder = builder.working_dir(dir);
            }
            if let Some(secs) = timeout_secs {
                builder = builder.timeout(Duration::from_secs(*secs));
            }
            if let Some(path) = creates {
                builder = builder.creates(path);
            }
            Arc::new(refs.into_iter().fold(builder, |b, r| b.depends_on(r)).build())
        }
    };

    Ok(task)
}
