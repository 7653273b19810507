//! Node manifest loading.
//!
//! A YAML manifest describes the target, budget, downloads and tasks of one
//! node; [`ManifestLoader::build_tasks`] turns it into a [`TaskMap`](crate::TaskMap).

mod builder;
mod error;
mod yaml;

pub use error::ConfigError;
pub use yaml::{
    ASSET_PREFIX, AssetConfig, ImageConfig, LOAD_IMAGE_PREFIX, ManifestLoader, ModeConfig,
    NodeConfig, TaskConfig, TaskTypeConfig,
};
