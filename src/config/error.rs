//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::budget::BudgetError;

/// Errors that can occur when loading a node manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the manifest file.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// The no-progress budget is not usable.
    #[error("invalid budget: {0}")]
    Budget(#[from] BudgetError),
}
