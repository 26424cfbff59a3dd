//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating blogd.toml.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("invalid interface address: {0}")]
    Interface(String),

    #[error("document directory does not exist: {0}")]
    MissingDocDir(PathBuf),

    #[error("view directory does not exist: {0}")]
    MissingViewDir(PathBuf),
}
