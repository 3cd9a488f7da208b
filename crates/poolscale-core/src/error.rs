//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating an Autoscaler resource.
///
/// Any of these blocks the affected resource's reconciliation loop only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid duration {value:?}: {reason}")]
    Duration { value: String, reason: String },

    #[error("invalid configuration for {name:?}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("failed to read user data file {path}: {source}")]
    UserData {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("duplicate autoscaler name {name:?} (also defined in {first})")]
    Duplicate { name: String, first: PathBuf },
}

impl ConfigError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
