//! Errors raised while loading `~/.conductor/settings.json`.

use std::path::PathBuf;

use thiserror::Error;

/// Why the conductor settings could not be loaded.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read conductor settings at {}: {source}", path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The merged settings are not valid conductor settings JSON.
    #[error("conductor settings are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A setting failed validation after merging and overrides.
    #[error("conductor setting `{key}` {reason}")]
    InvalidValue {
        /// Dotted camelCase key, as written in the file.
        key: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
