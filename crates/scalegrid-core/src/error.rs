//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration and rule validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration or validating scaling rules.
///
/// Invalid rules are rejected when they are added, never at evaluation time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid scaling rule ({metric}): {reason}")]
    InvalidRule { metric: String, reason: String },

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}
