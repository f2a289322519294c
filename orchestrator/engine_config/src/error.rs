//! Error types for the engine_config crate.

use orchestrator_shared_types::OrchestrationError;
use thiserror::Error;

/// Result type for engine_config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading the configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing TOML configuration.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Error serializing to TOML.
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Configuration validation failed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration path error.
    #[error("Path error: {0}")]
    PathError(String),
}

impl ConfigError {
    /// Create a new validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<ConfigError> for OrchestrationError {
    fn from(err: ConfigError) -> Self {
        OrchestrationError::ConfigError(err.to_string())
    }
}
