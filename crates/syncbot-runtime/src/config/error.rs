//! Settings error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading and validating settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found at the specified path.
    #[error("Settings file not found: {0}")]
    FileNotFound(PathBuf),

    /// The settings could not be parsed or extracted.
    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    /// Invalid settings value.
    #[error("Invalid settings: {message}")]
    ValidationError { message: String },

    /// Missing required field.
    #[error("Missing required settings field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    /// Creates a validation error with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}

/// Result type for settings operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
