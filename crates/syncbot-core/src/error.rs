//! Unified error types for the syncbot core.
//!
//! Framework-level errors (tags, commands, profile sync) live in
//! `syncbot-framework`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used at dynamic seams (queue sinks, handler bodies).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// Store Errors
// =============================================================================

/// Errors raised by the persistent JSON stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested path does not exist and no default is registered.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A path segment points into a value that is not an object.
    #[error("path '{0}' does not address an object")]
    NotAnObject(String),

    /// The file and every backup failed to parse.
    #[error("store '{path}' is corrupt and no usable backup exists: {reason}")]
    Corrupt {
        /// The primary file path.
        path: PathBuf,
        /// Parse failure of the primary file.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Creates a key-not-found error from a path.
    pub fn key_not_found(path: &[&str]) -> Self {
        Self::KeyNotFound(path.join("."))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Client Errors
// =============================================================================

/// Errors reported by a [`ProtocolClient`](crate::client::ProtocolClient).
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Network-level failure; the connection may recover.
    #[error("network error: {0}")]
    Network(String),

    /// The service asked us to slow down.
    #[error("rate limited")]
    RateLimited {
        /// Server supplied backoff, if any.
        retry_after: Option<Duration>,
    },

    /// The service rejected the request.
    #[error("protocol error ({status}): {reason}")]
    Protocol {
        /// Service status code.
        status: u16,
        /// Human readable reason.
        reason: String,
    },

    /// Credentials were refused. Never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The client is not connected.
    #[error("client not connected")]
    NotConnected,

    /// The operation is not supported by this client.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl ClientError {
    /// Whether the runtime should treat this error as fatal for the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::NotConnected
        )
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

// =============================================================================
// Image Errors
// =============================================================================

/// Errors raised by the image pipeline.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// Download failed.
    #[error("failed to fetch '{url}': {reason}")]
    Fetch {
        /// Source URL.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// Decoding or encoding failed.
    #[error("image processing failed: {0}")]
    Processing(String),

    /// No backend is able to handle the media type.
    #[error("unsupported media type: {0}")]
    Unsupported(String),

    /// Worker task was cancelled or panicked.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl From<image::ImageError> for ImageError {
    fn from(err: image::ImageError) -> Self {
        Self::Processing(err.to_string())
    }
}

/// Result type for image operations.
pub type ImageResult<T> = Result<T, ImageError>;

// =============================================================================
// Queue Errors
// =============================================================================

/// Errors raised by the sending queues.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// A soft stop did not drain in time.
    #[error(
        "sending queue stop for {} timed out with {pending} item(s) pending",
        .group.as_deref().unwrap_or("all groups")
    )]
    StopTimeout {
        /// Group being stopped; `None` for a global stop.
        group: Option<String>,
        /// Items still pending when the timeout elapsed.
        pending: usize,
    },
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_classification() {
        assert!(ClientError::Authentication("bad token".into()).is_fatal());
        assert!(!ClientError::Network("reset".into()).is_fatal());
        assert!(ClientError::RateLimited { retry_after: None }.is_transient());
        assert!(
            !ClientError::Protocol {
                status: 400,
                reason: "bad".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn key_not_found_joins_path() {
        let err = StoreError::key_not_found(&["conversations", "abc", "silentmode"]);
        assert_eq!(err.to_string(), "key not found: conversations.abc.silentmode");
    }
}
