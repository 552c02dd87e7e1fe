//! Runtime error types.

use thiserror::Error;

use syncbot_core::{ClientError, StoreError};

use crate::config::ConfigError;

/// Errors that end [`SyncbotRuntime::run`](crate::SyncbotRuntime::run).
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Settings could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The config or memory store could not be opened.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The client failed in a way retrying cannot fix.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Every connect attempt failed.
    #[error("giving up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
