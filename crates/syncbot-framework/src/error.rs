//! Error types for the syncbot framework.
//!
//! Flow control is expressed with [`Outcome`](crate::pluggable::Outcome).
//! The three `Suppress*` unit errors exist for handlers that prefer to bail
//! out with `?`; the handler buckets translate them back into outcomes.

use thiserror::Error;

pub use syncbot_core::error::BoxError;
use syncbot_core::error::{ClientError, StoreError};

// =============================================================================
// Flow control
// =============================================================================

/// Skip this handler; the rest of the bucket still runs.
#[derive(Debug, Clone, Copy, Error)]
#[error("handler suppressed")]
pub struct SuppressHandler;

/// Stop the remaining handlers of this bucket; the event continues.
#[derive(Debug, Clone, Copy, Error)]
#[error("remaining handlers suppressed")]
pub struct SuppressAllHandlers;

/// Stop this bucket and drop the event for its destination.
#[derive(Debug, Clone, Copy, Error)]
#[error("event handling suppressed")]
pub struct SuppressEventHandling;

// =============================================================================
// Commands
// =============================================================================

/// Returned by a command to request its help text.
///
/// The optional message is shown above the help entry.
#[derive(Debug, Clone, Default, Error)]
#[error("help requested")]
pub struct Help(pub Option<String>);

impl Help {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self(Some(message.into()))
    }
}

/// An argument could not be resolved or parsed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ArgumentError(pub String);

impl ArgumentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by the command dispatcher to its caller.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command is not registered.
    #[error("unknown command '{0}'")]
    Unknown(String),

    /// The caller may not run this command here.
    #[error("command '{0}' is not available to this user")]
    Denied(String),

    /// The handler did not finish within `command_timeout`.
    #[error("command '{0}' timed out")]
    Timeout(String),

    /// An argument preprocessor rejected an argument.
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    /// The handler failed; only surfaced with `raise_exceptions`.
    #[error("command '{command}' failed: {source}")]
    Failed {
        /// Command name.
        command: String,
        /// Handler error.
        source: BoxError,
    },
}

/// Result type for command dispatch.
pub type CommandResult<T> = Result<T, CommandError>;

// =============================================================================
// Tags
// =============================================================================

/// Errors raised by the tag engine.
#[derive(Debug, Error)]
pub enum TagError {
    /// Tag contains characters outside the allowed set.
    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    /// Unknown tag target type.
    #[error("unknown tag type '{0}'")]
    InvalidType(String),

    /// The conversation is neither known nor a wildcard.
    #[error("conversation {0} does not exist")]
    UnknownConversation(String),

    /// The user is neither known nor a wildcard.
    #[error("user {0} is invalid")]
    UnknownUser(String),

    /// A `convuser` id was not `conv|user`.
    #[error("malformed conv-user id '{0}'")]
    MalformedId(String),

    /// Persisting the change failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for tag operations.
pub type TagResult<T> = Result<T, TagError>;

// =============================================================================
// Profile sync
// =============================================================================

/// Errors raised by the profile sync state machine.
#[derive(Debug, Error)]
pub enum ProfileSyncError {
    /// The platform never called `register_profilesync`.
    #[error("platform '{0}' does not support profile sync")]
    NotRegistered(String),

    /// The remote user is already bound.
    #[error("profile sync for {platform}:{remote_user} already completed")]
    AlreadyCompleted {
        /// Remote platform.
        platform: String,
        /// Remote user id.
        remote_user: String,
    },

    /// No pending sync matches the token.
    #[error("no pending profile sync for token '{0}'")]
    UnknownToken(String),

    /// The remote user never started a sync.
    #[error("no pending profile sync for {platform}:{remote_user}")]
    NotPending {
        /// Remote platform.
        platform: String,
        /// Remote user id.
        remote_user: String,
    },

    /// Unsync was requested for a user that is not bound.
    #[error("no profile sync for {0}")]
    NotBound(String),

    /// Persisting the state failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for profile sync operations.
pub type ProfileSyncResult<T> = Result<T, ProfileSyncError>;

// =============================================================================
// Conversation filters
// =============================================================================

/// Errors raised while parsing a conversation filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Unbalanced parentheses or a dangling operator.
    #[error("invalid filter syntax: {0}")]
    Syntax(String),

    /// Term type is not one of the supported types.
    #[error("unknown filter term '{0}'")]
    UnknownTerm(String),

    /// A numeric term got a non-numeric value.
    #[error("filter term '{term}' expects a number, got '{value}'")]
    InvalidNumber {
        /// Term type.
        term: String,
        /// Offending value.
        value: String,
    },
}

/// Result type for filter operations.
pub type FilterResult<T> = Result<T, FilterError>;

// =============================================================================
// Plugins
// =============================================================================

/// Errors raised while loading plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A plugin with this name is already loaded.
    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// A declared dependency is not provided by any loaded plugin.
    #[error("plugin '{plugin}' depends on missing shared '{dependency}'")]
    MissingDependency {
        /// Plugin name.
        plugin: String,
        /// Missing shared name.
        dependency: String,
    },

    /// A shared object with this name already exists.
    #[error("shared '{0}' is already registered")]
    SharedExists(String),

    /// The plugin's init function failed.
    #[error("plugin '{plugin}' failed to initialise: {source}")]
    Init {
        /// Plugin name.
        plugin: String,
        /// Init error.
        source: BoxError,
    },
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Short kind name of a handler error, used in user-facing command failures.
pub fn error_kind(err: &(dyn std::error::Error + 'static)) -> &'static str {
    if err.is::<ArgumentError>() {
        "ArgumentError"
    } else if err.is::<TagError>() {
        "TagError"
    } else if err.is::<ProfileSyncError>() {
        "ProfileSyncError"
    } else if err.is::<FilterError>() {
        "FilterError"
    } else if err.is::<StoreError>() {
        "StoreError"
    } else if err.is::<ClientError>() {
        "ClientError"
    } else if err.is::<serde_json::Error>() {
        "JsonError"
    } else {
        "Error"
    }
}
