//! Bootstrap settings for the runtime.
//!
//! These are distinct from the bot's own `config.json`: they say where the
//! config and memory stores live, how to log and how hard to retry.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::SettingsLoader;
pub use schema::{
    BotSettings, LogFormat, LogLevel, LogOutput, LoggingConfig, PathsConfig, RetryConfig,
    Settings, SpanEventConfig,
};
pub use validation::validate_settings;
