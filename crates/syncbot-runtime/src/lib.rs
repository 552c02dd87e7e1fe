//! # Syncbot Runtime
//!
//! Runs a bot against a primary chat service: loads the bootstrap settings,
//! sets up logging, opens the config and memory stores and keeps a
//! [`Bot`](syncbot_framework::Bot) session alive across disconnects.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use syncbot_runtime::SyncbotRuntime;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let factory = Arc::new(|| Arc::new(MyClient::new()) as _);
//!     SyncbotRuntime::builder(factory).build()?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod stats;

pub use config::{ConfigError, ConfigResult, LogLevel, Settings, SettingsLoader};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, LoggingError, SpanEvents};
pub use runtime::{RuntimeBuilder, SyncbotRuntime};
pub use stats::{RuntimeStats, StatsSnapshot};

pub use tracing;
pub use tracing_subscriber;
