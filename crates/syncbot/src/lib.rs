//! # Syncbot
//!
//! A bot that keeps conversations on several chat platforms in sync.
//!
//! ```text
//! ProtocolClient ──InboundEvent──▶ Bot ──sync_conv──▶ SyncRouter ──▶ sending handlers
//!       ▲                           │                                 (per platform)
//!       └──────── PrimaryQueue ◀────┘  commands, tags, profile sync
//! ```
//!
//! - **Runtime**: settings, logging, the reconnect loop ([`runtime`])
//! - **Framework**: the bot context, plugins, commands and routing ([`framework`])
//! - **Core**: the data model, stores, caches and queues ([`core`])
//!
//! ## Writing a plugin
//!
//! ```rust,ignore
//! use syncbot::prelude::*;
//!
//! async fn init(ctx: PluginContext) -> Result<(), BoxError> {
//!     ctx.register_command(CommandSpec::new("ping").help("replies pong"), |_| async {
//!         Ok(CommandReply::from("pong"))
//!     });
//!     Ok(())
//! }
//!
//! pub static PING: PluginDescriptor = define_plugin! {
//!     name: "ping",
//!     init: init,
//! };
//! ```

pub mod console;

pub use syncbot_core as core;
pub use syncbot_framework as framework;
pub use syncbot_runtime as runtime;

/// Everything a plugin or a small deployment usually needs.
pub mod prelude {
    pub use syncbot_framework::prelude::*;
    pub use syncbot_runtime::{Settings, SyncbotRuntime};

    pub use crate::console::ConsoleClient;
}
