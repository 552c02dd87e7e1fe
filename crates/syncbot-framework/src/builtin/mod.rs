//! Plugins every bot session loads.

mod commands;
mod profilesync;
mod syncrooms;
mod tags;

pub use commands::COMMANDS;
pub use profilesync::PROFILESYNC;
pub use syncrooms::{SYNCROOMS, peers_of};
pub use tags::TAGS;

use crate::bot::Bot;
use crate::plugin::PluginDescriptor;

/// The built-in plugin set, in registration order.
pub fn builtin_plugins() -> [PluginDescriptor; 4] {
    [SYNCROOMS, COMMANDS, PROFILESYNC, TAGS]
}

/// Registers the built-in plugins with `bot`.
pub fn register_builtins(bot: &Bot) {
    for desc in builtin_plugins() {
        if let Err(e) = bot.register_plugin(desc) {
            tracing::warn!(plugin = desc.name, error = %e, "Built-in plugin not registered");
        }
    }
}
