//! # Syncbot Framework
//!
//! The registries and algorithms that need a bot context.
//!
//! This layer provides:
//! - Handler buckets with priorities and suppression ([`pluggable`])
//! - Plugins with dependency ordering and scoped unloading ([`plugin`])
//! - The tag engine and the command dispatcher with argument
//!   preprocessing ([`tags`], [`commands`])
//! - Conversation and user memory, profile sync, event annotations
//! - The sync router that fans messages out across platforms ([`sync`])
//! - The built-in plugin set ([`builtin`])
//!
//! Everything hangs off [`Bot`]; the runtime crate builds one per
//! connection and feeds it [`InboundEvent`](syncbot_core::InboundEvent)s.

pub mod annotations;
pub mod bot;
pub mod builtin;
pub mod commands;
pub mod conversations;
pub mod error;
pub mod pluggable;
pub mod plugin;
pub mod profilesync;
pub mod shared;
pub mod sync;
pub mod tags;
pub mod testing;
pub mod users;

pub use annotations::{AnnotationRegistry, Reprocessor};
pub use bot::{Bot, BotOptions, OneToOne, WeakBot, default_config};
pub use builtin::{builtin_plugins, register_builtins};
pub use commands::{
    AvailableCommands, CommandCall, CommandDispatcher, CommandReply, CommandSpec, shell_split,
};
pub use conversations::{ConvUpdate, ConversationMemory};
pub use error::{
    ArgumentError, BoxError, CommandError, Help, PluginError, PluginResult, ProfileSyncError,
    SuppressAllHandlers, SuppressEventHandling, SuppressHandler, TagError,
};
pub use pluggable::{Call, DEFAULT_PRIORITY, HandlerHub, Outcome, Pluggable, RunReport, TAIL_PRIORITY};
pub use plugin::{PluginContext, PluginDescriptor, PluginLoadState, PluginRegistry};
pub use profilesync::{ProfileSync, ProfileSyncEvent};
pub use shared::SharedRegistry;
pub use sync::{
    FanOut, ImagePolicy, KickOutcome, KickRequest, SyncConvQuery, SyncMembership, SyncMessage,
    SyncRouter,
};
pub use tags::{TagEngine, TagType};
pub use users::UserStore;

/// Everything a plugin usually needs.
pub mod prelude {
    pub use crate::define_plugin;
    pub use crate::{
        ArgumentError, BoxError, Bot, Call, CommandCall, CommandReply, CommandSpec,
        DEFAULT_PRIORITY, Help, KickOutcome, Outcome, PluginContext, PluginDescriptor,
        SyncMessage, TAIL_PRIORITY,
    };
    pub use syncbot_core::{ChatEvent, MessageBody, SyncEvent, SyncEventMembership, SyncUser, User};
}
