//! Commands: splitting, argument preprocessing, access rules and dispatch.

pub mod dispatcher;
pub mod preprocess;
pub mod split;

pub use dispatcher::{
    AvailableCommands, CommandCall, CommandDispatcher, CommandReply, CommandService, CommandSpec,
    DEFAULT_PREFIX,
};
#[cfg(feature = "clap")]
pub use dispatcher::parse_args;
pub use preprocess::{ArgPreprocessor, ResolveContext, Resolver};
pub use split::{ArgToken, shell_split};
