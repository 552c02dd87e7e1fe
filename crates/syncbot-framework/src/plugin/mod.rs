//! Plugin system.
//!
//! A plugin is a static [`PluginDescriptor`] (built with
//! [`define_plugin!`](crate::define_plugin)) whose async init receives a
//! [`PluginContext`]. The [`PluginRegistry`] loads plugins in the order
//! their `provides` / `depends_on` names imply and tears each one down as a
//! unit.

mod context;
mod descriptor;
mod macros;
mod registry;

pub use context::PluginContext;
pub use descriptor::{InitFn, InitFuture, PLUGIN_API_VERSION, PluginDescriptor, PluginMetadata};
pub use registry::{DEFAULT_UNLOAD_TIMEOUT, PluginLoadState, PluginRegistry};
