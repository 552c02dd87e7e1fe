//! Plugin descriptor: the static, `Copy` handle to a plugin.

use futures::future::BoxFuture;

use crate::error::BoxError;
use crate::plugin::PluginContext;

// ─── API versioning ─────────────────────────────────────────────────────────

/// Current syncbot plugin API version (1.0).
pub const PLUGIN_API_VERSION: u32 = 0x0001_0000;

/// Future returned by a plugin's init function.
pub type InitFuture = BoxFuture<'static, Result<(), BoxError>>;

/// Async init function, called once per load with the plugin's context.
pub type InitFn = fn(PluginContext) -> InitFuture;

/// Descriptive metadata attached to every plugin.
#[derive(Debug, Clone, Copy)]
pub struct PluginMetadata {
    /// Semver version string of the plugin.
    pub version: &'static str,
    /// One-line description shown in logs.
    pub desc: &'static str,
}

// ─── PluginDescriptor ───────────────────────────────────────────────────────

/// A static descriptor that identifies and initialises a plugin.
///
/// Create with [`define_plugin!`](crate::define_plugin).
#[derive(Debug, Clone, Copy)]
pub struct PluginDescriptor {
    /// Plugin API version this descriptor was compiled against.
    pub api_version: u32,

    /// Plugin name, used in logs, as config section key and as the owner of
    /// everything the plugin registers.
    pub name: &'static str,

    /// Shared object names this plugin registers during init.
    pub provides: &'static [&'static str],

    /// Shared object names that must exist before init.
    pub depends_on: &'static [&'static str],

    /// Registers the plugin's handlers, commands and shared objects.
    pub init: InitFn,

    pub metadata: PluginMetadata,
}

impl PluginDescriptor {
    /// The major part must match exactly; the descriptor's minor part must be
    /// ≤ the host's minor part.
    pub fn is_compatible(&self) -> bool {
        let host_major = PLUGIN_API_VERSION >> 16;
        let desc_major = self.api_version >> 16;
        let desc_minor = self.api_version & 0xFFFF;
        let host_minor = PLUGIN_API_VERSION & 0xFFFF;
        desc_major == host_major && desc_minor <= host_minor
    }
}
