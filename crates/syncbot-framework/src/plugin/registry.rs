//! Plugin lifecycle: dependency-ordered loading and scoped unloading.
//!
//! Every plugin runs its init inside a tracking scope. Whatever it registers
//! through its [`PluginContext`] (handlers, commands, shared objects,
//! preprocessors, profile-sync platforms) is owned by the plugin name, and
//! its background tasks hang off a [`CancellationToken`] / [`TaskTracker`]
//! pair. Unloading cancels the scope, joins the tasks with a timeout and
//! removes everything the plugin owned.

use std::collections::HashMap;
use std::time::Duration;

use futures::future;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bot::Bot;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{PLUGIN_API_VERSION, PluginContext, PluginDescriptor};

/// How long an unloading plugin's tasks get to finish after cancellation.
pub const DEFAULT_UNLOAD_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Topological sort utility
// =============================================================================

/// Computes the load order as layers via Kahn's algorithm.
///
/// Plugins within one layer have no dependencies on each other and are
/// initialised concurrently. An edge A → B exists when B `depends_on` a name
/// A `provides`. Unload order is the reverse.
///
/// Returns `Err(description)` on a dependency cycle.
fn topological_layers(plugins: &[PluginDescriptor]) -> Result<Vec<Vec<usize>>, String> {
    let n = plugins.len();

    let mut provider_map: HashMap<&str, usize> = HashMap::new();
    for (i, plugin) in plugins.iter().enumerate() {
        for &shared in plugin.provides {
            if let Some(prev) = provider_map.insert(shared, i) {
                warn!(
                    shared        = shared,
                    prev_provider = %plugins[prev].name,
                    new_provider  = %plugin.name,
                    "Duplicate shared provider, last registration wins"
                );
            }
        }
    }

    let mut in_degree: Vec<usize> = vec![0; n];
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; n];

    for (i, plugin) in plugins.iter().enumerate() {
        for &dep in plugin.depends_on {
            match provider_map.get(dep) {
                Some(&provider) if provider != i => {
                    dependents[provider].push(i);
                    in_degree[i] += 1;
                }
                Some(_) => {
                    warn!(plugin = %plugin.name, shared = dep, "Plugin depends on itself, ignored");
                }
                None => {
                    debug!(
                        plugin     = %plugin.name,
                        dependency = dep,
                        "No registered plugin provides '{dep}'; it must already be shared"
                    );
                }
            }
        }
    }

    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0;

    while !current.is_empty() {
        processed += current.len();
        let mut next: Vec<usize> = Vec::new();
        for &i in &current {
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    next.push(j);
                }
            }
        }
        layers.push(current);
        current = next;
    }

    if processed != n {
        let cycle: Vec<&str> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| plugins[i].name)
            .collect();
        return Err(format!("Plugin dependency cycle detected among: {}", cycle.join(", ")));
    }

    Ok(layers)
}

// =============================================================================
// PluginLoadState
// =============================================================================

/// ```text
/// register() ──► Registered
///   load_all() ──► Active   (deps met, init succeeded)
///              ──► Failed   (deps missing or init failed)
///   unload()   ──► Registered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginLoadState {
    Registered,
    Active,
    Failed,
}

struct Scope {
    token: CancellationToken,
    tracker: TaskTracker,
}

struct PluginEntry {
    descriptor: PluginDescriptor,
    state: PluginLoadState,
    scope: Option<Scope>,
}

// =============================================================================
// PluginRegistry
// =============================================================================

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<PluginEntry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Adds a plugin in the `Registered` state. Re-registering a name
    /// replaces a plugin that is not active.
    pub fn register(&self, desc: PluginDescriptor) -> PluginResult<()> {
        if !desc.is_compatible() {
            warn!(
                plugin = %desc.name,
                descriptor_version = %format!("{}.{}", desc.api_version >> 16, desc.api_version & 0xFFFF),
                host_version = %format!("{}.{}", PLUGIN_API_VERSION >> 16, PLUGIN_API_VERSION & 0xFFFF),
                "Plugin API version mismatch, registering anyway"
            );
        }
        let mut plugins = self.plugins.write();
        match plugins.iter_mut().find(|e| e.descriptor.name == desc.name) {
            Some(entry) if entry.state == PluginLoadState::Active => {
                return Err(PluginError::AlreadyLoaded(desc.name.to_string()));
            }
            Some(entry) => {
                entry.descriptor = desc;
                entry.state = PluginLoadState::Registered;
            }
            None => plugins.push(PluginEntry {
                descriptor: desc,
                state: PluginLoadState::Registered,
                scope: None,
            }),
        }
        info!(plugin = %desc.name, "Plugin registered");
        Ok(())
    }

    pub fn state(&self, name: &str) -> Option<PluginLoadState> {
        self.plugins
            .read()
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| e.state)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.read().iter().map(|e| e.descriptor.name).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.plugins
            .read()
            .iter()
            .filter(|e| e.state == PluginLoadState::Active)
            .count()
    }

    // ─── Loading ─────────────────────────────────────────────────────────────

    /// Loads every plugin that is not active, in dependency order; returns
    /// how many became active.
    pub async fn load_all(&self, bot: &Bot) -> usize {
        let descriptors: Vec<PluginDescriptor> =
            self.plugins.read().iter().map(|e| e.descriptor).collect();
        let layers = match topological_layers(&descriptors) {
            Ok(layers) => layers,
            Err(e) => {
                error!("{e}");
                (0..descriptors.len()).map(|i| vec![i]).collect()
            }
        };

        let mut loaded = 0;
        for layer in layers {
            let candidates: Vec<PluginDescriptor> = {
                let plugins = self.plugins.read();
                layer
                    .iter()
                    .filter_map(|&i| plugins.get(i))
                    .filter(|e| e.state != PluginLoadState::Active)
                    .map(|e| e.descriptor)
                    .collect()
            };
            let results = future::join_all(candidates.iter().map(|desc| self.init_one(bot, *desc))).await;
            for (desc, result) in candidates.iter().zip(results) {
                match result {
                    Ok(()) => loaded += 1,
                    Err(e) => error!(plugin = %desc.name, error = %e, "Plugin failed to load"),
                }
            }
        }
        info!(active = loaded, total = descriptors.len(), "Plugins loaded");
        loaded
    }

    /// Registers and loads a single plugin.
    pub async fn load(&self, bot: &Bot, desc: PluginDescriptor) -> PluginResult<()> {
        self.register(desc)?;
        self.init_one(bot, desc).await
    }

    async fn init_one(&self, bot: &Bot, desc: PluginDescriptor) -> PluginResult<()> {
        if let Some(dep) = desc.depends_on.iter().find(|d| !bot.shared().contains(d)) {
            self.set_state(desc.name, PluginLoadState::Failed);
            return Err(PluginError::MissingDependency {
                plugin: desc.name.to_string(),
                dependency: dep.to_string(),
            });
        }

        let scope = Scope {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        let ctx = PluginContext::new(desc.name, bot.clone(), scope.token.clone(), scope.tracker.clone());
        let result = (desc.init)(ctx)
            .instrument(info_span!("plugin_init", plugin = %desc.name))
            .await;

        match result {
            Ok(()) => {
                let mut plugins = self.plugins.write();
                if let Some(entry) = plugins.iter_mut().find(|e| e.descriptor.name == desc.name) {
                    entry.state = PluginLoadState::Active;
                    entry.scope = Some(scope);
                }
                info!(plugin = %desc.name, version = %desc.metadata.version, "Plugin loaded and active");
                Ok(())
            }
            Err(source) => {
                scope.token.cancel();
                scope.tracker.close();
                deregister_owned(bot, desc.name);
                self.set_state(desc.name, PluginLoadState::Failed);
                Err(PluginError::Init {
                    plugin: desc.name.to_string(),
                    source,
                })
            }
        }
    }

    fn set_state(&self, name: &str, state: PluginLoadState) {
        if let Some(entry) = self.plugins.write().iter_mut().find(|e| e.descriptor.name == name) {
            entry.state = state;
        }
    }

    // ─── Unloading ───────────────────────────────────────────────────────────

    /// Cancels the plugin's tasks, waits up to `timeout` for them, then drops
    /// everything it registered. Returns `false` if it was not active.
    pub async fn unload(&self, bot: &Bot, name: &str, timeout: Duration) -> bool {
        let scope = {
            let mut plugins = self.plugins.write();
            let Some(entry) = plugins
                .iter_mut()
                .find(|e| e.descriptor.name == name && e.state == PluginLoadState::Active)
            else {
                return false;
            };
            entry.state = PluginLoadState::Registered;
            entry.scope.take()
        };

        if let Some(scope) = scope {
            scope.token.cancel();
            scope.tracker.close();
            if tokio::time::timeout(timeout, scope.tracker.wait()).await.is_err() {
                warn!(plugin = %name, tasks = scope.tracker.len(), "Plugin tasks did not stop in time");
            }
        }
        let removed = deregister_owned(bot, name);
        info!(plugin = %name, removed, "Plugin unloaded");
        true
    }

    /// Unloads every active plugin in reverse dependency order.
    pub async fn unload_all(&self, bot: &Bot, timeout: Duration) {
        let descriptors: Vec<PluginDescriptor> =
            self.plugins.read().iter().map(|e| e.descriptor).collect();
        let layers = topological_layers(&descriptors)
            .unwrap_or_else(|_| (0..descriptors.len()).map(|i| vec![i]).collect());
        for layer in layers.into_iter().rev() {
            future::join_all(
                layer
                    .iter()
                    .map(|&i| self.unload(bot, descriptors[i].name, timeout)),
            )
            .await;
        }
    }
}

/// Removes every registration owned by `plugin`; returns how many.
fn deregister_owned(bot: &Bot, plugin: &str) -> usize {
    bot.hub().deregister_plugin(plugin)
        + bot.commands().deregister_plugin(plugin)
        + bot.commands().preprocessor().deregister_plugin(plugin)
        + bot.shared().deregister_plugin(plugin)
        + bot.profilesync().deregister_plugin(plugin)
}
