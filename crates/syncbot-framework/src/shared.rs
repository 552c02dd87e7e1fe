//! Named objects plugins share with each other.
//!
//! A plugin that `provides` something registers it here during init; a
//! plugin that `depends_on` it is only initialised once the name exists.
//! Entries remember their owner and disappear when it is unloaded.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{PluginError, PluginResult};

type SharedArc = Arc<dyn Any + Send + Sync>;

struct SharedEntry {
    owner: Option<String>,
    value: SharedArc,
}

#[derive(Default)]
pub struct SharedRegistry {
    entries: RwLock<HashMap<String, SharedEntry>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under `name`.
    ///
    /// Fails if the name is taken.
    pub fn register<T: Send + Sync + 'static>(
        &self,
        owner: Option<&str>,
        name: impl Into<String>,
        value: Arc<T>,
    ) -> PluginResult<()> {
        let name = name.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(PluginError::SharedExists(name));
        }
        debug!(shared = %name, owner = ?owner, "Shared object registered");
        entries.insert(
            name,
            SharedEntry {
                owner: owner.map(str::to_string),
                value,
            },
        );
        Ok(())
    }

    /// Looks up `name` and downcasts it to `T`.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let value = Arc::clone(&self.entries.read().get(name)?.value);
        value.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    /// Drops every entry owned by `plugin`; returns how many.
    pub fn deregister_plugin(&self, plugin: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.owner.as_deref() != Some(plugin));
        before - entries.len()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_lookup() {
        let shared = SharedRegistry::new();
        shared.register(Some("weather"), "weather.api", Arc::new(42u32)).unwrap();
        assert_eq!(shared.get::<u32>("weather.api").as_deref(), Some(&42));
        assert!(shared.get::<String>("weather.api").is_none());
        assert!(matches!(
            shared.register(None, "weather.api", Arc::new(1u32)),
            Err(PluginError::SharedExists(_))
        ));
    }

    #[test]
    fn removed_with_owner() {
        let shared = SharedRegistry::new();
        shared.register(Some("a"), "a.x", Arc::new(1u8)).unwrap();
        shared.register(Some("b"), "b.x", Arc::new(2u8)).unwrap();
        assert_eq!(shared.deregister_plugin("a"), 1);
        assert_eq!(shared.names(), vec!["b.x".to_string()]);
    }
}
