//! Time-bounded key/value cache.
//!
//! Used for user lookups, image upload results, sending queues and per-conv
//! user lists. Each entry carries its own deadline; reads past the deadline
//! miss. A background task evicts expired entries every `default_ttl`, and an
//! optional dump task mirrors serializable caches into the memory store so
//! they survive restarts.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::store::JsonStore;

struct Entry<V> {
    value: V,
    ttl: Duration,
    deadline: Instant,
}

struct Inner<V> {
    name: String,
    default_ttl: Duration,
    extend_on_access: bool,
    items: Mutex<HashMap<String, Entry<V>>>,
}

/// A shared TTL cache keyed by string. Cheap to clone.
pub struct Cache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + 'static> Cache<V> {
    /// Creates a cache; with `extend_on_access` every hit renews the entry.
    pub fn new(name: impl Into<String>, default_ttl: Duration, extend_on_access: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                default_ttl,
                extend_on_access,
                items: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    /// Inserts `value` with the default TTL.
    pub fn add(&self, key: impl Into<String>, value: V) -> bool {
        self.add_with_ttl(key, value, self.inner.default_ttl)
    }

    /// Inserts `value` for `ttl`. Returns `false` for a zero TTL.
    pub fn add_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let entry = Entry {
            value,
            ttl,
            deadline: Instant::now() + ttl,
        };
        self.inner.items.lock().insert(key.into(), entry);
        true
    }

    /// Inserts `value` until `deadline`. Returns `false` if it already passed.
    pub fn add_until(&self, key: impl Into<String>, value: V, deadline: Instant) -> bool {
        let now = Instant::now();
        if deadline <= now {
            return false;
        }
        let entry = Entry {
            value,
            ttl: deadline - now,
            deadline,
        };
        self.inner.items.lock().insert(key.into(), entry);
        true
    }

    /// Returns the live value for `key`, renewing it when configured to.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut items = self.inner.items.lock();
        let entry = items.get_mut(key)?;
        if entry.deadline <= now {
            items.remove(key);
            return None;
        }
        if self.inner.extend_on_access {
            entry.deadline = now + entry.ttl;
        }
        Some(entry.value.clone())
    }

    /// Returns the value for `key` even if it already expired.
    pub fn get_ignore_timeout(&self, key: &str) -> Option<V> {
        self.inner.items.lock().get(key).map(|e| e.value.clone())
    }

    /// Removes and returns a live value.
    pub fn pop(&self, key: &str) -> Option<V> {
        let entry = self.inner.items.lock().remove(key)?;
        (entry.deadline > Instant::now()).then_some(entry.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .items
            .lock()
            .get(key)
            .is_some_and(|e| e.deadline > Instant::now())
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.items.lock().clear();
    }

    /// Drops expired entries and returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_unless(|_| false)
    }

    /// Like [`Cache::cleanup`], but expired entries for which `keep` holds
    /// are renewed for their TTL instead of dropped.
    pub fn cleanup_unless(&self, keep: impl Fn(&V) -> bool) -> usize {
        let now = Instant::now();
        let mut items = self.inner.items.lock();
        let before = items.len();
        items.retain(|_, e| {
            if e.deadline > now {
                return true;
            }
            if keep(&e.value) {
                e.deadline = now + e.ttl;
                return true;
            }
            false
        });
        before - items.len()
    }

    /// Spawns the periodic eviction task.
    ///
    /// The task ends when `token` is cancelled or the cache is dropped.
    pub fn spawn_eviction(&self, token: CancellationToken) -> JoinHandle<()> {
        self.spawn_eviction_unless(token, |_| false)
    }

    /// Spawns the periodic eviction task, sparing entries for which `keep`
    /// holds.
    pub fn spawn_eviction_unless<F>(&self, token: CancellationToken, keep: F) -> JoinHandle<()>
    where
        F: Fn(&V) -> bool + Send + 'static,
    {
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        let period = self.inner.default_ttl.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let cache = Cache { inner };
                let removed = cache.cleanup_unless(&keep);
                if removed > 0 {
                    debug!(cache = %cache.name(), removed, "Evicted expired cache entries");
                }
            }
        })
    }
}

// ─── Persistence ────────────────────────────────────────────────────────────

impl<V> Cache<V>
where
    V: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    fn dump_path(&self) -> [&str; 2] {
        ["cache", self.inner.name.as_str()]
    }

    /// Writes all live entries into `store` under `cache.<name>`.
    pub fn dump(&self, store: &JsonStore) -> StoreResult<()> {
        let now = Instant::now();
        let wall = SystemTime::now();
        let mut out = Map::new();
        for (key, entry) in self.inner.items.lock().iter() {
            if entry.deadline <= now {
                continue;
            }
            let expires = (wall + (entry.deadline - now))
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            let mut record = Map::new();
            record.insert("value".to_string(), serde_json::to_value(&entry.value)?);
            record.insert("expires".to_string(), Value::from(expires));
            out.insert(key.clone(), Value::Object(record));
        }
        store.set_by_path(&self.dump_path(), Value::Object(out))?;
        store.save();
        Ok(())
    }

    /// Loads unexpired entries from `store`; returns the number restored.
    pub fn restore(&self, store: &JsonStore) -> usize {
        let Ok(Value::Object(saved)) = store.get_by_path(&self.dump_path()) else {
            return 0;
        };
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let mut restored = 0;
        for (key, record) in saved {
            let Some(expires) = record.get("expires").and_then(Value::as_f64) else {
                continue;
            };
            let remaining = expires - wall;
            if remaining <= 0.0 {
                continue;
            }
            let value = match record.get("value").cloned().map(serde_json::from_value::<V>) {
                Some(Ok(value)) => value,
                _ => {
                    warn!(cache = %self.inner.name, key = %key, "Skipping unreadable cache entry");
                    continue;
                }
            };
            if self.add_with_ttl(key, value, Duration::from_secs_f64(remaining)) {
                restored += 1;
            }
        }
        restored
    }

    /// Spawns the dump task: dumps every `interval` and on cancellation,
    /// and restores whenever the store is reloaded from disk.
    pub fn spawn_dump(
        &self,
        store: JsonStore,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        let mut reloads = store.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        if let Err(e) = cache.dump(&store) {
                            warn!(cache = %cache.inner.name, error = %e, "Final cache dump failed");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = cache.dump(&store) {
                            warn!(cache = %cache.inner.name, error = %e, "Cache dump failed");
                        }
                    }
                    changed = reloads.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let restored = cache.restore(&store);
                        debug!(cache = %cache.inner.name, restored, "Cache restored after reload");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = Cache::new("t", Duration::from_secs(10), false);
        assert!(cache.add("a", 1));
        assert_eq!(cache.get("a"), Some(1));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn access_extends_deadline() {
        let cache = Cache::new("t", Duration::from_secs(10), true);
        cache.add("a", 1);
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(8)).await;
            assert_eq!(cache.get("a"), Some(1));
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ignore_timeout_and_pop() {
        let cache = Cache::new("t", Duration::from_secs(5), false);
        cache.add("a", "x".to_string());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get_ignore_timeout("a").as_deref(), Some("x"));
        assert_eq!(cache.pop("a"), None);
        assert!(!cache.add_until("b", "y".to_string(), Instant::now()));
        assert!(!cache.add_with_ttl("c", "z".to_string(), Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_task_cleans_up() {
        let cache = Cache::new("t", Duration::from_secs(5), false);
        let token = CancellationToken::new();
        let handle = cache.spawn_eviction(token.clone());
        cache.add("a", 1);
        cache.add_with_ttl("b", 2, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.len(), 1);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn kept_entries_are_renewed() {
        let cache = Cache::new("t", Duration::from_secs(5), false);
        cache.add("busy", 1);
        cache.add("idle", 2);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.cleanup_unless(|v| *v == 1), 1);
        assert_eq!(cache.get("busy"), Some(1));
        assert_eq!(cache.get_ignore_timeout("idle"), None);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.cleanup(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn dump_and_restore_round_trip() {
        let store = JsonStore::in_memory("memory");
        let cache = Cache::new("uploads", Duration::from_secs(3600), false);
        cache.add("https://x.org/a.png", "img-1".to_string());
        cache.dump(&store).unwrap();
        assert!(store.exists(&["cache", "uploads", "https://x.org/a.png"]));

        let fresh: Cache<String> = Cache::new("uploads", Duration::from_secs(3600), false);
        assert_eq!(fresh.restore(&store), 1);
        assert_eq!(fresh.get("https://x.org/a.png").as_deref(), Some("img-1"));
    }
}
