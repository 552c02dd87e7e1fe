//! Persistent JSON documents: `config.json` and `memory.json`.
//!
//! A [`JsonStore`] keeps one JSON object in memory and mirrors it to disk:
//!
//! - Path-based access (`get_by_path(&["user_data", id, "tags"])`).
//! - Layered option lookup for conversations: `conversations.<conv>.<key>`,
//!   then the same with one `:`-suffix stripped at a time, then the top
//!   level, then registered defaults.
//! - Debounced saves written atomically (temp file + rename), followed by a
//!   timestamped backup; backups beyond `failsafe_backups` are pruned.
//! - A corrupt file is recovered from the newest parseable backup.
//! - A `_schema_version` key drives one-shot upgrade functions. Keys the
//!   upgrades do not know about are preserved untouched.
//!
//! # Example
//!
//! ```rust,ignore
//! let memory = JsonStore::open("memory.json", StoreOptions::default())?;
//! memory.set_by_path(&["user_data", "123", "nickname"], json!("bob"))?;
//! memory.save();
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};

/// Key holding the schema version inside every store.
pub const SCHEMA_KEY: &str = "_schema_version";

/// A schema upgrade step, applied once when moving past its index.
pub type Migration = fn(&mut Map<String, Value>);

/// Tuning for a [`JsonStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Delay between a `save()` request and the disk write.
    pub save_delay: Duration,
    /// Number of timestamped backups kept next to the file.
    pub failsafe_backups: usize,
    /// Ordered upgrade steps; `migrations[n]` upgrades version `n` to `n + 1`.
    pub migrations: Vec<Migration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            save_delay: Duration::from_secs(1),
            failsafe_backups: 3,
            migrations: Vec::new(),
        }
    }
}

impl StoreOptions {
    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations = migrations;
        self
    }
}

struct Inner {
    name: String,
    path: Option<PathBuf>,
    data: RwLock<Value>,
    defaults: RwLock<Map<String, Value>>,
    options: StoreOptions,
    dirty: AtomicBool,
    save_pending: AtomicBool,
    reloads: watch::Sender<u64>,
}

/// A JSON object persisted to a single file. Cheap to clone.
#[derive(Clone)]
pub struct JsonStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStore")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl JsonStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let mut data = load_file(&path)?;
        let upgraded = migrate(&mut data, &options.migrations);
        let store = Self::build(name, Some(path), data, options);
        if upgraded {
            store.inner.dirty.store(true, Ordering::Release);
            store.flush()?;
        }
        Ok(store)
    }

    /// Creates a store that never touches the disk.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::from_value(name, Value::Object(Map::new()))
    }

    /// Creates a disk-less store seeded with `data`.
    pub fn from_value(name: impl Into<String>, mut data: Value) -> Self {
        if !data.is_object() {
            data = Value::Object(Map::new());
        }
        Self::build(name.into(), None, data, StoreOptions::default())
    }

    fn build(name: String, path: Option<PathBuf>, data: Value, options: StoreOptions) -> Self {
        let (reloads, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name,
                path,
                data: RwLock::new(data),
                defaults: RwLock::new(Map::new()),
                options,
                dirty: AtomicBool::new(false),
                save_pending: AtomicBool::new(false),
                reloads,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    // ─── Path access ─────────────────────────────────────────────────────────

    pub fn get_by_path(&self, path: &[&str]) -> StoreResult<Value> {
        let data = self.inner.data.read();
        lookup(&data, path)
            .cloned()
            .ok_or_else(|| StoreError::key_not_found(path))
    }

    /// Reads and deserializes the value at `path`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &[&str]) -> StoreResult<T> {
        let value = self.get_by_path(path)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn exists(&self, path: &[&str]) -> bool {
        lookup(&self.inner.data.read(), path).is_some()
    }

    /// Writes `value` at `path`, creating intermediate objects.
    pub fn set_by_path(&self, path: &[&str], value: Value) -> StoreResult<()> {
        let Some((last, parents)) = path.split_last() else {
            return Err(StoreError::NotAnObject(String::new()));
        };
        let mut data = self.inner.data.write();
        let parent = walk_create(&mut data, parents)?;
        parent.insert((*last).to_string(), value);
        self.inner.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Removes and returns the value at `path`.
    pub fn pop_by_path(&self, path: &[&str]) -> StoreResult<Value> {
        let Some((last, parents)) = path.split_last() else {
            return Err(StoreError::key_not_found(path));
        };
        let mut data = self.inner.data.write();
        let mut node = &mut *data;
        for key in parents {
            node = node
                .get_mut(*key)
                .ok_or_else(|| StoreError::key_not_found(path))?;
        }
        let removed = node
            .as_object_mut()
            .and_then(|map| map.remove(*last))
            .ok_or_else(|| StoreError::key_not_found(path))?;
        self.inner.dirty.store(true, Ordering::Release);
        Ok(removed)
    }

    /// Makes sure an object exists at `path`. Returns `true` if created.
    pub fn ensure_path(&self, path: &[&str]) -> StoreResult<bool> {
        if self.exists(path) {
            return Ok(false);
        }
        let mut data = self.inner.data.write();
        walk_create(&mut data, path)?;
        self.inner.dirty.store(true, Ordering::Release);
        Ok(true)
    }

    /// Runs `f` with shared access to the whole document.
    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.inner.data.read())
    }

    /// Runs `f` with exclusive access and marks the store dirty.
    pub fn update<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        let result = f(&mut self.inner.data.write());
        self.inner.dirty.store(true, Ordering::Release);
        result
    }

    // ─── Options ─────────────────────────────────────────────────────────────

    /// Registers defaults used when a key is absent everywhere else.
    pub fn set_defaults(&self, defaults: Map<String, Value>) {
        self.inner.defaults.write().extend(defaults);
    }

    pub fn get_option(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.inner.data.read().get(key) {
            return Some(v.clone());
        }
        self.inner.defaults.read().get(key).cloned()
    }

    pub fn get_option_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_option(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Resolves `key` for a conversation, falling back through parent scopes.
    pub fn get_conv_option(&self, conv_id: &str, key: &str) -> Option<Value> {
        {
            let data = self.inner.data.read();
            let convs = data.get("conversations");
            let mut scope = conv_id;
            loop {
                if let Some(v) = convs.and_then(|c| c.get(scope)).and_then(|c| c.get(key)) {
                    return Some(v.clone());
                }
                match scope.rfind(':') {
                    Some(pos) => scope = &scope[..pos],
                    None => break,
                }
            }
        }
        self.get_option(key)
    }

    pub fn get_conv_option_as<T: DeserializeOwned>(&self, conv_id: &str, key: &str) -> Option<T> {
        self.get_conv_option(conv_id, key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    /// Requests a debounced save.
    ///
    /// Without a tokio runtime the write happens immediately.
    pub fn save(&self) {
        self.inner.dirty.store(true, Ordering::Release);
        if self.inner.path.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            if let Err(e) = self.flush() {
                error!(store = %self.inner.name, error = %e, "Failed to save store");
            }
            return;
        };
        if self.inner.save_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let store = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(store.inner.options.save_delay).await;
            store.inner.save_pending.store(false, Ordering::Release);
            let writer = store.clone();
            match tokio::task::spawn_blocking(move || writer.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(store = %store.inner.name, error = %e, "Failed to save store"),
                Err(e) => error!(store = %store.inner.name, error = %e, "Save task failed"),
            }
        });
    }

    /// Writes the document now if it changed since the last write.
    pub fn flush(&self) -> StoreResult<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        if !self.inner.dirty.swap(false, Ordering::AcqRel) && path.exists() {
            return Ok(());
        }
        let serialized = {
            let data = self.inner.data.read();
            serde_json::to_string_pretty(&*data)?
        };
        let tmp = sibling(path, "tmp");
        let result = std::fs::write(&tmp, serialized.as_bytes())
            .and_then(|()| std::fs::rename(&tmp, path));
        if let Err(e) = result {
            self.inner.dirty.store(true, Ordering::Release);
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(store = %self.inner.name, "Store written");
        self.backup(path);
        Ok(())
    }

    fn backup(&self, path: &Path) {
        let keep = self.inner.options.failsafe_backups;
        if keep == 0 {
            return;
        }
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
        let backup = sibling(path, &format!("{stamp}.bak"));
        if let Err(e) = std::fs::copy(path, &backup) {
            warn!(store = %self.inner.name, error = %e, "Failed to write backup");
            return;
        }
        let mut backups = list_backups(path);
        while backups.len() > keep {
            let oldest = backups.remove(0);
            if let Err(e) = std::fs::remove_file(&oldest) {
                warn!(path = %oldest.display(), error = %e, "Failed to prune backup");
            }
        }
    }

    /// Re-reads the file from disk and notifies subscribers.
    pub fn reload(&self) -> StoreResult<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let mut data = load_file(path)?;
        migrate(&mut data, &self.inner.options.migrations);
        *self.inner.data.write() = data;
        self.inner.dirty.store(false, Ordering::Release);
        self.inner.reloads.send_modify(|generation| *generation += 1);
        info!(store = %self.inner.name, "Store reloaded");
        Ok(())
    }

    /// Receiver that changes whenever [`reload`](Self::reload) completes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.reloads.subscribe()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn lookup<'a>(data: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(data, |node, key| node.get(*key))
}

fn walk_create<'a>(data: &'a mut Value, path: &[&str]) -> StoreResult<&'a mut Map<String, Value>> {
    let mut node = data;
    for (depth, key) in path.iter().enumerate() {
        let map = node
            .as_object_mut()
            .ok_or_else(|| StoreError::NotAnObject(path[..depth].join(".")))?;
        node = map
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
        .ok_or_else(|| StoreError::NotAnObject(path.join(".")))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn list_backups(path: &Path) -> Vec<PathBuf> {
    let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Vec::new();
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = format!("{file_name}.");
    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy())
                        .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".bak"))
                })
                .collect()
        })
        .unwrap_or_default();
    backups.sort();
    backups
}

fn load_file(path: &Path) -> StoreResult<Value> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Store file missing, starting empty");
            return Ok(Value::Object(Map::new()));
        }
        Err(e) => return Err(e.into()),
    };
    let primary_error = match parse_object(&raw) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    warn!(path = %path.display(), error = %primary_error, "Store file is corrupt, trying backups");
    for backup in list_backups(path).into_iter().rev() {
        let parsed = std::fs::read_to_string(&backup)
            .map_err(|e| e.to_string())
            .and_then(|raw| parse_object(&raw));
        match parsed {
            Ok(value) => {
                warn!(backup = %backup.display(), "Recovered store from backup");
                return Ok(value);
            }
            Err(e) => debug!(backup = %backup.display(), error = %e, "Backup unusable"),
        }
    }
    Err(StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: primary_error,
    })
}

fn parse_object(raw: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("top level is not an object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn migrate(data: &mut Value, migrations: &[Migration]) -> bool {
    let Some(map) = data.as_object_mut() else {
        return false;
    };
    let current = map.get(SCHEMA_KEY).and_then(Value::as_u64).unwrap_or(0) as usize;
    if current >= migrations.len() {
        return false;
    }
    for (version, step) in migrations.iter().enumerate().skip(current) {
        step(map);
        info!(from = version, to = version + 1, "Applied store schema upgrade");
    }
    map.insert(SCHEMA_KEY.to_string(), Value::from(migrations.len()));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &Path, options: StoreOptions) -> JsonStore {
        JsonStore::open(dir.join("config.json"), options).unwrap()
    }

    #[test]
    fn path_access() {
        let store = JsonStore::in_memory("test");
        store.set_by_path(&["a", "b", "c"], json!(1)).unwrap();
        assert_eq!(store.get_by_path(&["a", "b", "c"]).unwrap(), json!(1));
        assert!(store.exists(&["a", "b"]));
        assert!(matches!(
            store.get_by_path(&["a", "x"]),
            Err(StoreError::KeyNotFound(_))
        ));
        assert_eq!(store.pop_by_path(&["a", "b", "c"]).unwrap(), json!(1));
        assert!(!store.exists(&["a", "b", "c"]));
        assert!(store.ensure_path(&["z"]).unwrap());
        assert!(!store.ensure_path(&["z"]).unwrap());
    }

    #[test]
    fn set_through_scalar_fails() {
        let store = JsonStore::from_value("test", json!({"a": 5}));
        assert!(matches!(
            store.set_by_path(&["a", "b"], json!(1)),
            Err(StoreError::NotAnObject(_))
        ));
    }

    #[test]
    fn conv_option_falls_back_through_scopes() {
        let store = JsonStore::from_value(
            "config",
            json!({
                "silentmode": false,
                "conversations": {
                    "slack": {"silentmode": true, "prefix": "slack"},
                    "slack:team:chan": {"prefix": "chan"}
                }
            }),
        );
        store.set_defaults(
            json!({"command_timeout": 300})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(store.get_conv_option("slack:team:chan", "prefix"), Some(json!("chan")));
        assert_eq!(store.get_conv_option("slack:team:other", "prefix"), Some(json!("slack")));
        assert_eq!(store.get_conv_option("slack:team:chan", "silentmode"), Some(json!(true)));
        assert_eq!(store.get_conv_option("abc", "silentmode"), Some(json!(false)));
        assert_eq!(store.get_conv_option("abc", "command_timeout"), Some(json!(300)));
        assert_eq!(store.get_conv_option("abc", "missing"), None);
    }

    #[test]
    fn flush_writes_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), StoreOptions::default());
        for i in 0..5 {
            store.set_by_path(&["n"], json!(i)).unwrap();
            store.flush().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        let reopened = store_in(dir.path(), StoreOptions::default());
        assert_eq!(reopened.get_by_path(&["n"]).unwrap(), json!(4));
        assert_eq!(list_backups(&dir.path().join("config.json")).len(), 3);
    }

    #[test]
    fn corrupt_file_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), StoreOptions::default());
        store.set_by_path(&["keep"], json!("me")).unwrap();
        store.flush().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();

        let recovered = store_in(dir.path(), StoreOptions::default());
        assert_eq!(recovered.get_by_path(&["keep"]).unwrap(), json!("me"));
    }

    #[test]
    fn corrupt_without_backup_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "[1, 2").unwrap();
        let result = JsonStore::open(dir.path().join("config.json"), StoreOptions::default());
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn migrations_run_once_and_keep_unknown_keys() {
        fn add_users(map: &mut Map<String, Value>) {
            map.entry("user_data").or_insert_with(|| json!({}));
        }
        fn rename_flag(map: &mut Map<String, Value>) {
            if let Some(v) = map.remove("old_flag") {
                map.insert("new_flag".into(), v);
            }
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"old_flag": true, "custom": {"x": 1}}"#,
        )
        .unwrap();
        let options = StoreOptions::default().with_migrations(vec![add_users, rename_flag]);
        let store = store_in(dir.path(), options);
        assert_eq!(store.get_by_path(&["new_flag"]).unwrap(), json!(true));
        assert_eq!(store.get_by_path(&["custom", "x"]).unwrap(), json!(1));
        assert_eq!(store.get_by_path(&[SCHEMA_KEY]).unwrap(), json!(2));
        assert!(store.exists(&["user_data"]));
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_save_writes_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), StoreOptions::default());
        store.set_by_path(&["x"], json!(true)).unwrap();
        store.save();
        store.save();
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Let the blocking writer finish.
        for _ in 0..50 {
            if std::fs::read_to_string(dir.path().join("config.json"))
                .is_ok_and(|raw| raw.contains("\"x\""))
            {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(10));
        }
        let raw = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(raw.contains("\"x\": true"));
    }

    #[tokio::test]
    async fn reload_notifies_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), StoreOptions::default());
        let mut rx = store.subscribe();
        std::fs::write(dir.path().join("config.json"), r#"{"fresh": 1}"#).unwrap();
        store.reload().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        assert_eq!(store.get_by_path(&["fresh"]).unwrap(), json!(1));
    }
}
