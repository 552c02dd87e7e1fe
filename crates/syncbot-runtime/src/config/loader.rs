//! Settings loader using figment.
//!
//! Sources, later ones winning:
//!
//! 1. Built-in defaults
//! 2. The settings file: the one given with [`SettingsLoader::file`], else
//!    the first `syncbot.toml` / `syncbot.yaml` / `syncbot.yml` found in
//!    the search directories
//! 3. `SYNCBOT_*` environment variables, `__` separating nested keys
//!    (`SYNCBOT_PATHS__MEMORY=/srv/bot/memory.json`)
//! 4. Store and log overrides, normally from the command line
//!
//! Relative store and log paths written in a settings file are taken
//! relative to that file, so a deployment directory can carry
//! `syncbot.toml`, `config.json` and `memory.json` side by side.
//!
//! ```rust,ignore
//! let settings = SettingsLoader::new()
//!     .with_current_dir()
//!     .bot_memory("/srv/bot/memory.json")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::{Figment, Source};
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogLevel, LogOutput, Settings};
use super::validation::validate_settings;

/// Environment prefix; `SYNCBOT_SETTINGS` names the file and is not a key.
const ENV_PREFIX: &str = "SYNCBOT_";

/// Keys holding paths that follow the settings file they were written in.
const FILE_RELATIVE_KEYS: &[&str] = &["paths.config", "paths.memory", "logging.file_path"];

/// Builds [`Settings`] from defaults, a settings file, the environment and
/// explicit overrides.
pub struct SettingsLoader {
    search_paths: Vec<PathBuf>,
    settings_file: Option<PathBuf>,
    load_env: bool,
    overrides: Figment,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
            settings_file: None,
            load_env: true,
            overrides: Figment::new(),
        }
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    /// Adds `<user config dir>/syncbot`.
    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.search_path(dir.join("syncbot")),
            None => self,
        }
    }

    /// Loads exactly this settings file; a missing file is an error.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.settings_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Overrides `paths.config`.
    pub fn bot_config(self, path: impl Into<PathBuf>) -> Self {
        self.set("paths.config", path.into())
    }

    /// Overrides `paths.memory`.
    pub fn bot_memory(self, path: impl Into<PathBuf>) -> Self {
        self.set("paths.memory", path.into())
    }

    pub fn log_level(self, level: LogLevel) -> Self {
        self.set("logging.level", level)
    }

    /// Sends the log to `path` instead of the configured output.
    pub fn log_file(self, path: impl Into<PathBuf>) -> Self {
        self.set("logging.output", LogOutput::File)
            .set("logging.file_path", path.into())
    }

    fn set<T: serde::Serialize>(mut self, key: &str, value: T) -> Self {
        self.overrides = self.overrides.merge(Serialized::default(key, value));
        self
    }

    /// Loads, validates and returns the settings.
    pub fn load(self) -> ConfigResult<Settings> {
        let figment = self.build_figment()?;
        let mut settings: Settings = figment
            .extract()
            .map_err(|e| ConfigError::ParseError(format!("Failed to extract settings: {e}")))?;
        resolve_file_relative(&figment, &mut settings);
        validate_settings(&settings)?;
        debug!(
            config = %settings.paths.config.display(),
            memory = %settings.paths.memory.display(),
            log_level = %settings.logging.level,
            "Settings loaded"
        );
        Ok(settings)
    }

    fn build_figment(self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        let file = match self.settings_file {
            Some(path) if path.exists() => Some(path),
            Some(path) => return Err(ConfigError::FileNotFound(path)),
            None => find_settings_file(&self.search_paths),
        };
        match file {
            Some(path) => {
                info!(path = %path.display(), "Loading settings file");
                figment = merge_settings_file(figment, &path)?;
            }
            None => warn!("No settings file found, using defaults"),
        }
        if self.load_env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["SETTINGS"]).split("__"));
        }
        Ok(figment.merge(self.overrides))
    }
}

fn merge_settings_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::ParseError(format!(
            "Unsupported or disabled settings file format: .{ext}"
        ))),
    }
}

/// The first settings file over `directory × file name`.
fn find_settings_file(search_paths: &[PathBuf]) -> Option<PathBuf> {
    let names = file_names();
    search_paths
        .iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|path| path.exists())
}

/// Settings file names tried in every search directory, in order.
fn file_names() -> Vec<&'static str> {
    #[allow(unused_mut)]
    let mut names = Vec::new();
    #[cfg(feature = "toml-config")]
    names.push("syncbot.toml");
    #[cfg(feature = "yaml-config")]
    names.extend(["syncbot.yaml", "syncbot.yml"]);
    names
}

/// Anchors relative paths that came from a settings file at that file's
/// directory.
fn resolve_file_relative(figment: &Figment, settings: &mut Settings) {
    for key in FILE_RELATIVE_KEYS {
        let Some(dir) = figment
            .find_metadata(key)
            .and_then(|meta| match &meta.source {
                Some(Source::File(file)) => file.parent().map(Path::to_path_buf),
                _ => None,
            })
        else {
            continue;
        };
        let slot = match *key {
            "paths.config" => Some(&mut settings.paths.config),
            "paths.memory" => Some(&mut settings.paths.memory),
            _ => settings.logging.file_path.as_mut(),
        };
        if let Some(path) = slot.filter(|p| p.is_relative()) {
            *path = dir.join(&*path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_any_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsLoader::new()
            .search_path(dir.path())
            .without_env()
            .load()
            .unwrap();
        assert_eq!(settings.logging.level, LogLevel::Info);
        assert_eq!(settings.retry.max_retries, 5);
        assert!(settings.paths.config.ends_with("config.json"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = SettingsLoader::new()
            .file("/nonexistent/syncbot.toml")
            .without_env()
            .load();
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn overrides_beat_the_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("bot.log");
        let settings = SettingsLoader::new()
            .search_path(dir.path())
            .without_env()
            .bot_memory("/srv/bot/memory.json")
            .log_level(LogLevel::Debug)
            .log_file(&logs)
            .load()
            .unwrap();
        assert_eq!(settings.paths.memory, PathBuf::from("/srv/bot/memory.json"));
        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert_eq!(settings.logging.output, LogOutput::File);
        assert_eq!(settings.logging.file_path.as_deref(), Some(logs.as_path()));
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn store_paths_follow_the_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(
            dir.path().join("syncbot.toml"),
            "[paths]\nconfig = \"config.json\"\nmemory = \"/var/lib/syncbot/memory.json\"\n\
             [retry]\nmax_retries = 3\n",
        )
        .unwrap();
        std::fs::write(nested.join("syncbot.toml"), "[retry]\nmax_retries = 9\n").unwrap();

        let settings = SettingsLoader::new()
            .search_path(dir.path())
            .search_path(&nested)
            .without_env()
            .load()
            .unwrap();
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.paths.config, dir.path().join("config.json"));
        assert_eq!(settings.paths.memory, PathBuf::from("/var/lib/syncbot/memory.json"));

        let overridden = SettingsLoader::new()
            .file(dir.path().join("syncbot.toml"))
            .without_env()
            .bot_config("local.json")
            .load()
            .unwrap();
        assert_eq!(overridden.paths.config, PathBuf::from("local.json"));
    }
}
