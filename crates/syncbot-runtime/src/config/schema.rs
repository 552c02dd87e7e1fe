//! Settings schema definitions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use syncbot_core::StoreOptions;
use syncbot_framework::BotOptions;

/// Root settings structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Where the bot's stores live.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Reconnect policy.
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tuning for each bot session.
    #[serde(default)]
    pub bot: BotSettings,
}

// =============================================================================
// Paths
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// The bot configuration (`config.json`).
    #[serde(default = "default_config_path")]
    pub config: PathBuf,

    /// The bot memory (`memory.json`).
    #[serde(default = "default_memory_path")]
    pub memory: PathBuf,

    /// Seconds between a save request and the disk write.
    #[serde(default = "default_save_delay_secs")]
    pub save_delay_secs: u64,

    /// Timestamped backups kept per store.
    #[serde(default = "default_failsafe_backups")]
    pub failsafe_backups: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config: default_config_path(),
            memory: default_memory_path(),
            save_delay_secs: default_save_delay_secs(),
            failsafe_backups: default_failsafe_backups(),
        }
    }
}

impl PathsConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            save_delay: Duration::from_secs(self.save_delay_secs),
            failsafe_backups: self.failsafe_backups,
            ..StoreOptions::default()
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("syncbot"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

fn default_memory_path() -> PathBuf {
    data_dir().join("memory.json")
}

fn default_save_delay_secs() -> u64 {
    1
}

fn default_failsafe_backups() -> usize {
    3
}

// =============================================================================
// Retry
// =============================================================================

/// Reconnect policy.
///
/// After the `n`-th failed session the runtime sleeps `n * delay_step_secs`
/// before connecting again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of connect attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_delay_step_secs")]
    pub delay_step_secs: u64,

    /// Seconds after the first event of a session before the retry counter
    /// resets. Defaults to `max_retries`.
    #[serde(default)]
    pub reset_after_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_step_secs: default_delay_step_secs(),
            reset_after_secs: None,
        }
    }
}

impl RetryConfig {
    pub fn delay_for(&self, retry: u32) -> Duration {
        Duration::from_secs(self.delay_step_secs.saturating_mul(u64::from(retry)))
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_secs(
            self.reset_after_secs
                .unwrap_or_else(|| u64::from(self.max_retries)),
        )
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_delay_step_secs() -> u64 {
    5
}

// =============================================================================
// Bot session
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSettings {
    /// How long shutdown waits for sending queues to drain.
    #[serde(default = "default_queue_stop_timeout_secs")]
    pub queue_stop_timeout_secs: u64,

    /// How long an unloading plugin's tasks get to stop.
    #[serde(default = "default_unload_timeout_secs")]
    pub unload_timeout_secs: u64,

    /// Permits of the blocking worker pool.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_annotation_ttl_secs")]
    pub annotation_ttl_secs: u64,

    /// Pause between retries of a send that hit a blocked queue.
    #[serde(default = "default_block_retry_delay_ms")]
    pub block_retry_delay_ms: u64,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            queue_stop_timeout_secs: default_queue_stop_timeout_secs(),
            unload_timeout_secs: default_unload_timeout_secs(),
            worker_pool_size: default_worker_pool_size(),
            annotation_ttl_secs: default_annotation_ttl_secs(),
            block_retry_delay_ms: default_block_retry_delay_ms(),
        }
    }
}

impl BotSettings {
    pub fn to_options(&self) -> BotOptions {
        BotOptions {
            queue_stop_timeout: Duration::from_secs(self.queue_stop_timeout_secs),
            unload_timeout: Duration::from_secs(self.unload_timeout_secs),
            worker_pool_size: self.worker_pool_size,
            annotation_ttl: Duration::from_secs(self.annotation_ttl_secs),
            block_retry_delay: Duration::from_millis(self.block_retry_delay_ms),
        }
    }
}

fn default_queue_stop_timeout_secs() -> u64 {
    5
}

fn default_unload_timeout_secs() -> u64 {
    5
}

fn default_worker_pool_size() -> usize {
    10
}

fn default_annotation_ttl_secs() -> u64 {
    3600
}

fn default_block_retry_delay_ms() -> u64 {
    1000
}

// =============================================================================
// Logging
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Required when `output` is `file`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Per-module levels, e.g. `syncbot_framework::sync = "debug"`.
    #[serde(default)]
    pub filters: BTreeMap<String, LogLevel>,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line of each event.
    #[serde(default)]
    pub file_location: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            filters: BTreeMap::new(),
            thread_ids: false,
            file_location: false,
            span_events: SpanEventConfig::default(),
        }
    }
}
