//! The connect / reconnect loop.
//!
//! ```text
//! run ──► open config + memory stores
//!   loop:
//!     client = factory()
//!     bot = Bot::new(client) + built-in plugins + extra plugins
//!     bot.start()                       (memory load, reconcile, plugins)
//!     select {
//!       client.connect(inbound)  ──► session ended / failed
//!       stop token / signal      ──► graceful stop
//!       first event + reset_after ──► retry counter = 0
//!     }
//!     bot.shutdown(); client.disconnect()
//!     fatal error or retries exhausted ──► return
//!     sleep(retry * delay_step)
//! ```
//!
//! Inbound events are handled one at a time, in arrival order, by a pump
//! task owned by the session.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use syncbot_core::{ClientError, ClientFactory, JsonStore, ProtocolClient};
use syncbot_framework::{Bot, PluginDescriptor, register_builtins};

use crate::config::{ConfigResult, LogLevel, Settings, SettingsLoader};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use crate::stats::RuntimeStats;

/// How a single connection ended.
#[derive(Debug)]
enum SessionEnd {
    /// Stop was requested.
    Stopped,
    /// `connect` returned without error.
    Closed,
    Failed(ClientError),
}

/// Owns the reconnect loop for one primary-platform account.
///
/// ```rust,ignore
/// let runtime = SyncbotRuntime::builder(factory)
///     .config_file("syncbot.toml")
///     .plugin(MY_PLUGIN)
///     .build()?;
/// runtime.run().await?;
/// ```
pub struct SyncbotRuntime {
    settings: Settings,
    factory: ClientFactory,
    plugins: Vec<PluginDescriptor>,
    stats: Arc<RuntimeStats>,
    stop: CancellationToken,
}

impl SyncbotRuntime {
    /// Creates a runtime from already loaded settings. Logging is left to
    /// the caller.
    pub fn new(settings: Settings, factory: ClientFactory) -> Self {
        Self {
            settings,
            factory,
            plugins: Vec::new(),
            stats: Arc::new(RuntimeStats::default()),
            stop: CancellationToken::new(),
        }
    }

    pub fn builder(factory: ClientFactory) -> RuntimeBuilder {
        RuntimeBuilder::new(factory)
    }

    /// Adds a plugin loaded on every connect, after the built-in set.
    pub fn with_plugin(mut self, desc: PluginDescriptor) -> Self {
        self.plugins.push(desc);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> Arc<RuntimeStats> {
        Arc::clone(&self.stats)
    }

    /// Cancelling this token stops the runtime gracefully.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Runs until SIGINT / SIGTERM, a stop request, a fatal client error or
    /// the last retry.
    pub async fn run(&self) -> RuntimeResult<()> {
        let stop = self.stop.clone();
        let signals = tokio::spawn(async move {
            wait_for_signal().await;
            stop.cancel();
        });
        let result = self.run_until_stopped().await;
        signals.abort();
        result
    }

    /// Like [`run`](Self::run) without installing signal handlers.
    pub async fn run_until_stopped(&self) -> RuntimeResult<()> {
        let paths = &self.settings.paths;
        let config = JsonStore::open(&paths.config, paths.store_options())?;
        let memory = JsonStore::open(&paths.memory, paths.store_options())?;
        let retry = &self.settings.retry;

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }
            self.stats.connect_attempt();
            let client = (self.factory)();
            let attempt = self.stats.current_retry() + 1;
            let span = info_span!("session", platform = %client.platform(), attempt);
            let end = self
                .session(Arc::clone(&client), config.clone(), memory.clone())
                .instrument(span)
                .await;
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "Disconnect failed");
            }

            match end {
                SessionEnd::Stopped => {
                    info!("Runtime stopped");
                    return Ok(());
                }
                SessionEnd::Closed => warn!("Connection closed"),
                SessionEnd::Failed(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal client error, exiting");
                    return Err(e.into());
                }
                SessionEnd::Failed(e) => warn!(error = %e, "Session failed"),
            }

            let retries = self.stats.retry();
            if retries >= retry.max_retries {
                error!(attempts = retries, "Maximum retries reached, exiting");
                return Err(RuntimeError::RetriesExhausted { attempts: retries });
            }
            let delay = retry.delay_for(retries);
            info!(retry = retries, delay_secs = delay.as_secs(), "Reconnecting");
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(&self, client: Arc<dyn ProtocolClient>, config: JsonStore, memory: JsonStore) -> SessionEnd {
        let bot = Bot::new(client, config, memory, self.settings.bot.to_options());
        register_builtins(&bot);
        for desc in &self.plugins {
            if let Err(e) = bot.register_plugin(*desc) {
                warn!(plugin = desc.name, error = %e, "Plugin not registered");
            }
        }
        let end = self.drive(&bot).await;
        bot.shutdown().await;
        self.stats.session_ended();
        end
    }

    async fn drive(&self, bot: &Bot) -> SessionEnd {
        let active = match bot.start().await {
            Ok(active) => active,
            Err(e) => return SessionEnd::Failed(e),
        };
        self.stats.session_started(bot.downgrade(), active);
        info!(plugins = active, "Session started");

        let (inbound, mut events) = mpsc::unbounded_channel();
        let first_event = Arc::new(Notify::new());
        let pump = {
            let bot = bot.clone();
            let stats = Arc::clone(&self.stats);
            let first_event = Arc::clone(&first_event);
            tokio::spawn(async move {
                let mut seen = false;
                while let Some(event) = events.recv().await {
                    if !seen {
                        seen = true;
                        first_event.notify_one();
                    }
                    bot.handle_inbound(event).await;
                    stats.event();
                }
            })
        };

        let reset_after = self.settings.retry.reset_after();
        let mut reset_at: Option<Instant> = None;
        let mut reset_done = false;
        let client = Arc::clone(bot.client());
        let connect = client.connect(inbound);
        tokio::pin!(connect);

        let end = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break SessionEnd::Stopped,
                result = &mut connect => break match result {
                    Ok(()) => SessionEnd::Closed,
                    Err(e) => SessionEnd::Failed(e),
                },
                _ = first_event.notified(), if reset_at.is_none() => {
                    reset_at = Some(Instant::now() + reset_after);
                }
                _ = tokio::time::sleep_until(reset_at.unwrap_or_else(Instant::now)), if reset_at.is_some() && !reset_done => {
                    reset_done = true;
                    if self.stats.current_retry() > 0 {
                        debug!("Session is healthy, retry counter reset");
                    }
                    self.stats.reset_retry();
                }
            }
        };
        pump.abort();
        end
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                if signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, shutting down");
                } else {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        } else {
            warn!("Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Loads settings, applies command-line overrides and initialises logging.
pub struct RuntimeBuilder {
    factory: ClientFactory,
    loader: SettingsLoader,
    plugins: Vec<PluginDescriptor>,
}

impl RuntimeBuilder {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            factory,
            loader: SettingsLoader::new().with_current_dir().with_user_config_dir(),
            plugins: Vec::new(),
        }
    }

    /// Loads this settings file instead of searching for one.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.loader = self.loader.file(path);
        self
    }

    pub fn without_env(mut self) -> Self {
        self.loader = self.loader.without_env();
        self
    }

    /// Overrides `paths.config`.
    pub fn bot_config(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.loader = self.loader.bot_config(path);
        self
    }

    /// Overrides `paths.memory`.
    pub fn bot_memory(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.loader = self.loader.bot_memory(path);
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.loader = self.loader.log_level(level);
        self
    }

    /// Logs to `path`.
    pub fn log_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.loader = self.loader.log_file(path);
        self
    }

    pub fn plugin(mut self, desc: PluginDescriptor) -> Self {
        self.plugins.push(desc);
        self
    }

    pub fn build(self) -> ConfigResult<SyncbotRuntime> {
        let settings = self.loader.load()?;

        logging::init_from_config(&settings.logging);
        info!(
            log_level = %settings.logging.level,
            config = %settings.paths.config.display(),
            memory = %settings.paths.memory.display(),
            max_retries = settings.retry.max_retries,
            "Runtime configured"
        );

        let mut runtime = SyncbotRuntime::new(settings, self.factory);
        runtime.plugins = self.plugins;
        Ok(runtime)
    }
}

