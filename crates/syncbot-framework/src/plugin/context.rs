use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bot::Bot;
use crate::commands::{CommandCall, CommandReply, CommandSpec, Resolver};
use crate::error::{BoxError, PluginResult};
use crate::pluggable::HandlerHub;

/// Everything a plugin's init function may touch.
///
/// Registrations made through the context are owned by the plugin and are
/// removed when it unloads. Background work goes through [`spawn`], which
/// ties the task to the plugin's cancellation scope.
///
/// [`spawn`]: PluginContext::spawn
#[derive(Clone)]
pub struct PluginContext {
    name: &'static str,
    bot: Bot,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl PluginContext {
    pub(crate) fn new(name: &'static str, bot: Bot, token: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            name,
            bot,
            token,
            tracker,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    pub fn hub(&self) -> &HandlerHub {
        self.bot.hub()
    }

    /// Cancelled when the plugin unloads.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The plugin's section of the bot config (`<plugin name>` key).
    pub fn config<T: DeserializeOwned>(&self) -> Option<T> {
        self.bot.config().get_option_as(self.name)
    }

    /// Runs `fut` until it finishes or the plugin unloads.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        })
    }

    pub fn register_command<F, Fut>(&self, spec: CommandSpec, f: F)
    where
        F: Fn(CommandCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandReply, BoxError>> + Send + 'static,
    {
        self.bot.commands().register(Some(self.name), spec, f);
    }

    pub fn register_shared<T: Send + Sync + 'static>(&self, name: &str, value: Arc<T>) -> PluginResult<()> {
        self.bot.shared().register(Some(self.name), name, value)
    }

    pub fn register_preprocessor(
        &self,
        group: &str,
        priority: i32,
        pattern: &str,
        resolver: Resolver,
    ) -> Result<(), regex::Error> {
        self.bot
            .commands()
            .preprocessor()
            .register(group, Some(self.name), priority, pattern, resolver)
    }

    /// Declares that this plugin's platform supports profile sync.
    pub fn register_profilesync(&self, platform: &str, label: &str) {
        self.bot.profilesync().register(platform, label, Some(self.name));
    }
}
