//! Command registry, access rules and execution.
//!
//! ```text
//! dispatch(bot, event, ["tagset", "conv", "#here", "ops"])
//!     │
//!     ├─ unknown name ───────────────► unknown handler (unless silent)
//!     ├─ not in get_available_commands ► blocked handler (unless silent)
//!     ├─ ArgPreprocessor: #here → conv id
//!     └─ run(): timeout(command_timeout, service.oneshot(call))
//!                 ├─ Ok(reply)            → sent to the conversation
//!                 ├─ Err(Help)            → help text
//!                 ├─ Err(ArgumentError)   → "<cmd>: <message>"
//!                 ├─ elapsed              → "command execution timed out"
//!                 └─ Err(other)           → "<cmd> <ErrorKind>"
//! ```
//!
//! Commands are tower services, so a handler is any async closure taking a
//! [`CommandCall`] and returning a [`CommandReply`].

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tower::util::BoxCloneSyncService;
use tower::{ServiceExt, service_fn};
use tracing::{Instrument, debug, error, info_span, warn};

use syncbot_core::event::{ChatEvent, MessageBody};
use syncbot_core::format::Segment;

use crate::bot::Bot;
use crate::commands::preprocess::{ArgPreprocessor, ResolveContext};
use crate::commands::split::{ArgToken, shell_split};
use crate::error::{ArgumentError, BoxError, CommandError, CommandResult, Help, error_kind};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
pub const COMMAND_HELP: &str = "command_help";
pub const SILENT_TAG: &str = "silent";
pub const DEFAULT_PREFIX: &str = "/bot";

/// Arguments of one command invocation.
#[derive(Clone)]
pub struct CommandCall {
    pub bot: Bot,
    pub event: Arc<ChatEvent>,
    /// Lowercased command name.
    pub command: String,
    /// Arguments after preprocessing.
    pub args: Vec<String>,
}

impl CommandCall {
    pub fn conv_id(&self) -> &str {
        &self.event.conv_id
    }

    pub fn user_id(&self) -> &str {
        &self.event.user.id
    }

    /// Remaining arguments joined by spaces.
    pub fn rest(&self, from: usize) -> String {
        self.args.get(from..).map(|a| a.join(" ")).unwrap_or_default()
    }
}

/// What a command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    None,
    /// Markdown text for the calling conversation.
    Text(String),
    Segments(Vec<Segment>),
    /// A message for another conversation, with optional context.
    To {
        conv_id: String,
        body: MessageBody,
        context: Option<Map<String, Value>>,
    },
    /// Returned to the caller of [`CommandDispatcher::run`] as is.
    Value(Value),
}

impl From<String> for CommandReply {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for CommandReply {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

pub type CommandService = BoxCloneSyncService<CommandCall, CommandReply, BoxError>;

/// Declared properties of a command.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub name: String,
    pub help: String,
    pub admin: bool,
    /// Tag sets; holding every tag of any one set grants access.
    pub tags: Vec<BTreeSet<String>>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            ..Default::default()
        }
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    pub fn tagged<I, S>(mut self, tagset: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(tagset.into_iter().map(Into::into).collect());
        self
    }
}

struct CommandEntry {
    spec: CommandSpec,
    plugin: Option<String>,
    service: CommandService,
}

/// Commands visible to one user in one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableCommands {
    pub admin: BTreeSet<String>,
    pub user: BTreeSet<String>,
}

impl AvailableCommands {
    pub fn contains(&self, command: &str) -> bool {
        self.admin.contains(command) || self.user.contains(command)
    }
}

pub struct CommandDispatcher {
    commands: RwLock<BTreeMap<String, CommandEntry>>,
    /// Tag sets added by plugins for commands they do not own.
    extra_tags: RwLock<BTreeMap<String, Vec<BTreeSet<String>>>>,
    unknown: RwLock<Option<CommandService>>,
    blocked: RwLock<Option<CommandService>>,
    preprocessor: ArgPreprocessor,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(BTreeMap::new()),
            extra_tags: RwLock::new(BTreeMap::new()),
            unknown: RwLock::new(None),
            blocked: RwLock::new(None),
            preprocessor: ArgPreprocessor::new(),
        }
    }

    pub fn preprocessor(&self) -> &ArgPreprocessor {
        &self.preprocessor
    }

    // ─── Registration ────────────────────────────────────────────────────────

    pub fn register<F, Fut>(&self, plugin: Option<&str>, spec: CommandSpec, f: F)
    where
        F: Fn(CommandCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandReply, BoxError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_service(
            plugin,
            spec,
            BoxCloneSyncService::new(service_fn(move |call: CommandCall| f(call))),
        );
    }

    /// Registers a command; a later registration of the same name wins.
    pub fn register_service(&self, plugin: Option<&str>, spec: CommandSpec, service: CommandService) {
        let name = spec.name.clone();
        let previous = self.commands.write().insert(
            name.clone(),
            CommandEntry {
                spec,
                plugin: plugin.map(str::to_string),
                service,
            },
        );
        if previous.is_some() {
            warn!(command = %name, plugin = ?plugin, "Command replaced");
        } else {
            debug!(command = %name, plugin = ?plugin, "Command registered");
        }
    }

    /// Adds a tag set to `command`, registered or not.
    pub fn register_tags<I, S>(&self, command: &str, tagset: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_tags
            .write()
            .entry(command.to_lowercase())
            .or_default()
            .push(tagset.into_iter().map(Into::into).collect());
    }

    pub fn set_unknown_handler(&self, service: CommandService) {
        *self.unknown.write() = Some(service);
    }

    pub fn set_blocked_handler(&self, service: CommandService) {
        *self.blocked.write() = Some(service);
    }

    /// Removes the commands `plugin` registered; returns how many.
    pub fn deregister_plugin(&self, plugin: &str) -> usize {
        let mut commands = self.commands.write();
        let before = commands.len();
        commands.retain(|_, c| c.plugin.as_deref() != Some(plugin));
        before - commands.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.commands.read().keys().cloned().collect()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.commands.read().contains_key(&command.to_lowercase())
    }

    pub fn spec(&self, command: &str) -> Option<CommandSpec> {
        self.commands
            .read()
            .get(&command.to_lowercase())
            .map(|c| c.spec.clone())
    }

    /// Help text: `command_help.<cmd>` in memory, else the registered help.
    pub fn help_text(&self, bot: &Bot, command: &str) -> Option<String> {
        let command = command.to_lowercase();
        if let Ok(Value::String(text)) = bot.memory().get_by_path(&[COMMAND_HELP, command.as_str()]) {
            return Some(format_help(&text));
        }
        self.spec(&command)
            .map(|s| s.help)
            .filter(|h| !h.trim().is_empty())
            .map(|h| format_help(&h))
    }

    // ─── Access rules ────────────────────────────────────────────────────────

    /// Splits the registered commands into those `user_id` may run in
    /// `conv_id` as an admin and as a regular user.
    pub fn get_available_commands(&self, bot: &Bot, user_id: &str, conv_id: &str) -> AvailableCommands {
        let config = bot.config();
        let (all, declared_admin, mut tagged) = {
            let commands = self.commands.read();
            let all: BTreeSet<String> = commands.keys().cloned().collect();
            let declared_admin: BTreeSet<String> = commands
                .values()
                .filter(|c| c.spec.admin)
                .map(|c| c.spec.name.clone())
                .collect();
            let mut tagged: BTreeMap<String, Vec<BTreeSet<String>>> = commands
                .values()
                .filter(|c| !c.spec.tags.is_empty())
                .map(|c| (c.spec.name.clone(), c.spec.tags.clone()))
                .collect();
            for (command, sets) in self.extra_tags.read().iter() {
                tagged.entry(command.clone()).or_default().extend(sets.iter().cloned());
            }
            (all, declared_admin, tagged)
        };
        for (command, sets) in configured_tagsets(config.get_conv_option(conv_id, "commands_tagged")) {
            tagged.entry(command).or_default().extend(sets);
        }

        let commands_admin = config.get_conv_option(conv_id, "commands_admin");
        let commands_user = config.get_conv_option(conv_id, "commands_user");
        let escalate = config
            .get_conv_option_as::<bool>(conv_id, "commands_tags_escalate")
            .unwrap_or(false);

        let mut admin: BTreeSet<String>;
        let mut user: BTreeSet<String>;
        if commands_admin == Some(Value::Bool(true)) {
            admin = all.clone();
            user = BTreeSet::new();
        } else if commands_user == Some(Value::Bool(true)) {
            admin = BTreeSet::new();
            user = all.clone();
        } else if let Some(listed) = commands_user.as_ref().and_then(string_list).filter(|l| !l.is_empty()) {
            user = listed.intersection(&all).cloned().collect();
            admin = all.difference(&user).cloned().collect();
        } else {
            admin = commands_admin
                .as_ref()
                .and_then(string_list)
                .unwrap_or_default()
                .union(&declared_admin)
                .filter(|c| all.contains(*c))
                .cloned()
                .collect();
            user = all.difference(&admin).cloned().collect();
        }

        if !tagged.is_empty() {
            let active = bot.tags().user_active(user_id, Some(conv_id));
            let deny = bot.tags().deny_prefix();
            for (command, tagsets) in &tagged {
                if !all.contains(command) {
                    continue;
                }
                // Escalated tagged commands are admin-only whatever the tags say.
                if escalate {
                    user.remove(command);
                    admin.insert(command.clone());
                    continue;
                }
                let denied = tagsets
                    .iter()
                    .flatten()
                    .any(|tag| active.contains(&format!("{deny}{tag}")));
                if denied {
                    user.remove(command);
                } else if tagsets.iter().any(|set| !set.is_empty() && set.is_subset(&active)) {
                    user.insert(command.clone());
                }
            }
        }

        if !bot.is_admin(user_id) {
            admin.clear();
        }

        let admin = admin.difference(&user).cloned().collect();
        AvailableCommands { admin, user }
    }

    fn is_silent(&self, bot: &Bot, user_id: &str, conv_id: &str) -> bool {
        bot.config()
            .get_conv_option_as::<bool>(conv_id, "silentmode")
            .unwrap_or(false)
            || bot.tags().user_active(user_id, Some(conv_id)).contains(SILENT_TAG)
            || bot.tags().conv_active(conv_id).contains(SILENT_TAG)
    }

    // ─── Execution ───────────────────────────────────────────────────────────

    /// Treats `event` as a command line if it starts with one of the
    /// conversation's `commands_prefix` words. Returns whether it did.
    pub async fn handle_message(&self, bot: &Bot, event: Arc<ChatEvent>) -> bool {
        let prefixes = bot
            .config()
            .get_conv_option_as::<Vec<String>>(&event.conv_id, "commands_prefix")
            .unwrap_or_else(|| vec![DEFAULT_PREFIX.to_string()]);
        let tokens = shell_split(&event.text());
        let Some(first) = tokens.first() else {
            return false;
        };
        let word = first.text.to_lowercase();
        if !prefixes.iter().any(|p| p.to_lowercase() == word) {
            return false;
        }
        if tokens.len() < 2 {
            if !self.is_silent(bot, &event.user.id, &event.conv_id) {
                let text = format!("{}: Missing parameter(s)", event.user.full_name);
                self.send_text(bot, &event.conv_id, text).await;
            }
            return true;
        }
        let args = tokens.into_iter().skip(1).collect();
        if let Err(e) = self.dispatch(bot, event, args).await {
            warn!(error = %e, "Command dispatch failed");
        }
        true
    }

    /// Routes an already split command line (without the trigger prefix).
    pub async fn dispatch(
        &self,
        bot: &Bot,
        event: Arc<ChatEvent>,
        mut args: Vec<ArgToken>,
    ) -> CommandResult<Option<Value>> {
        if args.is_empty() {
            return Ok(None);
        }
        let command = args.remove(0).text.to_lowercase();
        let conv_id = event.conv_id.clone();
        let user_id = event.user.id.clone();

        let fallback = if !self.contains(&command) {
            Some((self.unknown.read().clone(), "Unknown Command"))
        } else if !self.get_available_commands(bot, &user_id, &conv_id).contains(&command) {
            Some((self.blocked.read().clone(), "Can't do that."))
        } else {
            None
        };
        if let Some((handler, default_text)) = fallback {
            debug!(command = %command, user_id = %user_id, conv_id = %conv_id, "Command not runnable");
            if self.is_silent(bot, &user_id, &conv_id) {
                return Ok(None);
            }
            let reply = match handler {
                Some(service) => {
                    let call = CommandCall {
                        bot: bot.clone(),
                        event: Arc::clone(&event),
                        command: command.clone(),
                        args: args.into_iter().map(|a| a.text).collect(),
                    };
                    service.oneshot(call).await.unwrap_or_else(|e| {
                        error!(command = %command, error = %e, "Fallback command handler failed");
                        CommandReply::None
                    })
                }
                None => CommandReply::Text(format!("{}: {default_text}", event.user.full_name)),
            };
            return self.deliver(bot, &event, &command, reply).await;
        }

        let resolved = {
            let ctx = ResolveContext {
                conversations: bot.conversations(),
                users: bot.users(),
                conv_id: &conv_id,
                user_id: &user_id,
            };
            self.preprocessor.process(&ctx, args)
        };
        match resolved {
            Ok(args) => self.run(bot, event, &command, args, false).await,
            Err(e) => {
                self.send_text(bot, &conv_id, format!("{command}: {e}")).await;
                Ok(None)
            }
        }
    }

    /// Runs `command` with `args`, turning handler errors into replies.
    ///
    /// With `raise_exceptions`, failures are returned instead of replied.
    pub async fn run(
        &self,
        bot: &Bot,
        event: Arc<ChatEvent>,
        command: &str,
        args: Vec<String>,
        raise_exceptions: bool,
    ) -> CommandResult<Option<Value>> {
        let command = command.to_lowercase();
        let service = self
            .commands
            .read()
            .get(&command)
            .map(|c| c.service.clone())
            .or_else(|| self.unknown.read().clone());
        let Some(service) = service else {
            return Err(CommandError::Unknown(command));
        };
        let timeout = bot
            .config()
            .get_option_as::<u64>("command_timeout")
            .map_or(DEFAULT_COMMAND_TIMEOUT, Duration::from_secs);
        let call = CommandCall {
            bot: bot.clone(),
            event: Arc::clone(&event),
            command: command.clone(),
            args,
        };

        let span = info_span!("command", command = %command, conv_id = %event.conv_id);
        let result = tokio::time::timeout(timeout, service.oneshot(call))
            .instrument(span)
            .await;
        let conv_id = event.conv_id.as_str();

        match result {
            Ok(Ok(reply)) => self.deliver(bot, &event, &command, reply).await,
            Err(_) => {
                warn!(command = %command, timeout_secs = timeout.as_secs(), "Command timed out");
                if raise_exceptions {
                    return Err(CommandError::Timeout(command));
                }
                self.send_text(bot, conv_id, "command execution timed out".to_string()).await;
                Ok(None)
            }
            Ok(Err(e)) => {
                if let Some(help) = e.downcast_ref::<Help>() {
                    let mut parts = Vec::new();
                    if let Some(message) = &help.0 {
                        parts.push(message.clone());
                    }
                    if let Some(text) = self.help_text(bot, &command) {
                        parts.push(format!("**{command}**\n{text}"));
                    }
                    if !parts.is_empty() {
                        self.send_text(bot, conv_id, parts.join("\n\n")).await;
                    }
                    return Ok(None);
                }
                if let Some(arg) = e.downcast_ref::<ArgumentError>() {
                    if raise_exceptions {
                        return Err(CommandError::Argument(arg.clone()));
                    }
                    self.send_text(bot, conv_id, format!("{command}: {arg}")).await;
                    return Ok(None);
                }
                error!(command = %command, error = %e, "Command failed");
                if raise_exceptions {
                    return Err(CommandError::Failed { command, source: e });
                }
                let kind = error_kind(e.as_ref());
                self.send_text(bot, conv_id, format!("{command} {kind}")).await;
                Ok(None)
            }
        }
    }

    async fn deliver(
        &self,
        bot: &Bot,
        event: &ChatEvent,
        command: &str,
        reply: CommandReply,
    ) -> CommandResult<Option<Value>> {
        let sent = match reply {
            CommandReply::None => return Ok(None),
            CommandReply::Value(value) => return Ok(Some(value)),
            CommandReply::Text(text) => bot.send_message(&event.conv_id, text, None).await,
            CommandReply::Segments(segments) => bot.send_message(&event.conv_id, segments, None).await,
            CommandReply::To {
                conv_id,
                body,
                context,
            } => bot.send_message(&conv_id, body, context).await,
        };
        if let Err(e) = sent {
            warn!(command = %command, error = %e, "Failed to send command reply");
        }
        Ok(None)
    }

    async fn send_text(&self, bot: &Bot, conv_id: &str, text: String) {
        if let Err(e) = bot.send_message(conv_id, text, None).await {
            warn!(conv_id = %conv_id, error = %e, "Failed to send command message");
        }
    }
}

/// Parses `commands_tagged`: `{cmd: [tag | [tag, ...], ...]}`.
fn configured_tagsets(value: Option<Value>) -> BTreeMap<String, Vec<BTreeSet<String>>> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.into_iter()
        .map(|(command, sets)| {
            let sets = match sets {
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(tag) => Some(BTreeSet::from([tag])),
                        Value::Array(_) => string_list(&item),
                        _ => None,
                    })
                    .collect(),
                Value::String(tag) => vec![BTreeSet::from([tag])],
                _ => Vec::new(),
            };
            (command.to_lowercase(), sets)
        })
        .collect()
}

fn string_list(value: &Value) -> Option<BTreeSet<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_lowercase)
            .collect()
    })
}

/// Dedents help text and drops surrounding blank lines.
fn format_help(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    text.lines()
        .map(|l| l.get(indent..).unwrap_or(l.trim_start()).trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_string()
}

// ─── clap integration ───────────────────────────────────────────────────────

/// Parses command arguments into a clap type.
///
/// `--help` turns into [`Help`] with clap's rendered usage; other parse
/// errors into [`ArgumentError`].
#[cfg(feature = "clap")]
pub fn parse_args<T: clap::Parser>(command: &str, args: &[String]) -> Result<T, BoxError> {
    use clap::error::ErrorKind;

    let argv = std::iter::once(command.to_string()).chain(args.iter().cloned());
    T::try_parse_from(argv).map_err(|err| -> BoxError {
        match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                Box::new(Help::with_message(err.to_string()))
            }
            _ => Box::new(ArgumentError::new(err.to_string().trim())),
        }
    })
}
