//! The bot context.
//!
//! [`Bot`] is the one object every plugin entry point, handler and command
//! receives. It owns the registries of a session (handler hub, commands,
//! shared objects, plugins), the stores and the protocol client, and is
//! cheap to clone.
//!
//! ```text
//! InboundEvent ─► Bot::handle_inbound
//!                   ├─ Message    ─► annotations ─► primary_allmessages ∥ primary_message
//!                   ├─ Membership ─► conversation memory ─► SyncRouter::membership
//!                   ├─ Rename / Typing / Watermark / Call ─► their buckets
//!                   └─ ConversationUpdate ─► conversation memory
//! ```
//!
//! A new `Bot` is built for every connection; the runtime drops the old one
//! after [`Bot::shutdown`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use syncbot_core::client::{InboundEvent, OutgoingMessage, ProtocolClient};
use syncbot_core::conversation::target_tag;
use syncbot_core::error::{ClientError, ClientResult};
use syncbot_core::event::{ChatEvent, MembershipEvent, MessageBody};
use syncbot_core::image::ImagePipeline;
use syncbot_core::queue::{QueueControl, SENDING_BLOCK_RETRY_DELAY};
use syncbot_core::store::JsonStore;
use syncbot_core::user::{SYNC_USER_ID, SyncUser, User, is_canonical_id};
use syncbot_core::worker::{DEFAULT_WORKERS, WorkerPool};

use crate::annotations::{ANNOTATION_TTL, AnnotationRegistry};
use crate::commands::CommandDispatcher;
use crate::conversations::ConversationMemory;
use crate::error::PluginResult;
use crate::pluggable::{Call, HandlerHub};
use crate::plugin::{DEFAULT_UNLOAD_TIMEOUT, PluginDescriptor, PluginRegistry};
use crate::profilesync::ProfileSync;
use crate::shared::SharedRegistry;
use crate::sync::{PrimaryQueue, SYNC_NO_REPEAT_KEY, SyncMembership, SyncRouter};
use crate::tags::TagEngine;
use crate::users::UserStore;

/// How often expired annotations and cached users are dropped.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables of one bot session.
#[derive(Debug, Clone)]
pub struct BotOptions {
    /// How long shutdown waits for the sending queues to drain.
    pub queue_stop_timeout: Duration,
    pub unload_timeout: Duration,
    pub worker_pool_size: usize,
    pub annotation_ttl: Duration,
    pub block_retry_delay: Duration,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            queue_stop_timeout: Duration::from_secs(5),
            unload_timeout: DEFAULT_UNLOAD_TIMEOUT,
            worker_pool_size: DEFAULT_WORKERS,
            annotation_ttl: ANNOTATION_TTL,
            block_retry_delay: SENDING_BLOCK_RETRY_DELAY,
        }
    }
}

/// Defaults for every config key the core reads.
pub fn default_config() -> Map<String, Value> {
    let defaults = json!({
        "admins": [],
        "commands_admin": [],
        "commands_user": [],
        "commands_tagged": {},
        "commands_tags_escalate": false,
        "commands_prefix": ["/bot"],
        "command_timeout": 300,
        "silentmode": false,
        "sync_rooms": [],
        "sync_nicknames": false,
        "tagging": {"deny_prefix": "!", "merge": false},
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Result of looking up the bot's one-to-one with a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OneToOne {
    Found(String),
    /// The user cannot be messaged privately: a remote-only identity, or
    /// the user opted out.
    NotAllowed,
    /// The protocol client could not create the conversation.
    Failed,
}

struct BotInner {
    client: Arc<dyn ProtocolClient>,
    platform: String,
    self_user: User,
    options: BotOptions,
    config: JsonStore,
    memory: JsonStore,
    hub: HandlerHub,
    commands: CommandDispatcher,
    conversations: Arc<ConversationMemory>,
    tags: TagEngine,
    users: UserStore,
    profilesync: ProfileSync,
    annotations: Arc<AnnotationRegistry>,
    shared: SharedRegistry,
    plugins: PluginRegistry,
    sync: SyncRouter,
    images: ImagePipeline,
    queue_control: Arc<QueueControl>,
    primary: PrimaryQueue,
    token: CancellationToken,
}

/// Shared handle to one bot session.
#[derive(Clone)]
pub struct Bot {
    inner: Arc<BotInner>,
}

/// A non-owning handle, for background tasks that must not keep the
/// session alive.
#[derive(Clone)]
pub struct WeakBot {
    inner: Weak<BotInner>,
}

impl WeakBot {
    pub fn upgrade(&self) -> Option<Bot> {
        self.inner.upgrade().map(|inner| Bot { inner })
    }
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("platform", &self.inner.platform)
            .field("self_user", &self.inner.self_user.id)
            .finish_non_exhaustive()
    }
}

impl Bot {
    pub fn new(client: Arc<dyn ProtocolClient>, config: JsonStore, memory: JsonStore, options: BotOptions) -> Self {
        config.set_defaults(default_config());
        let platform = client.platform().to_string();
        let self_user = client.self_user();
        let conversations = Arc::new(ConversationMemory::new(memory.clone()));
        let annotations = Arc::new(AnnotationRegistry::new(options.annotation_ttl));
        let queue_control = QueueControl::new(options.block_retry_delay);
        let primary = PrimaryQueue::new(
            Arc::clone(&client),
            Arc::clone(&annotations),
            Arc::clone(&queue_control),
        );
        let inner = BotInner {
            tags: TagEngine::new(config.clone(), memory.clone(), Arc::clone(&conversations)),
            users: UserStore::new(memory.clone()),
            profilesync: ProfileSync::new(memory.clone()),
            images: ImagePipeline::new(WorkerPool::new(options.worker_pool_size)),
            hub: HandlerHub::new(),
            commands: CommandDispatcher::new(),
            shared: SharedRegistry::new(),
            plugins: PluginRegistry::new(),
            sync: SyncRouter::new(),
            token: CancellationToken::new(),
            client,
            platform,
            self_user,
            options,
            config,
            memory,
            conversations,
            annotations,
            queue_control,
            primary,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn downgrade(&self) -> WeakBot {
        WeakBot {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.inner.client
    }

    /// Platform tag of the primary platform.
    pub fn platform(&self) -> &str {
        &self.inner.platform
    }

    pub fn self_user(&self) -> User {
        self.inner.self_user.clone()
    }

    pub fn options(&self) -> &BotOptions {
        &self.inner.options
    }

    pub fn config(&self) -> &JsonStore {
        &self.inner.config
    }

    pub fn memory(&self) -> &JsonStore {
        &self.inner.memory
    }

    pub fn hub(&self) -> &HandlerHub {
        &self.inner.hub
    }

    pub fn commands(&self) -> &CommandDispatcher {
        &self.inner.commands
    }

    pub fn conversations(&self) -> &ConversationMemory {
        &self.inner.conversations
    }

    pub fn tags(&self) -> &TagEngine {
        &self.inner.tags
    }

    pub fn users(&self) -> &UserStore {
        &self.inner.users
    }

    pub fn profilesync(&self) -> &ProfileSync {
        &self.inner.profilesync
    }

    pub fn annotations(&self) -> &AnnotationRegistry {
        &self.inner.annotations
    }

    pub fn shared(&self) -> &SharedRegistry {
        &self.inner.shared
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.inner.plugins
    }

    pub fn sync(&self) -> &SyncRouter {
        &self.inner.sync
    }

    pub fn images(&self) -> &ImagePipeline {
        &self.inner.images
    }

    pub fn queue_control(&self) -> &Arc<QueueControl> {
        &self.inner.queue_control
    }

    pub fn primary_queue(&self) -> &PrimaryQueue {
        &self.inner.primary
    }

    /// Looks up a shared object registered by a plugin.
    pub fn get_shared<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.inner.shared.get(name)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.inner
            .config
            .get_option_as::<Vec<String>>("admins")
            .is_some_and(|admins| admins.iter().any(|a| a == user_id))
    }

    // ─── Sending ─────────────────────────────────────────────────────────────

    /// Sends a message from the bot.
    ///
    /// Primary conversations get it straight from the client, with
    /// `context` carried through a context annotation. Other conversations
    /// are reached through the `sending` bucket.
    pub async fn send_message(
        &self,
        conv_id: &str,
        body: impl Into<MessageBody>,
        context: Option<Map<String, Value>>,
    ) -> ClientResult<()> {
        let body = body.into();
        if syncbot_core::conversation::is_primary_conv(conv_id) {
            let mut message = OutgoingMessage::new(conv_id, body.into_segments());
            if let Some(context) = context.filter(|c| !c.is_empty()) {
                message = message.with_annotation(self.inner.annotations.attach_context(context.clone()));
                message.context = context;
            }
            return self.inner.client.send_message(message).await;
        }
        if self.inner.sync.emit_single(self, conv_id, body, context).await {
            Ok(())
        } else {
            Err(ClientError::Unsupported("no sending handler accepted the conversation"))
        }
    }

    /// The bot's one-to-one with `user_id`, created on demand.
    pub async fn get_1to1(&self, user_id: &str) -> OneToOne {
        if user_id == SYNC_USER_ID || !is_canonical_id(user_id) {
            return OneToOne::NotAllowed;
        }
        if self.inner.users.opted_out(user_id, None) {
            debug!(user_id = %user_id, "User opted out of one-to-ones");
            return OneToOne::NotAllowed;
        }
        if let Some(conv_id) = self.inner.users.one_to_one(user_id)
            && self.inner.conversations.contains(&conv_id)
        {
            return OneToOne::Found(conv_id);
        }
        match self.inner.client.create_one_to_one(user_id).await {
            Ok(conv_id) => {
                if let Err(e) = self.inner.users.set_one_to_one(user_id, &conv_id) {
                    warn!(user_id = %user_id, error = %e, "Failed to remember one-to-one");
                }
                OneToOne::Found(conv_id)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to open one-to-one");
                OneToOne::Failed
            }
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    pub fn register_plugin(&self, desc: PluginDescriptor) -> PluginResult<()> {
        self.inner.plugins.register(desc)
    }

    /// Loads memory, reconciles with the client, starts maintenance and
    /// loads every registered plugin. Returns the number of active plugins.
    pub async fn start(&self) -> ClientResult<usize> {
        let self_id = self.inner.self_user.id.clone();
        if let Err(e) = self.inner.conversations.load(&self_id) {
            warn!(error = %e, "Failed to load conversation memory");
        }
        self.inner
            .conversations
            .reconcile(self.inner.client.as_ref())
            .await?;
        self.inner.tags.refresh_indices();
        self.spawn_maintenance();
        self.inner.primary.spawn_eviction(self.inner.token.clone());
        let active = self.inner.plugins.load_all(self).await;
        info!(platform = %self.inner.platform, plugins = active, "Bot started");
        Ok(active)
    }

    fn spawn_maintenance(&self) {
        let weak = self.downgrade();
        let token = self.inner.token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(bot) = weak.upgrade() else { break };
                        let dropped = bot.annotations().cleanup();
                        if dropped > 0 {
                            debug!(dropped, "Expired annotations dropped");
                        }
                    }
                }
            }
        });
    }

    /// Drains the sending queues, unloads plugins and flushes the stores.
    pub async fn shutdown(&self) {
        let options = &self.inner.options;
        if let Err(e) = self
            .inner
            .queue_control
            .global_stop(options.queue_stop_timeout)
            .await
        {
            warn!(error = %e, "Sending queues did not drain");
        }
        self.inner.plugins.unload_all(self, options.unload_timeout).await;
        self.inner.token.cancel();
        for store in [&self.inner.config, &self.inner.memory] {
            if let Err(e) = store.flush() {
                warn!(store = %store.name(), error = %e, "Failed to flush store");
            }
        }
        info!("Bot shut down");
    }

    // ─── Inbound ─────────────────────────────────────────────────────────────

    pub async fn handle_inbound(&self, event: InboundEvent) {
        let span = info_span!("inbound", kind = event.kind(), conv_id = %event.conv_id());
        async {
            match event {
                InboundEvent::Message(e) => self.handle_chat_event(e).await,
                InboundEvent::Membership(e) => self.handle_membership(e).await,
                InboundEvent::Rename(e) => {
                    if let Some(mut conv) = self.inner.conversations.get_conv(&e.conv_id) {
                        conv.title.clone_from(&e.new_title);
                        self.store_conversation(conv);
                    }
                    self.inner.hub.rename.run(Call::new(self.clone(), Arc::new(e))).await;
                }
                InboundEvent::Typing(e) => {
                    self.inner.hub.typing.run(Call::new(self.clone(), Arc::new(e))).await;
                }
                InboundEvent::Watermark(e) => {
                    self.inner.hub.watermark.run(Call::new(self.clone(), Arc::new(e))).await;
                }
                InboundEvent::Call(e) => {
                    self.inner.hub.call.run(Call::new(self.clone(), Arc::new(e))).await;
                }
                InboundEvent::ConversationUpdate(conv) => self.store_conversation(conv),
            }
        }
        .instrument(span)
        .await;
    }

    fn store_conversation(&self, conv: syncbot_core::conversation::Conversation) {
        match self.inner.conversations.update(conv) {
            Ok(Some(update)) if update.created => debug!("New conversation stored"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to store conversation"),
        }
    }

    /// Runs a primary-platform message through annotations and the
    /// primary buckets.
    pub async fn handle_chat_event(&self, mut event: ChatEvent) {
        if let Err(e) = self.inner.users.store_user(&event.user) {
            warn!(user_id = %event.user.id, error = %e, "Failed to store user");
        }
        let reprocessors = self.inner.annotations.process(&event);
        if event.context.get(SYNC_NO_REPEAT_KEY) == Some(Value::Bool(true)) {
            event.syncroom_no_repeat = true;
        }
        let event = Arc::new(event);
        for (id, callback) in reprocessors {
            callback(self.clone(), Arc::clone(&event), id).await;
        }

        let hub = &self.inner.hub;
        let call = Call::new(self.clone(), event);
        if call.event.from_bot {
            hub.primary_allmessages.run(call).await;
        } else {
            futures::join!(hub.primary_allmessages.run(call.clone()), hub.primary_message.run(call));
        }
    }

    async fn handle_membership(&self, event: MembershipEvent) {
        if let Some(mut conv) = self.inner.conversations.get_conv(&event.conv_id) {
            for id in &event.participant_ids {
                match event.change {
                    syncbot_core::event::MembershipChange::Join => conv.participants.insert(id.clone()),
                    syncbot_core::event::MembershipChange::Leave => conv.participants.remove(id),
                };
            }
            self.store_conversation(conv);
        }

        let tag = target_tag(&event.conv_id, &self.inner.platform);
        let participants = event
            .participant_ids
            .iter()
            .map(|id| {
                let user = self
                    .inner
                    .users
                    .get_user(id)
                    .unwrap_or_else(|| User::new(id.clone(), ""));
                SyncUser::new(tag.clone(), user)
            })
            .collect();
        let change = SyncMembership::new(
            tag.clone(),
            event.conv_id.clone(),
            SyncUser::new(tag, event.user.clone()),
            event.change,
            participants,
        );
        self.inner.sync.membership(self, change).await;
    }
}
