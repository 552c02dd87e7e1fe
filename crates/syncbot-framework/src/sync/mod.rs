//! The sync router.
//!
//! One inbound message is fanned out to every conversation transitively
//! linked to its source by the `sync_conv` handlers:
//!
//! ```text
//! SyncMessage ─► get_synced_conversations(source) = [source, B, C, ...]
//!                    │
//!                    ├─ for each target T (sequentially):
//!                    │    skip if tag(T) ∈ previous_targets, else insert it
//!                    │    apply image policy for T
//!                    │    sending ─► allmessages ∥ message
//!                    │    primary_* buckets when T is primary and source is not
//!                    │
//!                    └─ allmessages_once ∥ message_once ─► command routing
//! ```
//!
//! `previous_targets` and `notified_users` are shared by every destination
//! of one fan-out, so a relay that comes back through another platform sees
//! the tags recorded by the first pass and stops.

mod policy;
mod primary;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{Instrument, debug, info_span, warn};

use syncbot_core::cache::Cache;
use syncbot_core::conversation::{is_primary_conv, platform_of, target_tag};
use syncbot_core::event::{
    ChatEvent, EventContext, MembershipChange, MessageBody, SyncEvent, SyncEventMembership,
    SyncReply, TargetSet,
};
use syncbot_core::image::SyncImage;
use syncbot_core::user::{SyncUser, User, is_canonical_id};

use crate::bot::Bot;
use crate::pluggable::Call;

pub use policy::ImagePolicy;
pub use primary::{PrimaryQueue, QueuedMessage, SYNC_NO_REPEAT_KEY};

/// How long the users of a synced conversation are cached.
pub const USER_LIST_TTL: Duration = Duration::from_secs(1800);

// =============================================================================
// Bucket arguments
// =============================================================================

/// Argument of the `sync_conv` and `sync_conv_user` buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConvQuery {
    pub conv_id: String,
    /// Platform asking; a handler may refuse to expand its own queries.
    pub caller: Option<String>,
}

/// Argument of the `sync_user_kick` bucket.
#[derive(Debug, Clone)]
pub struct KickRequest {
    pub conv_id: String,
    pub user: SyncUser,
}

/// What a `sync_user_kick` handler did for its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KickOutcome {
    /// The handler does not manage this conversation.
    NotResponsible,
    Failed,
    Kicked,
    /// The user may not be kicked.
    Whitelisted,
}

impl KickOutcome {
    /// Combines per-conversation results: whitelisted beats kicked beats
    /// failed beats not responsible.
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// A message entering the router.
#[derive(Debug, Clone)]
pub struct SyncMessage {
    /// Source tag, `platform:chat`.
    pub identifier: String,
    pub conv_id: String,
    pub user: SyncUser,
    pub body: MessageBody,
    pub reply: Option<SyncReply>,
    pub image: Option<Arc<SyncImage>>,
    pub title: Option<String>,
    pub edited: bool,
    pub from_bot: bool,
    /// Set when relaying something that already went through a fan-out.
    pub previous_targets: Option<TargetSet>,
    pub notified_users: Option<TargetSet>,
    pub context: Map<String, Value>,
}

impl SyncMessage {
    pub fn new(
        identifier: impl Into<String>,
        conv_id: impl Into<String>,
        user: SyncUser,
        body: impl Into<MessageBody>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            conv_id: conv_id.into(),
            user,
            body: body.into(),
            reply: None,
            image: None,
            title: None,
            edited: false,
            from_bot: false,
            previous_targets: None,
            notified_users: None,
            context: Map::new(),
        }
    }

    /// The relay of a primary-platform message.
    pub fn from_chat(event: &ChatEvent, primary: &str) -> Self {
        let mut message = Self::new(
            target_tag(&event.conv_id, primary),
            event.conv_id.clone(),
            SyncUser::new(target_tag(&event.conv_id, primary), event.user.clone()),
            event.segments.clone(),
        );
        message.image = event.image.clone();
        message.from_bot = event.from_bot;
        message.context = event.context.snapshot();
        message
    }

    pub fn with_reply(mut self, reply: SyncReply) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_image(mut self, image: Arc<SyncImage>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn edited(mut self) -> Self {
        self.edited = true;
        self
    }

    pub fn from_bot(mut self) -> Self {
        self.from_bot = true;
        self
    }

    pub fn with_previous_targets(mut self, targets: TargetSet) -> Self {
        self.previous_targets = Some(targets);
        self
    }

    pub fn with_notified_users(mut self, users: TargetSet) -> Self {
        self.notified_users = Some(users);
        self
    }
}

/// A membership change entering the router.
#[derive(Debug, Clone)]
pub struct SyncMembership {
    pub identifier: String,
    pub conv_id: String,
    pub user: SyncUser,
    pub change: MembershipChange,
    pub participants: Vec<SyncUser>,
    pub title: Option<String>,
    pub previous_targets: Option<TargetSet>,
}

impl SyncMembership {
    pub fn new(
        identifier: impl Into<String>,
        conv_id: impl Into<String>,
        user: SyncUser,
        change: MembershipChange,
        participants: Vec<SyncUser>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            conv_id: conv_id.into(),
            user,
            change,
            participants,
            title: None,
            previous_targets: None,
        }
    }
}

/// What one fan-out did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Destinations the event was emitted to, in order.
    pub delivered: Vec<String>,
    /// Destinations skipped because they were already reached.
    pub skipped: Vec<String>,
    /// Destinations where a `sending` handler suppressed the event.
    pub suppressed: Vec<String>,
}

// =============================================================================
// SyncRouter
// =============================================================================

pub struct SyncRouter {
    users: Cache<Vec<SyncUser>>,
}

impl Default for SyncRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncRouter {
    pub fn new() -> Self {
        Self {
            users: Cache::new("sync.users", USER_LIST_TTL, false),
        }
    }

    // ─── Topology ────────────────────────────────────────────────────────────

    /// Every conversation linked to `conv_id`, with `conv_id` first.
    pub async fn get_synced_conversations(&self, bot: &Bot, conv_id: &str, caller: Option<&str>) -> Vec<String> {
        let mut ordered = vec![conv_id.to_string()];
        let mut seen = BTreeSet::from([conv_id.to_string()]);
        let mut frontier = VecDeque::from([conv_id.to_string()]);
        while let Some(current) = frontier.pop_front() {
            let query = SyncConvQuery {
                conv_id: current,
                caller: caller.map(str::to_string),
            };
            let report = bot
                .hub()
                .sync_conv
                .run(Call::new(bot.clone(), Arc::new(query)))
                .await;
            for peer in report.results.into_iter().flatten() {
                if seen.insert(peer.clone()) {
                    ordered.push(peer.clone());
                    frontier.push_back(peer);
                }
            }
        }
        ordered
    }

    // ─── Messages ────────────────────────────────────────────────────────────

    /// Relays `message` to every synced conversation.
    pub async fn message(&self, bot: &Bot, message: SyncMessage) -> FanOut {
        let span = info_span!("sync_message", source = %message.identifier, conv_id = %message.conv_id);
        self.fan_out(bot, message).instrument(span).await
    }

    async fn fan_out(&self, bot: &Bot, message: SyncMessage) -> FanOut {
        let primary = bot.platform();
        let fresh = message.previous_targets.is_none();
        let previous_targets = message.previous_targets.clone().unwrap_or_default();
        previous_targets.insert(message.identifier.clone());
        let notified_users = message.notified_users.clone().unwrap_or_default();
        if is_canonical_id(message.user.id()) {
            notified_users.insert(message.user.id());
        }
        let context = EventContext::from_map(message.context.clone());
        let segments = message.body.clone().into_segments();
        let source_is_primary = is_primary_conv(&message.conv_id);

        let caller = platform_of(&message.identifier, &primary).to_string();
        let targets = self
            .get_synced_conversations(bot, &message.conv_id, Some(&caller))
            .await;

        let mut fan_out = FanOut::default();
        let mut first_event: Option<Arc<SyncEvent>> = None;
        let mut command_event: Option<Arc<ChatEvent>> = None;

        for target in targets {
            let tag = target_tag(&target, &primary);
            let is_source = fresh && target == message.conv_id;
            if !previous_targets.insert(tag.clone()) && !is_source {
                debug!(target = %target, "Already reached, skipping");
                fan_out.skipped.push(target);
                continue;
            }

            let mut event = SyncEvent::new(
                message.identifier.clone(),
                target.clone(),
                message.conv_id.clone(),
                message.user.clone(),
                segments.clone(),
                previous_targets.clone(),
                notified_users.clone(),
                Arc::clone(&context),
            );
            event.reply = message.reply.clone();
            event.image = message.image.clone();
            event.title = message.title.clone();
            event.edited = message.edited;
            event.from_bot = message.from_bot;
            ImagePolicy::for_conv(bot.config(), &target)
                .apply(bot.images(), &mut event)
                .await;

            let event = Arc::new(event);
            let call = Call::new(bot.clone(), Arc::clone(&event));
            if bot.hub().sending.run(call.clone()).await.suppressed {
                debug!(target = %target, "Sending suppressed");
                fan_out.suppressed.push(target);
                continue;
            }
            fan_out.delivered.push(target.clone());
            first_event.get_or_insert_with(|| Arc::clone(&event));

            let hub = bot.hub();
            if message.from_bot {
                hub.allmessages.run(call).await;
            } else {
                futures::join!(hub.allmessages.run(call.clone()), hub.message.run(call));
            }

            if is_primary_conv(&target) && !source_is_primary {
                event.set_syncroom_no_repeat(true);
                let chat = Arc::new(event.to_chat_event());
                let chat_call = Call::new(bot.clone(), Arc::clone(&chat));
                if message.from_bot {
                    hub.primary_allmessages.run(chat_call).await;
                } else {
                    futures::join!(
                        hub.primary_allmessages.run(chat_call.clone()),
                        hub.primary_message.run(chat_call)
                    );
                }
                command_event.get_or_insert(chat);
            }
        }

        if let Some(event) = first_event {
            let hub = bot.hub();
            let call = Call::new(bot.clone(), event);
            if message.from_bot {
                hub.allmessages_once.run(call).await;
            } else {
                futures::join!(hub.allmessages_once.run(call.clone()), hub.message_once.run(call));
            }
        }

        if !source_is_primary
            && !message.from_bot
            && is_canonical_id(message.user.id())
            && let Some(chat) = command_event
        {
            bot.commands().handle_message(bot, chat).await;
        }

        debug!(
            delivered = fan_out.delivered.len(),
            skipped = fan_out.skipped.len(),
            suppressed = fan_out.suppressed.len(),
            "Fan-out finished"
        );
        fan_out
    }

    /// Emits a message from the bot into one non-primary conversation.
    ///
    /// Returns whether any `sending` handler accepted it.
    pub async fn emit_single(
        &self,
        bot: &Bot,
        conv_id: &str,
        body: MessageBody,
        context: Option<Map<String, Value>>,
    ) -> bool {
        let tag = target_tag(conv_id, &bot.platform());
        let user = SyncUser::new(tag.clone(), bot.self_user());
        let mut event = SyncEvent::new(
            tag.clone(),
            conv_id,
            conv_id,
            user,
            body.into_segments(),
            TargetSet::with([tag]),
            TargetSet::new(),
            EventContext::from_map(context.unwrap_or_default()),
        );
        event.from_bot = true;
        let report = bot
            .hub()
            .sending
            .run(Call::new(bot.clone(), Arc::new(event)))
            .await;
        !report.suppressed && !report.results.is_empty()
    }

    // ─── Membership ──────────────────────────────────────────────────────────

    pub async fn membership(&self, bot: &Bot, change: SyncMembership) -> FanOut {
        let span = info_span!("sync_membership", source = %change.identifier, conv_id = %change.conv_id);
        async {
            let primary = bot.platform();
            let fresh = change.previous_targets.is_none();
            let previous_targets = change.previous_targets.clone().unwrap_or_default();
            previous_targets.insert(change.identifier.clone());
            let notified_users = TargetSet::new();
            let context = EventContext::new();
            let caller = platform_of(&change.identifier, &primary).to_string();
            let targets = self
                .get_synced_conversations(bot, &change.conv_id, Some(&caller))
                .await;
            for target in &targets {
                self.invalidate_users(target);
            }

            let mut fan_out = FanOut::default();
            let mut first_event = None;
            for target in targets {
                let tag = target_tag(&target, &primary);
                let is_source = fresh && target == change.conv_id;
                if !previous_targets.insert(tag) && !is_source {
                    fan_out.skipped.push(target);
                    continue;
                }
                let event = Arc::new(SyncEventMembership {
                    identifier: change.identifier.clone(),
                    conv_id: target.clone(),
                    source_conv: change.conv_id.clone(),
                    user: change.user.clone(),
                    change: change.change,
                    participants: change.participants.clone(),
                    title: change.title.clone(),
                    previous_targets: previous_targets.clone(),
                    notified_users: notified_users.clone(),
                    context: Arc::clone(&context),
                });
                let report = bot
                    .hub()
                    .membership
                    .run(Call::new(bot.clone(), Arc::clone(&event)))
                    .await;
                if report.suppressed {
                    fan_out.suppressed.push(target);
                    continue;
                }
                fan_out.delivered.push(target);
                first_event.get_or_insert(event);
            }
            if let Some(event) = first_event {
                bot.hub().membership_once.run(Call::new(bot.clone(), event)).await;
            }
            fan_out
        }
        .instrument(span)
        .await
    }

    // ─── Users ───────────────────────────────────────────────────────────────

    /// Users present in `conv_id` and every conversation synced with it.
    pub async fn get_users_in_conversation(&self, bot: &Bot, conv_id: &str) -> Vec<SyncUser> {
        if let Some(users) = self.users.get(conv_id) {
            return users;
        }
        let primary = bot.platform();
        let mut seen = BTreeSet::new();
        let mut users = Vec::new();
        for target in self.get_synced_conversations(bot, conv_id, None).await {
            let found = if is_primary_conv(&target) {
                let tag = target_tag(&target, &primary);
                bot.conversations()
                    .participants(&target)
                    .into_iter()
                    .map(|id| {
                        let user = bot.users().get_user(&id).unwrap_or_else(|| User::new(id, ""));
                        SyncUser::new(tag.clone(), user)
                    })
                    .collect()
            } else {
                let query = SyncConvQuery {
                    conv_id: target.clone(),
                    caller: None,
                };
                bot.hub()
                    .sync_conv_user
                    .run(Call::new(bot.clone(), Arc::new(query)))
                    .await
                    .results
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
            };
            for user in found {
                if seen.insert((user.identifier.clone(), user.id().to_string(), user.user.full_name.clone())) {
                    users.push(user);
                }
            }
        }
        self.users.add(conv_id, users.clone());
        users
    }

    pub fn invalidate_users(&self, conv_id: &str) {
        self.users.pop(conv_id);
    }

    // ─── Kick ────────────────────────────────────────────────────────────────

    /// Kicks `user` from `conv_id` and every conversation synced with it.
    pub async fn kick(&self, bot: &Bot, user: &SyncUser, conv_id: &str) -> KickOutcome {
        Self::merge_outcomes(self.kick_each(bot, user, conv_id).await.into_values())
    }

    /// Per-conversation kick results.
    pub async fn kick_each(&self, bot: &Bot, user: &SyncUser, conv_id: &str) -> BTreeMap<String, KickOutcome> {
        let targets = self.get_synced_conversations(bot, conv_id, None).await;
        if user.id() == bot.self_user().id || bot.is_admin(user.id()) {
            return targets
                .into_iter()
                .map(|t| (t, KickOutcome::Whitelisted))
                .collect();
        }
        let runs = targets.iter().map(|target| {
            let request = KickRequest {
                conv_id: target.clone(),
                user: user.clone(),
            };
            bot.hub()
                .sync_user_kick
                .run(Call::new(bot.clone(), Arc::new(request)))
        });
        let reports = join_all(runs).await;
        let outcomes: BTreeMap<String, KickOutcome> = targets
            .into_iter()
            .zip(reports)
            .map(|(target, report)| (target, Self::merge_outcomes(report.results)))
            .collect();
        for (target, outcome) in &outcomes {
            if *outcome == KickOutcome::Failed {
                warn!(conv_id = %target, user = %user.display_name(false), "Kick failed");
            }
        }
        outcomes
    }

    fn merge_outcomes(outcomes: impl IntoIterator<Item = KickOutcome>) -> KickOutcome {
        outcomes
            .into_iter()
            .fold(KickOutcome::NotResponsible, KickOutcome::merge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_outcomes_merge_by_precedence() {
        use KickOutcome::*;
        assert_eq!(NotResponsible.merge(Failed), Failed);
        assert_eq!(Failed.merge(Kicked), Kicked);
        assert_eq!(Kicked.merge(Whitelisted), Whitelisted);
        assert_eq!(SyncRouter::merge_outcomes([]), NotResponsible);
        assert_eq!(SyncRouter::merge_outcomes([Kicked, Failed, NotResponsible]), Kicked);
    }

    #[test]
    fn message_builder() {
        let msg = SyncMessage::new("telegram:1", "telegram:1", SyncUser::remote("telegram:1", "Bob", None), "hi")
            .with_title("ops")
            .edited();
        assert!(msg.edited);
        assert!(msg.previous_targets.is_none());
        assert_eq!(msg.title.as_deref(), Some("ops"));
    }
}
