//! Room syncing.
//!
//! Links conversations listed together in `sync_rooms`, relays messages
//! from the primary platform into the router, and posts relayed messages
//! into primary conversations through the per-conversation queues.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, warn};

use syncbot_core::conversation::{is_primary_conv, platform_of};
use syncbot_core::event::{ChatEvent, SyncEvent};

use crate::bot::Bot;
use crate::error::BoxError;
use crate::pluggable::{Call, DEFAULT_PRIORITY, Outcome, TAIL_PRIORITY};
use crate::plugin::PluginContext;
use crate::sync::{KickOutcome, KickRequest, QueuedMessage, SyncConvQuery, SyncMessage};

pub static SYNCROOMS: crate::plugin::PluginDescriptor = crate::define_plugin! {
    name: "syncrooms",
    desc: "Links the conversations listed in sync_rooms",
    init: init,
};

async fn init(ctx: PluginContext) -> Result<(), BoxError> {
    let plugin = Some(ctx.name());
    let hub = ctx.hub();

    hub.sync_conv
        .register(plugin, DEFAULT_PRIORITY, |call: Call<SyncConvQuery>| async move {
            let peers = peers_of(&call.bot, &call.event.conv_id);
            if peers.is_empty() {
                return Ok(Outcome::SkipHandler);
            }
            Ok(Outcome::Continue(peers))
        });

    hub.primary_allmessages
        .register(plugin, DEFAULT_PRIORITY, |call: Call<ChatEvent>| async move {
            relay_primary(&call.bot, &call.event).await;
            Ok(Outcome::done())
        });

    hub.sending
        .register(plugin, TAIL_PRIORITY, |call: Call<SyncEvent>| async move {
            Ok(send_primary(&call.bot, &call.event))
        });

    hub.sync_user_kick
        .register(plugin, DEFAULT_PRIORITY, |call: Call<KickRequest>| async move {
            Ok(Outcome::Continue(kick_primary(&call.bot, &call.event).await))
        });
    Ok(())
}

/// Conversations linked to `conv_id` by `sync_rooms` or a one-to-one pair.
pub fn peers_of(bot: &Bot, conv_id: &str) -> Vec<String> {
    let rooms = bot
        .config()
        .get_option_as::<Vec<Vec<String>>>("sync_rooms")
        .unwrap_or_default();
    let mut peers = BTreeSet::new();
    for room in rooms.iter().filter(|r| r.iter().any(|c| c == conv_id)) {
        peers.extend(room.iter().filter(|c| *c != conv_id).cloned());
    }
    for (a, b) in bot.profilesync().sync_pairs() {
        if a == conv_id {
            peers.insert(b);
        } else if b == conv_id {
            peers.insert(a);
        }
    }
    peers.into_iter().collect()
}

async fn relay_primary(bot: &Bot, event: &ChatEvent) {
    if event.syncroom_no_repeat {
        return;
    }
    let mut message = SyncMessage::from_chat(event, bot.platform());
    if let Some(conv) = bot.conversations().get_conv(&event.conv_id)
        && !conv.title.is_empty()
    {
        message = message.with_title(conv.title);
    }
    bot.sync().message(bot, message).await;
}

fn send_primary(bot: &Bot, event: &SyncEvent) -> Outcome {
    if event.conv_id == event.source_conv || !is_primary_conv(&event.conv_id) {
        return Outcome::SkipHandler;
    }
    let with_nickname = bot
        .config()
        .get_conv_option(&event.conv_id, "sync_nicknames")
        .is_some_and(|v| v == Value::Bool(true));
    debug!(conv_id = %event.conv_id, source = %event.identifier, "Queueing relayed message");
    bot.primary_queue()
        .schedule(QueuedMessage::from_event(event, with_nickname));
    Outcome::done()
}

async fn kick_primary(bot: &Bot, request: &KickRequest) -> KickOutcome {
    let primary = bot.platform();
    if !is_primary_conv(&request.conv_id) || platform_of(&request.user.identifier, primary) != primary {
        return KickOutcome::NotResponsible;
    }
    if !bot.conversations().participants(&request.conv_id).contains(request.user.id()) {
        return KickOutcome::NotResponsible;
    }
    match bot.client().kick(&request.conv_id, request.user.id()).await {
        Ok(()) => KickOutcome::Kicked,
        Err(e) => {
            warn!(conv_id = %request.conv_id, error = %e, "Kick through the client failed");
            KickOutcome::Failed
        }
    }
}
