mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use syncbot_core::event::{SyncEvent, TargetSet};
use syncbot_core::format::plain_text;
use syncbot_core::user::{SyncUser, User};
use syncbot_framework::prelude::*;
use syncbot_framework::testing::MockClient;
use syncbot_framework::{SyncConvQuery, SyncMessage};

use common::{ANN, PRIMARY_CONV, drain, started};

/// `{A: [B], B: [A, C], C: [B]}` on the `tg` platform.
fn chain_topology(bot: &Bot) {
    bot.hub()
        .sync_conv
        .register(Some("topology"), DEFAULT_PRIORITY, |call: Call<SyncConvQuery>| async move {
            let peers = match call.event.conv_id.as_str() {
                "tg:A" => vec!["tg:B"],
                "tg:B" => vec!["tg:A", "tg:C"],
                "tg:C" => vec!["tg:B"],
                _ => return Ok(Outcome::SkipHandler),
            };
            Ok(Outcome::Continue(peers.into_iter().map(String::from).collect()))
        });
}

type Sends = Arc<Mutex<Vec<(String, TargetSet)>>>;

fn record_sends(bot: &Bot) -> Sends {
    let sends: Sends = Arc::default();
    let recorded = Arc::clone(&sends);
    bot.hub()
        .sending
        .register(Some("recorder"), DEFAULT_PRIORITY, move |call: Call<SyncEvent>| {
            let recorded = Arc::clone(&recorded);
            async move {
                if call.event.conv_id.starts_with("tg:") {
                    recorded
                        .lock()
                        .push((call.event.conv_id.clone(), call.event.previous_targets.clone()));
                }
                Ok(Outcome::done())
            }
        });
    sends
}

fn bob_on(identifier: &str) -> SyncUser {
    SyncUser::remote(identifier, "Bob", None)
}

#[tokio::test]
async fn broadcast_reaches_every_linked_conversation_once() {
    let client = Arc::new(MockClient::new("hangouts"));
    let bot = common::bot(client, json!({}));
    chain_topology(&bot);
    let sends = record_sends(&bot);

    let fan_out = bot
        .sync()
        .message(&bot, SyncMessage::new("tg:A", "tg:A", bob_on("tg:A"), "hi"))
        .await;

    assert_eq!(fan_out.delivered, vec!["tg:A", "tg:B", "tg:C"]);
    let sends = sends.lock();
    let targets: Vec<&str> = sends.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(targets, vec!["tg:A", "tg:B", "tg:C"]);

    let (_, previous) = sends.last().expect("at least one send");
    assert_eq!(
        previous.snapshot(),
        BTreeSet::from(["tg:A".to_string(), "tg:B".to_string(), "tg:C".to_string()])
    );
}

#[tokio::test]
async fn relays_do_not_loop_back() {
    let client = Arc::new(MockClient::new("hangouts"));
    let bot = common::bot(client, json!({}));
    chain_topology(&bot);
    let sends = record_sends(&bot);

    let echo = SyncMessage::new("tg:B", "tg:B", bob_on("tg:B"), "hi")
        .with_previous_targets(TargetSet::with(["tg:A", "tg:B"]));
    let fan_out = bot.sync().message(&bot, echo).await;

    assert_eq!(fan_out.delivered, vec!["tg:C"]);
    assert_eq!(fan_out.skipped, vec!["tg:B", "tg:A"]);
    assert_eq!(sends.lock().len(), 1);
}

#[tokio::test]
async fn suppressed_destinations_are_reported() {
    let client = Arc::new(MockClient::new("hangouts"));
    let bot = common::bot(client, json!({}));
    chain_topology(&bot);
    bot.hub()
        .sending
        .register(Some("filter"), 10, |call: Call<SyncEvent>| async move {
            if call.event.conv_id == "tg:B" {
                return Ok(Outcome::SuppressEvent);
            }
            Ok(Outcome::done())
        });

    let fan_out = bot
        .sync()
        .message(&bot, SyncMessage::new("tg:A", "tg:A", bob_on("tg:A"), "hi"))
        .await;
    assert_eq!(fan_out.suppressed, vec!["tg:B"]);
    assert_eq!(fan_out.delivered, vec!["tg:A", "tg:C"]);
}

#[tokio::test]
async fn remote_messages_are_posted_into_synced_primary_conversations() {
    let (bot, client) = started(json!({"sync_rooms": [[PRIMARY_CONV, "tg:1"]]})).await;

    let first = SyncMessage::new("tg:1", "tg:1", bob_on("tg:1"), "first");
    let second = SyncMessage::new("tg:1", "tg:1", bob_on("tg:1"), "second");
    bot.sync().message(&bot, first).await;
    bot.sync().message(&bot, second).await;
    drain(&bot).await;

    let sent = client.sent();
    let texts: Vec<String> = sent.iter().map(|m| plain_text(&m.segments)).collect();
    assert_eq!(texts, vec!["Bob: first", "Bob: second"]);
    assert!(sent.iter().all(|m| m.conv_id == PRIMARY_CONV));
    // The echo of a relayed post carries the no-repeat context.
    assert!(sent.iter().all(|m| !m.annotations.is_empty()));
}

#[tokio::test]
async fn remote_users_with_canonical_ids_can_run_commands() {
    let (bot, client) = started(json!({"sync_rooms": [[PRIMARY_CONV, "tg:1"]]})).await;

    let ann = SyncUser::new("tg:1", User::new(ANN, "Ann Lee"));
    bot.sync()
        .message(&bot, SyncMessage::new("tg:1", "tg:1", ann, "/bot help"))
        .await;
    drain(&bot).await;

    let texts: Vec<String> = client.sent().iter().map(|m| plain_text(&m.segments)).collect();
    assert!(texts.iter().any(|t| t.starts_with("User commands:")), "{texts:?}");
}

#[tokio::test]
async fn kicks_are_delegated_to_the_client() {
    let (bot, client) = started(json!({"sync_rooms": [[PRIMARY_CONV, "tg:1"]]})).await;
    let bob = SyncUser::new("hangouts", User::new(common::BOB, "Bob Roe"));

    assert_eq!(bot.sync().kick(&bot, &bob, "tg:1").await, KickOutcome::Kicked);
    assert_eq!(client.kicks(), vec![(PRIMARY_CONV.to_string(), common::BOB.to_string())]);

    let me = SyncUser::new("hangouts", bot.self_user());
    assert_eq!(bot.sync().kick(&bot, &me, PRIMARY_CONV).await, KickOutcome::Whitelisted);

    client.fail_kicks(true);
    assert_eq!(bot.sync().kick(&bot, &bob, PRIMARY_CONV).await, KickOutcome::Failed);
}
