mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use syncbot_core::client::InboundEvent;
use syncbot_core::format::plain_text;
use syncbot_framework::prelude::*;
use syncbot_framework::{ProfileSyncError, ProfileSyncEvent};

use common::{ANN, PRIMARY_CONV, chat, drain, started};

fn capture_profile_syncs(bot: &Bot) -> Arc<Mutex<Vec<ProfileSyncEvent>>> {
    let seen: Arc<Mutex<Vec<ProfileSyncEvent>>> = Arc::default();
    let recorded = Arc::clone(&seen);
    bot.hub()
        .sync_profile
        .register(Some("observer"), DEFAULT_PRIORITY, move |call: Call<ProfileSyncEvent>| {
            let recorded = Arc::clone(&recorded);
            async move {
                recorded.lock().push((*call.event).clone());
                Ok(Outcome::done())
            }
        });
    seen
}

#[tokio::test]
async fn completing_a_sync_pairs_the_one_to_ones() {
    let (bot, _client) = started(json!({})).await;
    let profilesync = bot.profilesync();
    profilesync.register("tg", "Telegram", None);
    let seen = capture_profile_syncs(&bot);

    let token = profilesync.start("tg", "R42").unwrap();
    assert_eq!(token.len(), 7);

    let event = profilesync.complete(&bot, "tg", ANN, "R42", false).await.unwrap();
    let dm = format!("dm-{ANN}");
    assert_eq!(event.conv_1on1.as_deref(), Some(dm.as_str()));
    assert!(profilesync.sync_pairs().contains(&(dm.clone(), "tg:R42".to_string())));
    assert_eq!(seen.lock().as_slice(), &[event]);

    // The pair makes both private chats peers of each other.
    assert_eq!(syncbot_framework::builtin::peers_of(&bot, &dm), vec!["tg:R42"]);

    assert!(matches!(
        profilesync.complete(&bot, "tg", ANN, "R42", false).await,
        Err(ProfileSyncError::AlreadyCompleted { .. })
    ));
}

#[tokio::test]
async fn split_syncs_keep_private_chats_apart() {
    let (bot, _client) = started(json!({})).await;
    let profilesync = bot.profilesync();
    profilesync.register("tg", "Telegram", None);
    profilesync.start("tg", "R7").unwrap();

    let event = profilesync.complete(&bot, "tg", ANN, "R7", true).await.unwrap();
    assert!(event.split_1on1s);
    assert!(profilesync.sync_pairs().is_empty());
    assert_eq!(profilesync.canonical_for("tg", "R7").as_deref(), Some(ANN));
}

#[tokio::test]
async fn syncprofile_command_completes_with_the_token() {
    let (bot, client) = started(json!({})).await;
    bot.profilesync().register("tg", "Telegram", None);
    let token = bot.profilesync().start("tg", "R42").unwrap();

    let line = format!("/bot syncprofile {}", token.to_lowercase());
    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", &line)))
        .await;
    drain(&bot).await;
    let texts: Vec<String> = client.take_sent().iter().map(|m| plain_text(&m.segments)).collect();
    assert_eq!(texts, vec!["Your Telegram profile is now synced."]);
    assert_eq!(bot.profilesync().remote_for("tg", ANN).as_deref(), Some("R42"));

    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", "/bot unsyncprofile TG")))
        .await;
    drain(&bot).await;
    let texts: Vec<String> = client.take_sent().iter().map(|m| plain_text(&m.segments)).collect();
    assert_eq!(texts, vec!["Profile sync with tg removed."]);
    assert_eq!(bot.profilesync().remote_for("tg", ANN), None);
    assert!(bot.profilesync().sync_pairs().is_empty());
}

#[tokio::test]
async fn unknown_tokens_are_reported_to_the_user() {
    let (bot, client) = started(json!({})).await;
    bot.profilesync().register("tg", "Telegram", None);

    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", "/bot syncprofile NOPE123")))
        .await;
    drain(&bot).await;
    let texts: Vec<String> = client.take_sent().iter().map(|m| plain_text(&m.segments)).collect();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("NOPE123"), "{texts:?}");
}

#[tokio::test]
async fn completing_without_a_pending_sync_is_refused() {
    let (bot, _client) = started(json!({})).await;
    let profilesync = bot.profilesync();
    profilesync.register("tg", "Telegram", None);
    let seen = capture_profile_syncs(&bot);

    assert!(matches!(
        profilesync.complete(&bot, "tg", ANN, "R13", false).await,
        Err(ProfileSyncError::NotPending { .. })
    ));
    assert_eq!(profilesync.remote_for("tg", ANN), None);
    assert!(profilesync.sync_pairs().is_empty());
    assert!(seen.lock().is_empty());
}
