#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use syncbot_core::conversation::{ConvType, Conversation};
use syncbot_core::event::ChatEvent;
use syncbot_core::format::Segment;
use syncbot_core::store::JsonStore;
use syncbot_core::user::User;
use syncbot_framework::testing::MockClient;
use syncbot_framework::{Bot, BotOptions};

pub const ANN: &str = "111111111111111111111";
pub const BOB: &str = "222222222222222222222";
pub const PRIMARY_CONV: &str = "abc";

/// A `hangouts` client that knows one group with Ann and Bob.
pub fn client() -> MockClient {
    MockClient::new("hangouts")
        .with_user(User::new(ANN, "Ann Lee").definitive())
        .with_user(User::new(BOB, "Bob Roe").definitive())
        .with_conversation(
            Conversation::new(PRIMARY_CONV, "Ops", ConvType::Group).with_participants([ANN, BOB]),
        )
}

pub fn bot(client: Arc<MockClient>, config: Value) -> Bot {
    Bot::new(
        client,
        JsonStore::from_value("config", config),
        JsonStore::in_memory("memory"),
        BotOptions::default(),
    )
}

/// A started bot with the built-in plugins loaded.
pub async fn started(config: Value) -> (Bot, Arc<MockClient>) {
    let client = Arc::new(client());
    let bot = bot(Arc::clone(&client), config);
    syncbot_framework::register_builtins(&bot);
    bot.start().await.expect("bot starts");
    (bot, client)
}

pub fn chat(conv_id: &str, user_id: &str, name: &str, text: &str) -> ChatEvent {
    ChatEvent::new(conv_id, User::new(user_id, name), vec![Segment::text(text)])
}

pub async fn drain(bot: &Bot) {
    bot.queue_control()
        .wait_drained(None, Duration::from_secs(5))
        .await
        .expect("queues drain");
}
