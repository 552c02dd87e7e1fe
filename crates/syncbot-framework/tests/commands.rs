mod common;

use std::time::Duration;

use serde_json::json;

use syncbot_core::client::InboundEvent;
use syncbot_core::format::plain_text;
use syncbot_core::user::User;
use syncbot_framework::prelude::*;
use syncbot_framework::TagType;

use common::{ANN, BOB, PRIMARY_CONV, chat, started};

async fn texts(bot: &Bot, client: &syncbot_framework::testing::MockClient) -> Vec<String> {
    common::drain(bot).await;
    client.take_sent().iter().map(|m| plain_text(&m.segments)).collect()
}

#[tokio::test]
async fn tags_grant_admin_commands_to_users() {
    let (bot, _client) = started(json!({})).await;
    bot.commands().register(
        Some("test"),
        CommandSpec::new("c1").admin().tagged(["t1"]).tagged(["t2", "t3"]),
        |_call: CommandCall| async { Ok(CommandReply::None) },
    );
    bot.users().store_user(&User::new(ANN, "Ann Lee")).unwrap();
    bot.users().store_user(&User::new(BOB, "Bob Roe")).unwrap();
    let tags = bot.tags();
    tags.add(TagType::User, ANN, "t2").unwrap();
    tags.add(TagType::User, ANN, "t3").unwrap();
    tags.add(TagType::User, BOB, "t2").unwrap();

    let ann = bot.commands().get_available_commands(&bot, ANN, PRIMARY_CONV);
    assert!(ann.user.contains("c1"));
    assert!(!ann.admin.contains("c1"));

    // Half a tagset grants nothing.
    let bob = bot.commands().get_available_commands(&bot, BOB, PRIMARY_CONV);
    assert!(!bob.contains("c1"));
}

#[tokio::test]
async fn deny_tags_remove_user_commands() {
    let (bot, _client) = started(json!({})).await;
    bot.commands().register(
        Some("test"),
        CommandSpec::new("c2").tagged(["t4"]),
        |_call: CommandCall| async { Ok(CommandReply::None) },
    );
    bot.users().store_user(&User::new(BOB, "Bob Roe")).unwrap();
    bot.tags().add(TagType::User, BOB, "!t4").unwrap();

    let ann = bot.commands().get_available_commands(&bot, ANN, PRIMARY_CONV);
    assert!(ann.user.contains("c2"));
    let bob = bot.commands().get_available_commands(&bot, BOB, PRIMARY_CONV);
    assert!(!bob.contains("c2"));
}

#[tokio::test]
async fn escalated_tagged_commands_are_admin_only() {
    const CAROL: &str = "333333333333333333333";
    let (bot, _client) = started(json!({
        "admins": [ANN, CAROL],
        "commands_tags_escalate": true,
    }))
    .await;
    bot.commands().register(
        Some("test"),
        CommandSpec::new("c1").tagged(["t1"]),
        |_call: CommandCall| async { Ok(CommandReply::None) },
    );
    bot.users().store_user(&User::new(ANN, "Ann Lee")).unwrap();
    bot.users().store_user(&User::new(BOB, "Bob Roe")).unwrap();
    bot.tags().add(TagType::User, ANN, "t1").unwrap();
    bot.tags().add(TagType::User, BOB, "t1").unwrap();

    let ann = bot.commands().get_available_commands(&bot, ANN, PRIMARY_CONV);
    assert!(ann.admin.contains("c1"));
    assert!(!ann.user.contains("c1"));

    let carol = bot.commands().get_available_commands(&bot, CAROL, PRIMARY_CONV);
    assert!(carol.admin.contains("c1"));

    let bob = bot.commands().get_available_commands(&bot, BOB, PRIMARY_CONV);
    assert!(!bob.contains("c1"));
}

#[tokio::test]
async fn admin_commands_need_an_admin() {
    let (bot, client) = started(json!({"admins": [ANN]})).await;

    let bob = bot.commands().get_available_commands(&bot, BOB, PRIMARY_CONV);
    assert!(!bob.contains("tagset"));
    let ann = bot.commands().get_available_commands(&bot, ANN, PRIMARY_CONV);
    assert!(ann.admin.contains("tagset"));

    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, BOB, "Bob Roe", "/bot tagset user * ops")))
        .await;
    assert_eq!(texts(&bot, &client).await, vec!["Bob Roe: Can't do that."]);

    let line = format!("/bot tagset user {BOB} ops");
    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", &line)))
        .await;
    assert_eq!(texts(&bot, &client).await, vec![format!("tagged {BOB} with ops")]);
    assert!(bot.tags().user_tags(BOB).contains("ops"));
}

#[tokio::test]
async fn prefix_without_command_asks_for_parameters() {
    let (bot, client) = started(json!({})).await;
    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", "/bot")))
        .await;
    assert_eq!(texts(&bot, &client).await, vec!["Ann Lee: Missing parameter(s)"]);
}

#[tokio::test]
async fn unknown_commands_respect_silent_mode() {
    let (bot, client) = started(json!({"conversations": {"abc": {"silentmode": true}}})).await;
    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", "/bot nope")))
        .await;
    assert!(texts(&bot, &client).await.is_empty());
}

#[tokio::test]
async fn help_errors_render_the_help_entry() {
    let (bot, client) = started(json!({})).await;
    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", "/bot syncprofile")))
        .await;
    let sent = texts(&bot, &client).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("syncprofile\n<token>"), "{sent:?}");
}

#[tokio::test(start_paused = true)]
async fn slow_commands_time_out() {
    let (bot, client) = started(json!({"command_timeout": 1})).await;
    bot.commands().register(Some("test"), CommandSpec::new("slow"), |_call: CommandCall| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(CommandReply::from("too late"))
    });
    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", "/bot slow")))
        .await;
    assert_eq!(texts(&bot, &client).await, vec!["command execution timed out"]);
}

#[tokio::test]
async fn commands_can_reply_elsewhere() {
    let (bot, client) = started(json!({})).await;
    bot.commands().register(Some("test"), CommandSpec::new("tell"), |call: CommandCall| async move {
        Ok(CommandReply::To {
            conv_id: call.args.first().cloned().unwrap_or_default(),
            body: "psst".into(),
            context: None,
        })
    });
    bot.handle_inbound(InboundEvent::Message(chat(PRIMARY_CONV, ANN, "Ann Lee", "/bot tell xyz")))
        .await;
    common::drain(&bot).await;
    let sent = client.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].conv_id, "xyz");
}
