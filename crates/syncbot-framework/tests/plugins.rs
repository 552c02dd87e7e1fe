mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_pending, assert_ready};
use tokio_util::sync::CancellationToken;

use syncbot_framework::prelude::*;
use syncbot_framework::{PluginError, PluginLoadState};

use common::{ANN, PRIMARY_CONV, started};

struct Greeter {
    greeting: String,
    unloaded: CancellationToken,
}

async fn greeter_init(ctx: PluginContext) -> Result<(), BoxError> {
    let greeting = ctx.config::<String>().unwrap_or_else(|| "hello".to_string());
    let unloaded = ctx.token();
    ctx.register_shared("greeter", Arc::new(Greeter { greeting, unloaded }))?;
    Ok(())
}

static GREETER: PluginDescriptor = define_plugin! {
    name: "greeter",
    provides: ["greeter"],
    desc: "Shares a greeting",
    init: greeter_init,
};

async fn greet(call: CommandCall) -> Result<CommandReply, BoxError> {
    let greeter = call
        .bot
        .get_shared::<Greeter>("greeter")
        .ok_or_else(|| ArgumentError::new("greeter is gone"))?;
    Ok(CommandReply::from(greeter.greeting.clone()))
}

async fn greet_init(ctx: PluginContext) -> Result<(), BoxError> {
    ctx.register_command(CommandSpec::new("greet").help("says the shared greeting"), greet);
    ctx.spawn(std::future::pending());
    Ok(())
}

static GREET: PluginDescriptor = define_plugin! {
    name: "greet",
    depends_on: ["greeter"],
    version: "0.2.0",
    init: greet_init,
};

async fn broken_init(_ctx: PluginContext) -> Result<(), BoxError> {
    Err("no credentials".into())
}

static BROKEN: PluginDescriptor = define_plugin! {
    name: "broken",
    init: broken_init,
};

#[tokio::test]
async fn builtins_register_their_handlers_and_commands() {
    let (bot, _client) = started(json!({})).await;
    for name in ["syncrooms", "commands", "profilesync", "tags"] {
        assert_eq!(bot.plugins().state(name), Some(PluginLoadState::Active), "{name}");
    }
    assert!(!bot.hub().sync_conv.is_empty());
    assert!(bot.commands().contains("help"));
    assert!(bot.commands().contains("syncprofile"));
    assert!(bot.commands().contains("tagset"));
}

#[tokio::test]
async fn unloading_removes_everything_a_plugin_owned() {
    let (bot, _client) = started(json!({})).await;

    assert!(bot.plugins().unload(&bot, "syncrooms", Duration::from_secs(1)).await);
    assert!(bot.hub().sync_conv.is_empty());
    assert!(bot.hub().sync_user_kick.is_empty());

    assert!(bot.plugins().unload(&bot, "commands", Duration::from_secs(1)).await);
    assert!(!bot.commands().contains("help"));
    assert!(bot.commands().contains("tagset"));

    assert!(!bot.plugins().unload(&bot, "commands", Duration::from_secs(1)).await);
    assert_eq!(bot.plugins().state("commands"), Some(PluginLoadState::Registered));
}

#[tokio::test]
async fn dependencies_load_first_and_unload_last() {
    let (bot, client) = started(json!({"greeter": "hi there"})).await;
    bot.register_plugin(GREET).unwrap();
    bot.register_plugin(GREETER).unwrap();
    assert_eq!(bot.plugins().load_all(&bot).await, 2);

    bot.handle_inbound(syncbot_core::client::InboundEvent::Message(common::chat(
        PRIMARY_CONV,
        ANN,
        "Ann Lee",
        "/bot greet",
    )))
    .await;
    common::drain(&bot).await;
    let texts: Vec<String> = client
        .take_sent()
        .iter()
        .map(|m| syncbot_core::format::plain_text(&m.segments))
        .collect();
    assert_eq!(texts, vec!["hi there"]);

    let greeter = bot.get_shared::<Greeter>("greeter").unwrap();
    let mut unloaded = tokio_test::task::spawn(greeter.unloaded.clone().cancelled_owned());
    assert_pending!(unloaded.poll());

    // The pending task is cancelled on unload.
    bot.plugins().unload_all(&bot, Duration::from_secs(1)).await;
    assert!(unloaded.is_woken());
    assert_ready!(unloaded.poll());
    assert!(!bot.shared().contains("greeter"));
    assert!(!bot.commands().contains("greet"));
}

#[tokio::test]
async fn missing_dependencies_and_failed_inits_mark_the_plugin_failed() {
    let (bot, _client) = started(json!({})).await;

    let err = bot.plugins().load(&bot, GREET).await.unwrap_err();
    assert!(matches!(err, PluginError::MissingDependency { ref dependency, .. } if dependency == "greeter"));
    assert_eq!(bot.plugins().state("greet"), Some(PluginLoadState::Failed));

    let err = bot.plugins().load(&bot, BROKEN).await.unwrap_err();
    assert!(matches!(err, PluginError::Init { .. }));
    assert_eq!(bot.plugins().state("broken"), Some(PluginLoadState::Failed));
}

#[test]
fn descriptors_carry_their_metadata() {
    assert_eq!(GREETER.provides, &["greeter"]);
    assert_eq!(GREET.depends_on, &["greeter"]);
    assert_eq!(GREET.metadata.version, "0.2.0");
    assert_eq!(GREETER.metadata.desc, "Shares a greeting");
    assert!(BROKEN.is_compatible());
}
