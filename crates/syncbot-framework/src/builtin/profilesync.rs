//! `syncprofile` and `unsyncprofile`.

use syncbot_core::conversation::is_primary_conv;

use crate::commands::{CommandCall, CommandReply, CommandSpec};
use crate::error::{ArgumentError, BoxError, Help};
use crate::plugin::PluginContext;

pub static PROFILESYNC: crate::plugin::PluginDescriptor = crate::define_plugin! {
    name: "profilesync",
    desc: "Binds remote platform identities to primary users",
    init: init,
};

async fn init(ctx: PluginContext) -> Result<(), BoxError> {
    ctx.register_command(
        CommandSpec::new("syncprofile").help(
            "<token> [split]\n  completes a profile sync started on another platform; \
             `split` keeps your one-to-one chats separate",
        ),
        syncprofile,
    );
    ctx.register_command(
        CommandSpec::new("unsyncprofile").help("<platform>\n  removes the profile sync with a platform"),
        unsyncprofile,
    );
    Ok(())
}

async fn syncprofile(call: CommandCall) -> Result<CommandReply, BoxError> {
    let Some(token) = call.args.first() else {
        return Err(Help::new().into());
    };
    if !is_primary_conv(call.conv_id()) {
        return Err(ArgumentError::new("send this command on the primary platform").into());
    }
    let split = call
        .args
        .get(1)
        .is_some_and(|a| a.eq_ignore_ascii_case("split"));
    let profilesync = call.bot.profilesync();
    let event = profilesync
        .complete_with_token(&call.bot, token, call.user_id(), split)
        .await
        .map_err(|e| ArgumentError::new(e.to_string()))?;
    let label = profilesync
        .platform(&event.platform)
        .map_or_else(|| event.platform.clone(), |p| p.label);
    let mut text = format!("Your {label} profile is now synced.");
    if split {
        text.push_str(" One-to-one chats stay separate.");
    }
    Ok(text.into())
}

async fn unsyncprofile(call: CommandCall) -> Result<CommandReply, BoxError> {
    let Some(platform) = call.args.first() else {
        return Err(Help::new().into());
    };
    let platform = platform.to_lowercase();
    call.bot
        .profilesync()
        .unsync(&platform, call.user_id())
        .map_err(|e| ArgumentError::new(e.to_string()))?;
    Ok(format!("Profile sync with {platform} removed.").into())
}
