//! Command trigger and `help`.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use syncbot_core::event::ChatEvent;

use crate::commands::{CommandCall, CommandReply, CommandSpec};
use crate::error::BoxError;
use crate::pluggable::{Call, DEFAULT_PRIORITY, Outcome};
use crate::plugin::PluginContext;

pub static COMMANDS: crate::plugin::PluginDescriptor = crate::define_plugin! {
    name: "commands",
    desc: "Runs commands sent on the primary platform",
    init: init,
};

async fn init(ctx: PluginContext) -> Result<(), BoxError> {
    ctx.hub()
        .primary_message
        .register(Some(ctx.name()), DEFAULT_PRIORITY, |call: Call<ChatEvent>| async move {
            // Relayed events are routed by the sync router itself.
            if call.event.syncroom_no_repeat {
                return Ok(Outcome::SkipHandler);
            }
            call.bot.commands().handle_message(&call.bot, call.event).await;
            Ok(Outcome::done())
        });

    ctx.register_command(
        CommandSpec::new("help").help("[command]\n  lists the commands you can run here, or the help of one command"),
        help,
    );
    Ok(())
}

async fn help(call: CommandCall) -> Result<CommandReply, BoxError> {
    let commands = call.bot.commands();
    let available = commands.get_available_commands(&call.bot, call.user_id(), call.conv_id());

    if let Some(name) = call.args.first() {
        let name = name.to_lowercase();
        if !available.contains(&name) {
            return Ok(format!("{name}: command not available").into());
        }
        let text = commands
            .help_text(&call.bot, &name)
            .unwrap_or_else(|| "no help available".to_string());
        return Ok(format!("**{name}**\n{text}").into());
    }

    let mut text = String::new();
    section(&mut text, "User commands", &available.user);
    if !available.admin.is_empty() {
        text.push('\n');
        section(&mut text, "Admin commands", &available.admin);
    }
    Ok(text.trim_end().to_string().into())
}

fn section(out: &mut String, title: &str, commands: &BTreeSet<String>) {
    let _ = writeln!(out, "**{title}:**");
    if commands.is_empty() {
        out.push_str("none\n");
    } else {
        let names: Vec<&str> = commands.iter().map(String::as_str).collect();
        let _ = writeln!(out, "{}", names.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_list_sorted_names() {
        let mut out = String::new();
        section(&mut out, "User commands", &BTreeSet::from(["tagsconv".to_string(), "help".to_string()]));
        section(&mut out, "Admin commands", &BTreeSet::new());
        assert_eq!(out, "**User commands:**\nhelp, tagsconv\n**Admin commands:**\nnone\n");
    }
}
