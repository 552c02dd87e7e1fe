//! Tag administration commands.

use std::collections::BTreeSet;

use crate::commands::{CommandCall, CommandReply, CommandSpec};
use crate::error::{ArgumentError, BoxError, Help, TagError};
use crate::plugin::PluginContext;
use crate::tags::TagType;

pub static TAGS: crate::plugin::PluginDescriptor = crate::define_plugin! {
    name: "tags",
    desc: "Admin commands to edit user and conversation tags",
    init: init,
};

async fn init(ctx: PluginContext) -> Result<(), BoxError> {
    ctx.register_command(
        CommandSpec::new("tagset")
            .admin()
            .help("<conv|user|convuser> <id> <tag>\n  adds a tag"),
        tagset,
    );
    ctx.register_command(
        CommandSpec::new("tagdel")
            .admin()
            .help("<conv|user|convuser> <id> <tag>\n  removes a tag"),
        tagdel,
    );
    ctx.register_command(
        CommandSpec::new("tagspurge")
            .admin()
            .help("<conv|user|convuser|tag> <id|ALL>\n  removes every tag of an id, or a tag everywhere"),
        tagspurge,
    );
    ctx.register_command(
        CommandSpec::new("tagsuser")
            .admin()
            .help("<user> [conv]\n  shows the tags of a user"),
        tagsuser,
    );
    ctx.register_command(
        CommandSpec::new("tagsconv")
            .admin()
            .help("[conv]\n  shows the tags of a conversation"),
        tagsconv,
    );
    Ok(())
}

fn argument(e: TagError) -> BoxError {
    Box::new(ArgumentError::new(e.to_string()))
}

/// `<type> <id> <tag>`
fn target(call: &CommandCall) -> Result<(TagType, &str, &str), BoxError> {
    let [kind, id, tag] = call.args.as_slice() else {
        return Err(Help::new().into());
    };
    Ok((TagType::parse(kind).map_err(argument)?, id.as_str(), tag.as_str()))
}

async fn tagset(call: CommandCall) -> Result<CommandReply, BoxError> {
    let (kind, id, tag) = target(&call)?;
    let added = call.bot.tags().add(kind, id, tag).map_err(argument)?;
    Ok(if added {
        format!("tagged **{id}** with **{tag}**")
    } else {
        format!("**{id}** already has **{tag}**")
    }
    .into())
}

async fn tagdel(call: CommandCall) -> Result<CommandReply, BoxError> {
    let (kind, id, tag) = target(&call)?;
    let removed = call.bot.tags().remove(kind, id, tag).map_err(argument)?;
    Ok(if removed {
        format!("removed **{tag}** from **{id}**")
    } else {
        format!("**{id}** does not have **{tag}**")
    }
    .into())
}

async fn tagspurge(call: CommandCall) -> Result<CommandReply, BoxError> {
    let [kind, id] = call.args.as_slice() else {
        return Err(Help::new().into());
    };
    let tags = call.bot.tags();
    let removed = if kind.eq_ignore_ascii_case("tag") {
        tags.purge_tag(id).map_err(argument)?
    } else {
        tags.purge(TagType::parse(kind).map_err(argument)?, id)
            .map_err(argument)?
    };
    Ok(format!("{removed} tag(s) removed").into())
}

async fn tagsuser(call: CommandCall) -> Result<CommandReply, BoxError> {
    let Some(user_id) = call.args.first() else {
        return Err(Help::new().into());
    };
    let conv_id = call.args.get(1).map(String::as_str);
    let tags = call.bot.tags();
    let mut text = format!(
        "**{user_id}**\ndirect: {}\nactive: {}",
        list(&tags.user_tags(user_id)),
        list(&tags.user_active(user_id, conv_id)),
    );
    if let Some(conv_id) = conv_id {
        text.push_str(&format!(
            "\nin {conv_id}: {}",
            list(&tags.user_tags(&crate::tags::convuser_key(conv_id, user_id)))
        ));
    }
    Ok(text.into())
}

async fn tagsconv(call: CommandCall) -> Result<CommandReply, BoxError> {
    let conv_id = call
        .args
        .first()
        .map_or_else(|| call.conv_id().to_string(), Clone::clone);
    let tags = call.bot.tags();
    Ok(format!(
        "**{conv_id}**\ndirect: {}\nactive: {}",
        list(&tags.conv_tags(&conv_id)),
        list(&tags.conv_active(&conv_id)),
    )
    .into())
}

fn list(tags: &BTreeSet<String>) -> String {
    if tags.is_empty() {
        return "-".to_string();
    }
    tags.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tag_lists_render_as_dash() {
        assert_eq!(list(&BTreeSet::new()), "-");
        assert_eq!(list(&BTreeSet::from(["b".to_string(), "a".to_string()])), "a, b");
    }
}
