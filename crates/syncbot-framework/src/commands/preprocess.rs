//! Command argument preprocessing.
//!
//! Before a command runs, every non-verbatim argument is offered to the
//! active preprocessor groups. The first pattern that matches rewrites the
//! argument, e.g. `#here` becomes the current conversation id and `@me` the
//! caller's user id.
//!
//! A trigger word (default `resolve`) switches groups on and off for the
//! arguments that follow it:
//!
//! ```text
//! +resolve            all groups
//! -resolve            no groups
//! +resolve:a,b        add groups a and b
//! -resolve:a,b        remove groups a and b
//! +resolve:off        no groups (also false, 0)
//! +resolve:*          all groups
//! ```
//!
//! Trigger arguments are consumed. Quoted or backslash-escaped arguments are
//! never rewritten.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Captures, Regex, RegexBuilder};
use tracing::{debug, error};

use syncbot_core::user::is_canonical_id;

use crate::commands::split::ArgToken;
use crate::conversations::ConversationMemory;
use crate::error::ArgumentError;
use crate::users::UserStore;

pub const DEFAULT_TRIGGER: &str = "resolve";
pub const INBUILT_GROUP: &str = "inbuilt";

/// Matches `#here`, `#<conv id>` or `#<title>`.
const CONV_PATTERN: &str = r"^#([^|]+)$";
/// Matches `@user`, optionally scoped to a conversation: `#conv|@user`.
const USER_PATTERN: &str = r"^(?:#([^|]+)\|)?@(.+)$";

/// What a resolver may look at.
pub struct ResolveContext<'a> {
    pub conversations: &'a ConversationMemory,
    pub users: &'a UserStore,
    /// Conversation the command was issued in.
    pub conv_id: &'a str,
    /// The caller.
    pub user_id: &'a str,
}

pub type Resolver =
    Arc<dyn Fn(&ResolveContext<'_>, &Captures<'_>) -> Result<String, ArgumentError> + Send + Sync>;

struct Group {
    name: String,
    plugin: Option<String>,
    priority: i32,
    patterns: Vec<(Regex, Resolver)>,
}

pub struct ArgPreprocessor {
    trigger: RwLock<String>,
    groups: RwLock<Vec<Group>>,
}

impl Default for ArgPreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ArgPreprocessor {
    /// A preprocessor with the `inbuilt` group registered.
    pub fn new() -> Self {
        let preprocessor = Self {
            trigger: RwLock::new(DEFAULT_TRIGGER.to_string()),
            groups: RwLock::new(Vec::new()),
        };
        preprocessor.register_inbuilt();
        preprocessor
    }

    pub fn set_trigger(&self, trigger: &str) {
        *self.trigger.write() = trigger.to_lowercase();
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.read().iter().map(|g| g.name.clone()).collect()
    }

    /// Adds `pattern` (case-insensitive) to `group`, creating the group on
    /// first use. Lower priorities are tried first; `inbuilt` is always last.
    pub fn register(
        &self,
        group: &str,
        plugin: Option<&str>,
        priority: i32,
        pattern: &str,
        resolver: Resolver,
    ) -> Result<(), regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        let mut groups = self.groups.write();
        match groups.iter_mut().find(|g| g.name == group) {
            Some(existing) => existing.patterns.push((regex, resolver)),
            None => {
                groups.push(Group {
                    name: group.to_string(),
                    plugin: plugin.map(str::to_string),
                    priority,
                    patterns: vec![(regex, resolver)],
                });
                groups.sort_by_key(|g| (g.name == INBUILT_GROUP, g.priority));
            }
        }
        debug!(group = %group, pattern = %pattern, "Argument preprocessor registered");
        Ok(())
    }

    pub fn deregister_plugin(&self, plugin: &str) -> usize {
        let mut groups = self.groups.write();
        let before = groups.len();
        groups.retain(|g| g.plugin.as_deref() != Some(plugin));
        before - groups.len()
    }

    /// Rewrites `args`, consuming trigger arguments.
    pub fn process(
        &self,
        ctx: &ResolveContext<'_>,
        args: Vec<ArgToken>,
    ) -> Result<Vec<String>, ArgumentError> {
        let trigger = self.trigger.read().clone();
        let groups = self.groups.read();
        let all: BTreeSet<String> = groups.iter().map(|g| g.name.clone()).collect();
        let mut active = all.clone();
        let mut out = Vec::with_capacity(args.len());

        for arg in args {
            if arg.verbatim {
                out.push(arg.text);
                continue;
            }
            if let Some(switch) = parse_switch(&arg.text, &trigger) {
                active = switch.apply(active, &all);
                continue;
            }
            let rewritten = groups
                .iter()
                .filter(|g| active.contains(&g.name))
                .flat_map(|g| g.patterns.iter())
                .find_map(|(regex, resolver)| regex.captures(&arg.text).map(|caps| resolver(ctx, &caps)));
            match rewritten {
                Some(result) => out.push(result?),
                None => out.push(arg.text),
            }
        }
        Ok(out)
    }

    fn register_inbuilt(&self) {
        let conv: Resolver = Arc::new(|ctx: &ResolveContext<'_>, caps: &Captures<'_>| {
            resolve_conv(ctx, caps.get(1).map_or("", |m| m.as_str()))
        });
        let user: Resolver = Arc::new(|ctx: &ResolveContext<'_>, caps: &Captures<'_>| {
            let conv_id = match caps.get(1) {
                Some(m) => resolve_conv(ctx, m.as_str())?,
                None => ctx.conv_id.to_string(),
            };
            resolve_user(ctx, &conv_id, caps.get(2).map_or("", |m| m.as_str()))
        });
        for (pattern, resolver) in [(CONV_PATTERN, conv), (USER_PATTERN, user)] {
            if let Err(e) = self.register(INBUILT_GROUP, None, i32::MAX, pattern, resolver) {
                error!(error = %e, "Invalid inbuilt preprocessor pattern");
            }
        }
    }
}

// ─── Trigger switches ───────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Switch {
    All,
    None,
    Add(Vec<String>),
    Remove(Vec<String>),
}

impl Switch {
    fn apply(self, mut active: BTreeSet<String>, all: &BTreeSet<String>) -> BTreeSet<String> {
        match self {
            Self::All => all.clone(),
            Self::None => BTreeSet::new(),
            Self::Add(names) => {
                active.extend(names.into_iter().filter(|n| all.contains(n)));
                active
            }
            Self::Remove(names) => {
                // Removing from an empty set leaves it empty.
                for name in names {
                    active.remove(&name);
                }
                active
            }
        }
    }
}

fn parse_switch(arg: &str, trigger: &str) -> Option<Switch> {
    let lower = arg.to_lowercase();
    let (enable, rest) = if let Some(rest) = lower.strip_prefix('+') {
        (true, rest)
    } else if let Some(rest) = lower.strip_prefix('-') {
        (false, rest)
    } else {
        return None;
    };
    let rest = rest.strip_prefix(trigger)?;
    if rest.is_empty() {
        return Some(if enable { Switch::All } else { Switch::None });
    }
    let list = rest.strip_prefix(':')?;
    let names: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    if enable {
        Some(match list {
            "off" | "false" | "0" => Switch::None,
            "*" => Switch::All,
            _ => Switch::Add(names),
        })
    } else {
        Some(Switch::Remove(names))
    }
}

// ─── Inbuilt resolvers ──────────────────────────────────────────────────────

fn resolve_conv(ctx: &ResolveContext<'_>, term: &str) -> Result<String, ArgumentError> {
    let term = term.trim();
    if term.eq_ignore_ascii_case("here") {
        return Ok(ctx.conv_id.to_string());
    }
    if ctx.conversations.contains(term) {
        return Ok(term.to_string());
    }
    let wanted = term.to_lowercase();
    let matches: Vec<String> = ctx
        .conversations
        .all()
        .into_iter()
        .filter(|c| c.title.to_lowercase().contains(&wanted))
        .map(|c| c.id)
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(ArgumentError::new(format!("no conversation matches #{term}"))),
        _ => Err(ArgumentError::new(format!(
            "#{term} matches {} conversations",
            matches.len()
        ))),
    }
}

fn resolve_user(ctx: &ResolveContext<'_>, conv_id: &str, term: &str) -> Result<String, ArgumentError> {
    let term = term.trim();
    if term.eq_ignore_ascii_case("me") {
        return Ok(ctx.user_id.to_string());
    }
    if is_canonical_id(term) {
        return Ok(term.to_string());
    }
    if let Some(user_id) = ctx.users.find_by_nickname(term) {
        return Ok(user_id);
    }

    let wanted = term.to_lowercase();
    let name_matches = |ids: &mut dyn Iterator<Item = String>| -> Vec<String> {
        ids.filter(|id| {
            ctx.users
                .get_user(id)
                .is_some_and(|u| u.full_name.to_lowercase().contains(&wanted))
        })
        .collect()
    };
    let mut matches = name_matches(&mut ctx.conversations.participants(conv_id).into_iter());
    if matches.is_empty() {
        let mut everyone: BTreeSet<String> = ctx.users.known_ids().into_iter().collect();
        everyone.extend(ctx.conversations.all_user_ids());
        matches = name_matches(&mut everyone.into_iter());
    }
    match matches.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(ArgumentError::new(format!("no user matches @{term}"))),
        _ => Err(ArgumentError::new(format!("@{term} matches {} users", matches.len()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::split::shell_split;
    use syncbot_core::conversation::{ConvType, Conversation};
    use syncbot_core::store::JsonStore;
    use syncbot_core::user::User;

    const ALICE: &str = "111111111111111111111";
    const ALINA: &str = "222222222222222222222";
    const BOB: &str = "333333333333333333333";

    struct Fixture {
        convs: ConversationMemory,
        users: UserStore,
    }

    fn fixture() -> Fixture {
        let memory = JsonStore::in_memory("memory");
        let convs = ConversationMemory::new(memory.clone());
        let users = UserStore::new(memory);
        convs
            .update(Conversation::new("ops", "Ops Team", ConvType::Group).with_participants([ALICE, BOB]))
            .unwrap();
        convs
            .update(Conversation::new("dev", "Dev Team", ConvType::Group).with_participants([ALINA]))
            .unwrap();
        for (id, name) in [(ALICE, "Alice Smith"), (ALINA, "Alina Jones"), (BOB, "Bob Stone")] {
            users.store_user(&User::new(id, name).definitive()).unwrap();
        }
        users.set_nickname(BOB, "bobby").unwrap();
        Fixture { convs, users }
    }

    fn run(f: &Fixture, p: &ArgPreprocessor, input: &str) -> Result<Vec<String>, ArgumentError> {
        let ctx = ResolveContext {
            conversations: &f.convs,
            users: &f.users,
            conv_id: "ops",
            user_id: ALICE,
        };
        p.process(&ctx, shell_split(input))
    }

    #[test]
    fn inbuilt_conversations_and_users() {
        let f = fixture();
        let p = ArgPreprocessor::new();
        assert_eq!(run(&f, &p, "#here #dev @me").unwrap(), vec!["ops", "dev", ALICE]);
        assert_eq!(run(&f, &p, "@bobby").unwrap(), vec![BOB]);
        // "ali" is ambiguous globally, but only Alice is in ops.
        assert_eq!(run(&f, &p, "@ali").unwrap(), vec![ALICE]);
        assert_eq!(run(&f, &p, "#dev|@ali").unwrap(), vec![ALINA]);
        assert!(run(&f, &p, "#team").is_err());
        assert!(run(&f, &p, "@nobody").is_err());
    }

    #[test]
    fn verbatim_arguments_are_untouched() {
        let f = fixture();
        let p = ArgPreprocessor::new();
        assert_eq!(run(&f, &p, r#""@me" \#here"#).unwrap(), vec!["@me", "#here"]);
    }

    #[test]
    fn trigger_switches() {
        let f = fixture();
        let p = ArgPreprocessor::new();
        assert_eq!(run(&f, &p, "-resolve @me +resolve @me").unwrap(), vec!["@me", ALICE]);
        assert_eq!(run(&f, &p, "+resolve:off @me +resolve:* @me").unwrap(), vec!["@me", ALICE]);
        assert_eq!(run(&f, &p, "-resolve:inbuilt @me").unwrap(), vec!["@me"]);
        assert_eq!(run(&f, &p, "-resolve -resolve:inbuilt +resolve:inbuilt @me").unwrap(), vec![ALICE]);
    }

    #[test]
    fn plugin_groups_run_before_inbuilt() {
        let f = fixture();
        let p = ArgPreprocessor::new();
        p.register("upper", Some("shout"), 10, r"^@(.+)$", Arc::new(|_: &ResolveContext<'_>, caps: &Captures<'_>| {
            Ok(caps[1].to_uppercase())
        }))
        .unwrap();
        assert_eq!(p.group_names(), vec!["upper", INBUILT_GROUP]);
        assert_eq!(run(&f, &p, "@me").unwrap(), vec!["ME"]);
        assert_eq!(run(&f, &p, "-resolve:upper @me").unwrap(), vec![ALICE]);
        assert_eq!(p.deregister_plugin("shout"), 1);
        assert_eq!(run(&f, &p, "@me").unwrap(), vec![ALICE]);
    }

    #[test]
    fn custom_trigger_word() {
        let f = fixture();
        let p = ArgPreprocessor::new();
        p.set_trigger("Lookup");
        assert_eq!(run(&f, &p, "-lookup @me -resolve").unwrap(), vec!["@me", "-resolve"]);
    }
}
