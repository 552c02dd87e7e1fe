//! Tag engine.
//!
//! Tags are short labels attached to users, conversations and users within
//! one conversation. They drive command access (see
//! [`CommandDispatcher`](crate::commands::CommandDispatcher)) and plugin
//! behaviour such as silencing.
//!
//! ```text
//!            config.conversations.<conv>.tags            ┐
//!            config.conversations.<conv>.tags-users.<u>  ├─► TagIndex
//!            memory.user_data.<user>.tags                ┘
//!
//! TagIndex:  tag → users    user → tags     (users include `conv|user`)
//!            tag → convs    conv → tags
//! ```
//!
//! Wildcards: `*` for any user or conversation, `GROUP` / `ONE_TO_ONE` for
//! conversations of that type. A tag may carry the deny prefix (default `!`)
//! to explicitly refuse commands requiring the bare tag.
//!
//! Lookups walk scopes from most to least specific and stop at the first
//! scope that has tags, unless the `tagging-merge` tag is among the tags
//! collected so far or `tagging.merge` is configured.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use syncbot_core::conversation::ConvType;
use syncbot_core::error::StoreError;
use syncbot_core::store::JsonStore;

use crate::conversations::ConversationMemory;
use crate::error::{TagError, TagResult};
use crate::users::UserStore;

pub const WILDCARD: &str = "*";
pub const ALL: &str = "ALL";
pub const MERGE_TAG: &str = "tagging-merge";
pub const DEFAULT_DENY_PREFIX: &str = "!";

const CONVERSATIONS: &str = "conversations";
const TAGS: &str = "tags";
const TAGS_USERS: &str = "tags-users";

/// What a tag is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagType {
    User,
    Conv,
    /// A user within one conversation; ids are `conv|user`.
    ConvUser,
}

impl TagType {
    pub fn parse(s: &str) -> TagResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "conv" => Ok(Self::Conv),
            "convuser" => Ok(Self::ConvUser),
            _ => Err(TagError::InvalidType(s.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct TagIndex {
    tag_users: BTreeMap<String, BTreeSet<String>>,
    user_tags: BTreeMap<String, BTreeSet<String>>,
    tag_convs: BTreeMap<String, BTreeSet<String>>,
    conv_tags: BTreeMap<String, BTreeSet<String>>,
}

impl TagIndex {
    fn sides(&mut self, kind: TagType) -> (&mut BTreeMap<String, BTreeSet<String>>, &mut BTreeMap<String, BTreeSet<String>>) {
        match kind {
            TagType::Conv => (&mut self.conv_tags, &mut self.tag_convs),
            TagType::User | TagType::ConvUser => (&mut self.user_tags, &mut self.tag_users),
        }
    }

    fn insert(&mut self, kind: TagType, id: &str, tag: &str) -> bool {
        let (forward, backward) = self.sides(kind);
        let added = forward.entry(id.to_string()).or_default().insert(tag.to_string());
        backward.entry(tag.to_string()).or_default().insert(id.to_string());
        added
    }

    fn delete(&mut self, kind: TagType, id: &str, tag: &str) -> bool {
        let (forward, backward) = self.sides(kind);
        let removed = forward.get_mut(id).is_some_and(|t| t.remove(tag));
        if forward.get(id).is_some_and(BTreeSet::is_empty) {
            forward.remove(id);
        }
        if let Some(ids) = backward.get_mut(tag) {
            ids.remove(id);
            if ids.is_empty() {
                backward.remove(tag);
            }
        }
        removed
    }
}

pub struct TagEngine {
    config: JsonStore,
    users: UserStore,
    convs: Arc<ConversationMemory>,
    index: RwLock<TagIndex>,
}

impl TagEngine {
    pub fn new(config: JsonStore, memory: JsonStore, convs: Arc<ConversationMemory>) -> Self {
        Self {
            config,
            users: UserStore::new(memory),
            convs,
            index: RwLock::new(TagIndex::default()),
        }
    }

    /// `tagging.deny_prefix`, `!` unless configured.
    pub fn deny_prefix(&self) -> String {
        self.tagging_option("deny_prefix")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_DENY_PREFIX.to_string())
    }

    fn merge_configured(&self) -> bool {
        self.tagging_option("merge")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn tagging_option(&self, key: &str) -> Option<Value> {
        self.config.get_option("tagging")?.get(key).cloned()
    }

    // ─── Index maintenance ───────────────────────────────────────────────────

    /// Rebuilds the indices from config and memory.
    pub fn refresh_indices(&self) {
        let mut index = TagIndex::default();
        self.config.read(|data| {
            let Some(convs) = data.get(CONVERSATIONS).and_then(Value::as_object) else {
                return;
            };
            for (conv_id, conv) in convs {
                for tag in string_list(conv.get(TAGS)) {
                    index.insert(TagType::Conv, conv_id, &tag);
                }
                let Some(per_user) = conv.get(TAGS_USERS).and_then(Value::as_object) else {
                    continue;
                };
                for (user_id, tags) in per_user {
                    let key = convuser_key(conv_id, user_id);
                    for tag in string_list(Some(tags)) {
                        index.insert(TagType::ConvUser, &key, &tag);
                    }
                }
            }
        });
        for user_id in self.users.known_ids() {
            for tag in string_list(self.users.user_data(&user_id, TAGS).as_ref()) {
                index.insert(TagType::User, &user_id, &tag);
            }
        }
        info!(
            tags = index.tag_users.len() + index.tag_convs.len(),
            "Tag indices refreshed"
        );
        *self.index.write() = index;
    }

    /// Adds `tag`; returns `false` if it was already present.
    pub fn add(&self, kind: TagType, id: &str, tag: &str) -> TagResult<bool> {
        self.validate_tag(tag)?;
        self.validate_id(kind, id)?;
        let added = self.index.write().insert(kind, id, tag);
        if added {
            self.persist(kind, id)?;
            debug!(kind = ?kind, id = %id, tag = %tag, "Tag added");
        }
        Ok(added)
    }

    /// Removes `tag`; returns `false` if it was not present.
    pub fn remove(&self, kind: TagType, id: &str, tag: &str) -> TagResult<bool> {
        let removed = self.index.write().delete(kind, id, tag);
        if removed {
            self.persist(kind, id)?;
            debug!(kind = ?kind, id = %id, tag = %tag, "Tag removed");
        }
        Ok(removed)
    }

    /// Removes every tag of `id`, or of every id of `kind` for `ALL`.
    pub fn purge(&self, kind: TagType, id: &str) -> TagResult<usize> {
        let targets: Vec<(String, String)> = {
            let index = self.index.read();
            index
                .sides_ref(kind)
                .iter()
                .filter(|(key, _)| match kind {
                    _ if id != ALL => key.as_str() == id,
                    TagType::ConvUser => key.contains('|'),
                    TagType::User => !key.contains('|'),
                    TagType::Conv => true,
                })
                .flat_map(|(key, tags)| tags.iter().map(|t| (key.clone(), t.clone())))
                .collect()
        };
        let mut removed = 0;
        for (key, tag) in targets {
            if self.remove(kind, &key, &tag)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes `tag` from every user and conversation.
    pub fn purge_tag(&self, tag: &str) -> TagResult<usize> {
        let (users, convs) = {
            let index = self.index.read();
            (
                index.tag_users.get(tag).cloned().unwrap_or_default(),
                index.tag_convs.get(tag).cloned().unwrap_or_default(),
            )
        };
        let mut removed = 0;
        for id in users {
            let kind = if id.contains('|') { TagType::ConvUser } else { TagType::User };
            removed += usize::from(self.remove(kind, &id, tag)?);
        }
        for id in convs {
            removed += usize::from(self.remove(TagType::Conv, &id, tag)?);
        }
        Ok(removed)
    }

    // ─── Lookups ─────────────────────────────────────────────────────────────

    /// Tags assigned directly to a conversation or wildcard.
    pub fn conv_tags(&self, conv_id: &str) -> BTreeSet<String> {
        self.index.read().conv_tags.get(conv_id).cloned().unwrap_or_default()
    }

    /// Tags assigned directly to a user, wildcard or `conv|user` key.
    pub fn user_tags(&self, user_id: &str) -> BTreeSet<String> {
        self.index.read().user_tags.get(user_id).cloned().unwrap_or_default()
    }

    pub fn users_with(&self, tag: &str) -> BTreeSet<String> {
        self.index.read().tag_users.get(tag).cloned().unwrap_or_default()
    }

    pub fn convs_with(&self, tag: &str) -> BTreeSet<String> {
        self.index.read().tag_convs.get(tag).cloned().unwrap_or_default()
    }

    /// Active tags of a conversation: itself, then its type, then `*`.
    pub fn conv_active(&self, conv_id: &str) -> BTreeSet<String> {
        let mut scopes = vec![conv_id.to_string()];
        if let Some(type_tag) = self.conv_type_tag(conv_id) {
            scopes.push(type_tag.to_string());
        }
        scopes.push(WILDCARD.to_string());
        let index = self.index.read();
        self.walk(&scopes, &index.conv_tags)
    }

    /// Active tags of a user, optionally within a conversation.
    pub fn user_active(&self, user_id: &str, conv_id: Option<&str>) -> BTreeSet<String> {
        let mut scopes = Vec::new();
        if let Some(conv_id) = conv_id {
            scopes.push(convuser_key(conv_id, user_id));
            scopes.push(convuser_key(conv_id, WILDCARD));
            if let Some(type_tag) = self.conv_type_tag(conv_id) {
                scopes.push(convuser_key(type_tag, user_id));
                scopes.push(convuser_key(type_tag, WILDCARD));
            }
        }
        scopes.push(user_id.to_string());
        scopes.push(WILDCARD.to_string());
        let index = self.index.read();
        self.walk(&scopes, &index.user_tags)
    }

    /// Participants of `conv_id` with their active tags.
    ///
    /// With `filter`, only users holding at least one of those tags remain.
    pub fn user_list(&self, conv_id: &str, filter: Option<&[String]>) -> BTreeMap<String, BTreeSet<String>> {
        self.convs
            .participants(conv_id)
            .into_iter()
            .map(|user| {
                let tags = self.user_active(&user, Some(conv_id));
                (user, tags)
            })
            .filter(|(_, tags)| filter.is_none_or(|wanted| wanted.iter().any(|t| tags.contains(t))))
            .collect()
    }

    fn walk(&self, scopes: &[String], forward: &BTreeMap<String, BTreeSet<String>>) -> BTreeSet<String> {
        let merge_all = self.merge_configured();
        let mut active = BTreeSet::new();
        for scope in scopes {
            let Some(tags) = forward.get(scope) else {
                continue;
            };
            active.extend(tags.iter().cloned());
            if !tags.is_empty() && !merge_all && !active.contains(MERGE_TAG) {
                break;
            }
        }
        active
    }

    fn conv_type_tag(&self, conv_id: &str) -> Option<&'static str> {
        match self.convs.conv_type(conv_id)? {
            ConvType::OneToOne => Some("ONE_TO_ONE"),
            ConvType::Group | ConvType::Channel => Some("GROUP"),
            ConvType::Unknown => None,
        }
    }

    // ─── Validation and persistence ──────────────────────────────────────────

    fn validate_tag(&self, tag: &str) -> TagResult<()> {
        let prefix = self.deny_prefix();
        let body = tag.strip_prefix(prefix.as_str()).unwrap_or(tag);
        let valid = !body.is_empty()
            && body
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(())
        } else {
            Err(TagError::InvalidTag(tag.to_string()))
        }
    }

    fn validate_id(&self, kind: TagType, id: &str) -> TagResult<()> {
        match kind {
            TagType::Conv => self.validate_conv(id),
            TagType::User => self.validate_user(id),
            TagType::ConvUser => {
                let (conv, user) = id
                    .split_once('|')
                    .ok_or_else(|| TagError::MalformedId(id.to_string()))?;
                self.validate_conv(conv)?;
                self.validate_user(user)
            }
        }
    }

    fn validate_conv(&self, conv_id: &str) -> TagResult<()> {
        if matches!(conv_id, WILDCARD | "GROUP" | "ONE_TO_ONE") || self.convs.contains(conv_id) {
            Ok(())
        } else {
            Err(TagError::UnknownConversation(conv_id.to_string()))
        }
    }

    fn validate_user(&self, user_id: &str) -> TagResult<()> {
        if user_id == WILDCARD
            || self.users.get_user(user_id).is_some()
            || self.convs.all_user_ids().contains(user_id)
        {
            Ok(())
        } else {
            Err(TagError::UnknownUser(user_id.to_string()))
        }
    }

    fn persist(&self, kind: TagType, id: &str) -> TagResult<()> {
        let tags: Vec<Value> = self
            .index
            .read()
            .sides_ref(kind)
            .get(id)
            .map(|t| t.iter().cloned().map(Value::from).collect())
            .unwrap_or_default();
        match kind {
            TagType::User => {
                if tags.is_empty() {
                    self.users.remove_user_data(id, TAGS);
                } else {
                    self.users.set_user_data(id, TAGS, Value::Array(tags))?;
                }
            }
            TagType::Conv => {
                write_list(&self.config, &[CONVERSATIONS, id, TAGS], tags)?;
            }
            TagType::ConvUser => {
                let (conv, user) = id
                    .split_once('|')
                    .ok_or_else(|| TagError::MalformedId(id.to_string()))?;
                write_list(&self.config, &[CONVERSATIONS, conv, TAGS_USERS, user], tags)?;
            }
        }
        Ok(())
    }
}

impl TagIndex {
    fn sides_ref(&self, kind: TagType) -> &BTreeMap<String, BTreeSet<String>> {
        match kind {
            TagType::Conv => &self.conv_tags,
            TagType::User | TagType::ConvUser => &self.user_tags,
        }
    }
}

pub fn convuser_key(conv_id: &str, user_id: &str) -> String {
    format!("{conv_id}|{user_id}")
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn write_list(store: &JsonStore, path: &[&str], tags: Vec<Value>) -> TagResult<()> {
    if tags.is_empty() {
        match store.pop_by_path(path) {
            Ok(_) | Err(StoreError::KeyNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    } else {
        store.set_by_path(path, Value::Array(tags))?;
    }
    store.save();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncbot_core::conversation::Conversation;

    fn engine() -> (TagEngine, JsonStore, JsonStore) {
        let config = JsonStore::in_memory("config");
        let memory = JsonStore::in_memory("memory");
        let convs = Arc::new(ConversationMemory::new(memory.clone()));
        convs
            .update(Conversation::new("g", "Ops", ConvType::Group).with_participants(["u1", "u2"]))
            .unwrap();
        convs
            .update(Conversation::new("d", "U1", ConvType::OneToOne).with_participants(["u1"]))
            .unwrap();
        (TagEngine::new(config.clone(), memory.clone(), convs), config, memory)
    }

    #[test]
    fn add_validates_and_writes_through() {
        let (tags, config, memory) = engine();
        assert!(tags.add(TagType::User, "u1", "admin-lite").unwrap());
        assert!(!tags.add(TagType::User, "u1", "admin-lite").unwrap());
        assert!(tags.add(TagType::Conv, "g", "ops").unwrap());
        assert!(tags.add(TagType::ConvUser, "g|u2", "!ops").unwrap());
        assert!(matches!(tags.add(TagType::User, "u1", "Bad Tag"), Err(TagError::InvalidTag(_))));
        assert!(matches!(tags.add(TagType::Conv, "nope", "x"), Err(TagError::UnknownConversation(_))));
        assert!(matches!(tags.add(TagType::User, "ghost", "x"), Err(TagError::UnknownUser(_))));
        assert!(matches!(tags.add(TagType::ConvUser, "g-u2", "x"), Err(TagError::MalformedId(_))));

        assert_eq!(memory.get_by_path(&["user_data", "u1", "tags"]).unwrap(), json!(["admin-lite"]));
        assert_eq!(config.get_by_path(&["conversations", "g", "tags"]).unwrap(), json!(["ops"]));
        assert_eq!(
            config.get_by_path(&["conversations", "g", "tags-users", "u2"]).unwrap(),
            json!(["!ops"])
        );

        tags.refresh_indices();
        assert_eq!(tags.users_with("admin-lite").into_iter().collect::<Vec<_>>(), vec!["u1"]);
        assert_eq!(tags.convs_with("ops").into_iter().collect::<Vec<_>>(), vec!["g"]);
    }

    #[test]
    fn user_active_scopes_short_circuit() {
        let (tags, config, _) = engine();
        tags.add(TagType::User, WILDCARD, "everyone").unwrap();
        tags.add(TagType::User, "u1", "dev").unwrap();
        tags.add(TagType::ConvUser, "GROUP|*", "grouper").unwrap();
        tags.add(TagType::ConvUser, "g|u1", "ops").unwrap();

        let set = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        assert_eq!(tags.user_active("u1", Some("g")), set(&["ops"]));
        assert_eq!(tags.user_active("u2", Some("g")), set(&["grouper"]));
        assert_eq!(tags.user_active("u1", Some("d")), set(&["dev"]));
        assert_eq!(tags.user_active("u2", None), set(&["everyone"]));

        tags.add(TagType::ConvUser, "g|u1", MERGE_TAG).unwrap();
        assert_eq!(
            tags.user_active("u1", Some("g")),
            set(&["dev", "everyone", "grouper", "ops", MERGE_TAG])
        );

        config.set_by_path(&["tagging"], json!({"merge": true})).unwrap();
        assert_eq!(tags.user_active("u2", Some("g")), set(&["everyone", "grouper"]));
    }

    #[test]
    fn conv_active_and_user_list() {
        let (tags, _, _) = engine();
        tags.add(TagType::Conv, "ONE_TO_ONE", "private").unwrap();
        tags.add(TagType::Conv, WILDCARD, "any").unwrap();
        tags.add(TagType::User, "u2", "ops").unwrap();
        assert_eq!(tags.conv_active("d").into_iter().collect::<Vec<_>>(), vec!["private"]);
        assert_eq!(tags.conv_active("g").into_iter().collect::<Vec<_>>(), vec!["any"]);

        let everyone = tags.user_list("g", None);
        assert_eq!(everyone.len(), 2);
        let ops = tags.user_list("g", Some(&["ops".to_string()]));
        assert_eq!(ops.keys().collect::<Vec<_>>(), vec!["u2"]);
    }

    #[test]
    fn purge_forms() {
        let (tags, _, _) = engine();
        tags.add(TagType::User, "u1", "a").unwrap();
        tags.add(TagType::User, "u1", "b").unwrap();
        tags.add(TagType::User, "u2", "a").unwrap();
        tags.add(TagType::ConvUser, "g|u1", "a").unwrap();
        tags.add(TagType::Conv, "g", "a").unwrap();

        assert_eq!(tags.purge(TagType::User, "u1").unwrap(), 2);
        assert_eq!(tags.purge(TagType::User, ALL).unwrap(), 1);
        assert_eq!(tags.user_tags("g|u1").len(), 1);
        assert_eq!(tags.purge_tag("a").unwrap(), 2);
        assert!(tags.conv_tags("g").is_empty());
    }

    #[test]
    fn deny_prefix_is_configurable() {
        let (tags, config, _) = engine();
        assert!(tags.add(TagType::User, "u1", "!ops").is_ok());
        config.set_by_path(&["tagging"], json!({"deny_prefix": "no-"})).unwrap();
        assert_eq!(tags.deny_prefix(), "no-");
        assert!(tags.add(TagType::User, "u1", "no-ops").is_ok());
        assert!(tags.add(TagType::User, "u1", "!ops2").is_err());
    }

    #[test]
    fn removing_the_last_tag_clears_the_entry() {
        let (tags, config, _) = engine();
        tags.add(TagType::Conv, "g", "ops").unwrap();
        assert!(tags.remove(TagType::Conv, "g", "ops").unwrap());
        assert!(!config.exists(&["conversations", "g", "tags"]));

        tags.add(TagType::ConvUser, "g|u2", "ops").unwrap();
        config.pop_by_path(&["conversations", "g"]).unwrap();
        assert!(tags.remove(TagType::ConvUser, "g|u2", "ops").unwrap());
        assert!(tags.user_tags("g|u2").is_empty());
    }
}
