//! Permanent conversation memory.
//!
//! An in-process index of every conversation the bot has seen, mirrored to
//! the memory store under `convmem.<conv id>`:
//!
//! ```text
//! startup:  memory.convmem ──load()──► index ──reconcile(client)──► index
//! events:   Conversation ──update()──► diff? ──► save + (joined, left)
//! queries:  get("type:GROUP and tag:ops") ──► matching conversations
//! ```
//!
//! Records from older releases may miss fields; they are normalized on load
//! and an `UNKNOWN` type is inferred from the one-to-one index and the
//! participant count.

pub mod filter;

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use serde_json::Value;
use tracing::{debug, info, warn};

use syncbot_core::client::ProtocolClient;
use syncbot_core::conversation::{ConvType, Conversation};
use syncbot_core::error::{ClientResult, StoreError, StoreResult};
use syncbot_core::store::JsonStore;
use syncbot_core::user::User;

use crate::error::FilterResult;
use crate::tags::TagEngine;
use crate::users::{ONE_TO_ONE, USER_DATA, UserStore};
pub use filter::{Filter, TermKind};

pub const CONVMEM: &str = "convmem";

/// What changed when a conversation record was updated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvUpdate {
    /// The conversation was not known before.
    pub created: bool,
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

pub struct ConversationMemory {
    memory: JsonStore,
    users: UserStore,
    index: RwLock<BTreeMap<String, Conversation>>,
}

impl ConversationMemory {
    pub fn new(memory: JsonStore) -> Self {
        Self {
            users: UserStore::new(memory.clone()),
            memory,
            index: RwLock::new(BTreeMap::new()),
        }
    }

    /// Loads stored records, normalizing them; returns how many were loaded.
    pub fn load(&self, bot_user_id: &str) -> StoreResult<usize> {
        let raw = match self.memory.get_by_path(&[CONVMEM]) {
            Ok(Value::Object(map)) => map,
            _ => {
                self.memory.ensure_path(&[CONVMEM])?;
                return Ok(0);
            }
        };
        let one_to_ones = self.one_to_one_index();
        let mut loaded = BTreeMap::new();
        for (id, record) in raw {
            let mut value = record.clone();
            if let Value::Object(obj) = &mut value {
                obj.entry("id").or_insert_with(|| Value::from(id.clone()));
            }
            let mut conv = match serde_json::from_value::<Conversation>(value) {
                Ok(conv) => conv,
                Err(e) => {
                    warn!(conv_id = %id, error = %e, "Dropping unreadable conversation record");
                    continue;
                }
            };
            conv.id.clone_from(&id);
            if conv.conv_type == ConvType::Unknown {
                conv.conv_type = infer_type(&conv, &one_to_ones, bot_user_id);
                debug!(conv_id = %id, conv_type = %conv.conv_type, "Inferred conversation type");
            }
            let normalized = serde_json::to_value(&conv)?;
            if normalized != record {
                self.memory.set_by_path(&[CONVMEM, id.as_str()], normalized)?;
            }
            loaded.insert(id, conv);
        }
        let count = loaded.len();
        *self.index.write() = loaded;
        self.memory.save();
        info!(count, "Conversation memory loaded");
        Ok(count)
    }

    /// Refreshes the index from the protocol client.
    pub async fn reconcile(&self, client: &dyn ProtocolClient) -> ClientResult<usize> {
        let live = client.get_conversations().await?;
        let mut participants = BTreeSet::new();
        let mut changed = 0;
        for conv in live {
            participants.extend(conv.participants.iter().cloned());
            match self.update(conv) {
                Ok(Some(_)) => changed += 1,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to store conversation"),
            }
        }
        let ids: Vec<String> = participants.into_iter().collect();
        if !ids.is_empty() {
            self.get_users_from_query(client, &ids).await?;
        }
        info!(changed, total = self.len(), "Conversation memory reconciled");
        Ok(changed)
    }

    /// Stores `conv` if anything relevant changed.
    ///
    /// Returns `None` when the record was already up to date.
    pub fn update(&self, mut conv: Conversation) -> StoreResult<Option<ConvUpdate>> {
        let previous = self.index.read().get(&conv.id).cloned();
        let update = match &previous {
            None => ConvUpdate {
                created: true,
                joined: conv.participants.iter().cloned().collect(),
                left: Vec::new(),
            },
            Some(old) => {
                if conv.conv_type == ConvType::Unknown {
                    conv.conv_type = old.conv_type;
                } else if old.conv_type != ConvType::Unknown && old.conv_type != conv.conv_type {
                    warn!(
                        conv_id = %conv.id,
                        old = %old.conv_type,
                        new = %conv.conv_type,
                        "Conversation type changed"
                    );
                }
                if old == &conv {
                    return Ok(None);
                }
                let (joined, left) = old.membership_diff(&conv);
                ConvUpdate {
                    created: false,
                    joined,
                    left,
                }
            }
        };
        self.memory
            .set_by_path(&[CONVMEM, conv.id.as_str()], serde_json::to_value(&conv)?)?;
        self.memory.save();
        debug!(
            conv_id = %conv.id,
            created = update.created,
            joined = update.joined.len(),
            left = update.left.len(),
            "Conversation updated"
        );
        self.index.write().insert(conv.id.clone(), conv);
        Ok(Some(update))
    }

    pub fn remove(&self, conv_id: &str) -> bool {
        let removed = self.index.write().remove(conv_id).is_some();
        if removed {
            match self.memory.pop_by_path(&[CONVMEM, conv_id]) {
                Ok(_) | Err(StoreError::KeyNotFound(_)) => self.memory.save(),
                Err(e) => warn!(conv_id = %conv_id, error = %e, "Failed to forget conversation"),
            }
        }
        removed
    }

    pub fn get_conv(&self, conv_id: &str) -> Option<Conversation> {
        self.index.read().get(conv_id).cloned()
    }

    pub fn contains(&self, conv_id: &str) -> bool {
        self.index.read().contains_key(conv_id)
    }

    pub fn conv_type(&self, conv_id: &str) -> Option<ConvType> {
        self.index.read().get(conv_id).map(|c| c.conv_type)
    }

    pub fn participants(&self, conv_id: &str) -> BTreeSet<String> {
        self.index
            .read()
            .get(conv_id)
            .map(|c| c.participants.clone())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Conversation> {
        self.index.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Every user id seen in any conversation.
    pub fn all_user_ids(&self) -> BTreeSet<String> {
        self.index
            .read()
            .values()
            .flat_map(|c| c.participants.iter().cloned())
            .collect()
    }

    /// Batch-fetches authoritative records and stores them as definitive.
    pub async fn get_users_from_query(
        &self,
        client: &dyn ProtocolClient,
        ids: &[String],
    ) -> ClientResult<Vec<User>> {
        let users = client.get_users(ids).await?;
        for user in &users {
            let definitive = user.clone().definitive();
            if let Err(e) = self.users.store_user(&definitive) {
                warn!(user_id = %user.id, error = %e, "Failed to store user record");
            }
        }
        debug!(requested = ids.len(), received = users.len(), "User records fetched");
        Ok(users)
    }

    /// Conversations matching `filter`.
    ///
    /// `tag:` terms need the tag engine; without it they match nothing.
    pub fn get(
        &self,
        filter: &str,
        tags: Option<&TagEngine>,
    ) -> FilterResult<BTreeMap<String, Conversation>> {
        let parsed = filter::parse(filter)?;
        let index = self.index.read();
        let ids = self.eval(&parsed, &index, tags);
        Ok(ids
            .into_iter()
            .filter_map(|id| index.get(&id).map(|c| (id, c.clone())))
            .collect())
    }

    fn eval(
        &self,
        filter: &Filter,
        index: &BTreeMap<String, Conversation>,
        tags: Option<&TagEngine>,
    ) -> BTreeSet<String> {
        match filter {
            Filter::Or(parts) => parts
                .iter()
                .flat_map(|p| self.eval(p, index, tags))
                .collect(),
            Filter::And(parts) => {
                let mut sets = parts.iter().map(|p| self.eval(p, index, tags));
                let first = sets.next().unwrap_or_default();
                sets.fold(first, |acc, s| acc.intersection(&s).cloned().collect())
            }
            Filter::Term(TermKind::Random, n) => {
                let n = n.parse::<usize>().unwrap_or(1);
                index
                    .keys()
                    .cloned()
                    .choose_multiple(&mut rand::thread_rng(), n)
                    .into_iter()
                    .collect()
            }
            Filter::Term(kind, value) => index
                .values()
                .filter(|c| term_matches(*kind, value, c, tags))
                .map(|c| c.id.clone())
                .collect(),
        }
    }

    fn one_to_one_index(&self) -> BTreeSet<String> {
        self.memory.read(|data| {
            data.get(USER_DATA)
                .and_then(Value::as_object)
                .map(|users| {
                    users
                        .values()
                        .filter_map(|u| u.get(ONE_TO_ONE).and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        })
    }
}

fn infer_type(conv: &Conversation, one_to_ones: &BTreeSet<String>, bot_user_id: &str) -> ConvType {
    if one_to_ones.contains(&conv.id) {
        return ConvType::OneToOne;
    }
    let others = conv.participants.iter().filter(|p| *p != bot_user_id).count();
    if others <= 1 {
        ConvType::OneToOne
    } else {
        ConvType::Group
    }
}

fn term_matches(kind: TermKind, value: &str, conv: &Conversation, tags: Option<&TagEngine>) -> bool {
    match kind {
        TermKind::Text => conv.title.to_lowercase().contains(&value.to_lowercase()),
        TermKind::Id => conv.id == value,
        TermKind::ChatId => conv.id.split_once(':').map_or(conv.id.as_str(), |(_, c)| c) == value,
        TermKind::Type => ConvType::parse(value) == Some(conv.conv_type),
        TermKind::MinUsers => value
            .parse::<usize>()
            .is_ok_and(|n| conv.participants.len() >= n),
        TermKind::MaxUsers => value
            .parse::<usize>()
            .is_ok_and(|n| conv.participants.len() <= n),
        TermKind::Tag => tags.is_some_and(|t| t.conv_tags(&conv.id).contains(value)),
        TermKind::Random => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BOT: &str = "100000000000000000000";

    fn memory_with(records: Value) -> JsonStore {
        JsonStore::from_value("memory", json!({ "convmem": records }))
    }

    #[test]
    fn load_normalizes_and_infers_types() {
        let memory = memory_with(json!({
            "g": {"title": "Ops", "participants": [BOT, "a", "b"]},
            "d": {"title": "Alice", "participants": [BOT, "a"]},
            "x": {"title": "Lonely", "participants": ["a", "b", "c"]}
        }));
        memory
            .set_by_path(&[USER_DATA, "a", ONE_TO_ONE], json!("x"))
            .unwrap();
        let convs = ConversationMemory::new(memory.clone());
        assert_eq!(convs.load(BOT).unwrap(), 3);
        assert_eq!(convs.conv_type("g"), Some(ConvType::Group));
        assert_eq!(convs.conv_type("d"), Some(ConvType::OneToOne));
        assert_eq!(convs.conv_type("x"), Some(ConvType::OneToOne));
        let stored: Conversation = memory.get_as(&[CONVMEM, "g"]).unwrap();
        assert_eq!(stored.conv_type, ConvType::Group);
        assert!(stored.history);
    }

    #[test]
    fn update_reports_membership_diff() {
        let convs = ConversationMemory::new(JsonStore::in_memory("memory"));
        let first = Conversation::new("c", "Ops", ConvType::Group).with_participants(["a", "b"]);
        let created = convs.update(first.clone()).unwrap().unwrap();
        assert!(created.created);
        assert_eq!(convs.update(first).unwrap(), None);

        let next = Conversation::new("c", "Ops", ConvType::Unknown).with_participants(["b", "c"]);
        let diff = convs.update(next).unwrap().unwrap();
        assert_eq!(diff.joined, vec!["c".to_string()]);
        assert_eq!(diff.left, vec!["a".to_string()]);
        assert_eq!(convs.conv_type("c"), Some(ConvType::Group));
    }

    #[test]
    fn filter_queries() {
        let convs = ConversationMemory::new(JsonStore::in_memory("memory"));
        for conv in [
            Conversation::new("g1", "Ops Team", ConvType::Group).with_participants(["a", "b", "c"]),
            Conversation::new("g2", "Dev", ConvType::Group).with_participants(["a", "b"]),
            Conversation::new("telegram:42", "Ops bridge", ConvType::Group),
            Conversation::new("d1", "Alice", ConvType::OneToOne).with_participants(["a"]),
        ] {
            convs.update(conv).unwrap();
        }
        let ids = |f: &str| convs.get(f, None).unwrap().into_keys().collect::<Vec<_>>();
        assert_eq!(ids("ops"), vec!["g1", "telegram:42"]);
        assert_eq!(ids("type:GROUP and minusers:3"), vec!["g1"]);
        assert_eq!(ids("chat_id:42 or id:d1"), vec!["d1", "telegram:42"]);
        assert_eq!(ids("type:one_to_one or (text:dev and maxusers:2)"), vec!["d1", "g2"]);
        assert_eq!(convs.get("random:2", None).unwrap().len(), 2);
        assert!(ids("tag:ops").is_empty());
    }
}
