//! Per-user data kept in the memory store.
//!
//! Layout under `user_data.<user id>`:
//!
//! ```text
//! nickname   string
//! tags       [string]          (owned by the tag engine)
//! 1on1       conv id           (the bot's one-to-one with the user)
//! optout     bool | [conv id]  (user refuses one-to-one messages)
//! _user      User              (last known record)
//! ```

use serde_json::Value;
use tracing::debug;

use syncbot_core::error::StoreResult;
use syncbot_core::store::JsonStore;
use syncbot_core::user::User;

pub const USER_DATA: &str = "user_data";
pub const NICKNAME: &str = "nickname";
pub const ONE_TO_ONE: &str = "1on1";
pub const OPTOUT: &str = "optout";
const RECORD: &str = "_user";

#[derive(Clone)]
pub struct UserStore {
    memory: JsonStore,
}

impl UserStore {
    pub fn new(memory: JsonStore) -> Self {
        Self { memory }
    }

    pub fn user_data(&self, user_id: &str, key: &str) -> Option<Value> {
        self.memory.get_by_path(&[USER_DATA, user_id, key]).ok()
    }

    pub fn set_user_data(&self, user_id: &str, key: &str, value: Value) -> StoreResult<()> {
        self.memory.set_by_path(&[USER_DATA, user_id, key], value)?;
        self.memory.save();
        Ok(())
    }

    pub fn remove_user_data(&self, user_id: &str, key: &str) -> bool {
        let removed = self.memory.pop_by_path(&[USER_DATA, user_id, key]).is_ok();
        if removed {
            self.memory.save();
        }
        removed
    }

    pub fn get_nickname(&self, user_id: &str) -> Option<String> {
        self.user_data(user_id, NICKNAME)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|n| !n.is_empty())
    }

    /// Sets or, with an empty `nickname`, clears the nickname.
    pub fn set_nickname(&self, user_id: &str, nickname: &str) -> StoreResult<()> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            self.remove_user_data(user_id, NICKNAME);
            return Ok(());
        }
        self.set_user_data(user_id, NICKNAME, Value::from(nickname))
    }

    /// Finds the user whose nickname equals `nickname`, ignoring case.
    pub fn find_by_nickname(&self, nickname: &str) -> Option<String> {
        let wanted = nickname.to_lowercase();
        self.memory.read(|data| {
            data.get(USER_DATA)?
                .as_object()?
                .iter()
                .find(|(_, v)| {
                    v.get(NICKNAME)
                        .and_then(Value::as_str)
                        .is_some_and(|n| n.to_lowercase() == wanted)
                })
                .map(|(id, _)| id.clone())
        })
    }

    pub fn get_user(&self, user_id: &str) -> Option<User> {
        self.user_data(user_id, RECORD)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Stores `user`, never replacing a definitive record with a guess.
    ///
    /// Returns whether the stored record changed.
    pub fn store_user(&self, user: &User) -> StoreResult<bool> {
        let mut record = match self.get_user(&user.id) {
            Some(known) => known,
            None => {
                self.set_user_data(&user.id, RECORD, serde_json::to_value(user)?)?;
                return Ok(true);
            }
        };
        if !record.merge_from(user) {
            return Ok(false);
        }
        debug!(user_id = %user.id, definitive = record.is_definitive, "User record updated");
        self.set_user_data(&user.id, RECORD, serde_json::to_value(&record)?)?;
        Ok(true)
    }

    /// Every user id with stored data.
    pub fn known_ids(&self) -> Vec<String> {
        self.memory.read(|data| {
            data.get(USER_DATA)
                .and_then(Value::as_object)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn one_to_one(&self, user_id: &str) -> Option<String> {
        self.user_data(user_id, ONE_TO_ONE)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set_one_to_one(&self, user_id: &str, conv_id: &str) -> StoreResult<()> {
        self.set_user_data(user_id, ONE_TO_ONE, Value::from(conv_id))
    }

    /// Whether the user opted out of one-to-ones, globally or in `conv_id`.
    pub fn opted_out(&self, user_id: &str, conv_id: Option<&str>) -> bool {
        match self.user_data(user_id, OPTOUT) {
            Some(Value::Bool(b)) => b,
            Some(Value::Array(convs)) => conv_id
                .is_some_and(|c| convs.iter().any(|v| v.as_str() == Some(c))),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALICE: &str = "123456789012345678901";

    #[test]
    fn nicknames() {
        let users = UserStore::new(JsonStore::in_memory("memory"));
        users.set_nickname(ALICE, " ally ").unwrap();
        assert_eq!(users.get_nickname(ALICE).as_deref(), Some("ally"));
        assert_eq!(users.find_by_nickname("ALLY").as_deref(), Some(ALICE));
        users.set_nickname(ALICE, "").unwrap();
        assert_eq!(users.get_nickname(ALICE), None);
    }

    #[test]
    fn definitive_records_win() {
        let users = UserStore::new(JsonStore::in_memory("memory"));
        assert!(users.store_user(&User::new(ALICE, "Alice Real").definitive()).unwrap());
        assert!(!users.store_user(&User::new(ALICE, "guess")).unwrap());
        assert_eq!(users.get_user(ALICE).unwrap().full_name, "Alice Real");
    }

    #[test]
    fn optout_forms() {
        let memory = JsonStore::in_memory("memory");
        let users = UserStore::new(memory.clone());
        assert!(!users.opted_out(ALICE, None));
        users.set_user_data(ALICE, OPTOUT, json!(["c1"])).unwrap();
        assert!(users.opted_out(ALICE, Some("c1")));
        assert!(!users.opted_out(ALICE, Some("c2")));
        users.set_user_data(ALICE, OPTOUT, json!(true)).unwrap();
        assert!(users.opted_out(ALICE, Some("c2")));
    }
}
