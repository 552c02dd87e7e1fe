//! Binding remote platform identities to canonical users.
//!
//! Per remote user `R` on platform `P`:
//!
//! ```text
//!            start(P, R)                 complete(P, U, R, split)
//! UNBOUND ──────────────► PENDING(token) ─────────────────────────► BOUND(U)
//!    ▲                                                                  │
//!    └──────────────────────────── unsync(P, U) ────────────────────────┘
//! ```
//!
//! State lives in the memory store under `profilesync.<platform>`:
//!
//! ```text
//! pending_token2remote   token → R
//! pending_remote2token   R → token
//! remote2canonical       R → U
//! canonical2remote       U → R
//! ```
//!
//! Completing without `split` also wires the canonical user's one-to-one on
//! the primary platform to the remote private chat `P:R` (`sync_pairs`).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info};

use syncbot_core::error::StoreError;
use syncbot_core::store::JsonStore;

use crate::bot::{Bot, OneToOne};
use crate::error::{ProfileSyncError, ProfileSyncResult};
use crate::pluggable::Call;

pub const PROFILESYNC: &str = "profilesync";
pub const SYNC_PAIRS: &str = "sync_pairs";

pub const TOKEN_LEN: usize = 7;
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const PENDING_TOKEN2REMOTE: &str = "pending_token2remote";
const PENDING_REMOTE2TOKEN: &str = "pending_remote2token";
const REMOTE2CANONICAL: &str = "remote2canonical";
const CANONICAL2REMOTE: &str = "canonical2remote";

/// Broadcast on the `sync_profile` bucket after a bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSyncEvent {
    pub platform: String,
    pub remote_user: String,
    pub canonical_user: String,
    /// The canonical user's one-to-one with the bot, when one exists.
    pub conv_1on1: Option<String>,
    pub split_1on1s: bool,
}

/// A platform that accepted profile sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSyncPlatform {
    pub platform: String,
    /// Human readable name, used in instructions.
    pub label: String,
    pub plugin: Option<String>,
}

pub struct ProfileSync {
    memory: JsonStore,
    platforms: RwLock<BTreeMap<String, ProfileSyncPlatform>>,
}

impl ProfileSync {
    pub fn new(memory: JsonStore) -> Self {
        Self {
            memory,
            platforms: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, platform: &str, label: &str, plugin: Option<&str>) {
        self.platforms.write().insert(
            platform.to_string(),
            ProfileSyncPlatform {
                platform: platform.to_string(),
                label: label.to_string(),
                plugin: plugin.map(str::to_string),
            },
        );
        info!(platform = %platform, "Profile sync registered");
    }

    pub fn deregister_plugin(&self, plugin: &str) -> usize {
        let mut platforms = self.platforms.write();
        let before = platforms.len();
        platforms.retain(|_, p| p.plugin.as_deref() != Some(plugin));
        before - platforms.len()
    }

    pub fn platform(&self, platform: &str) -> Option<ProfileSyncPlatform> {
        self.platforms.read().get(platform).cloned()
    }

    fn ensure_registered(&self, platform: &str) -> ProfileSyncResult<()> {
        if self.platforms.read().contains_key(platform) {
            Ok(())
        } else {
            Err(ProfileSyncError::NotRegistered(platform.to_string()))
        }
    }

    fn get(&self, platform: &str, map: &str, key: &str) -> Option<String> {
        self.memory
            .get_by_path(&[PROFILESYNC, platform, map, key])
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn set(&self, platform: &str, map: &str, key: &str, value: &str) -> ProfileSyncResult<()> {
        self.memory
            .set_by_path(&[PROFILESYNC, platform, map, key], Value::from(value))?;
        Ok(())
    }

    fn pop(&self, platform: &str, map: &str, key: &str) -> Option<String> {
        self.memory
            .pop_by_path(&[PROFILESYNC, platform, map, key])
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub fn canonical_for(&self, platform: &str, remote_user: &str) -> Option<String> {
        self.get(platform, REMOTE2CANONICAL, remote_user)
    }

    pub fn remote_for(&self, platform: &str, canonical_user: &str) -> Option<String> {
        self.get(platform, CANONICAL2REMOTE, canonical_user)
    }

    pub fn pending_token(&self, platform: &str, remote_user: &str) -> Option<String> {
        self.get(platform, PENDING_REMOTE2TOKEN, remote_user)
    }

    /// Finds the pending sync a token belongs to: `(platform, remote user)`.
    pub fn lookup_token(&self, token: &str) -> Option<(String, String)> {
        let token = token.trim().to_ascii_uppercase();
        let platforms: Vec<String> = self.platforms.read().keys().cloned().collect();
        platforms.into_iter().find_map(|platform| {
            self.get(&platform, PENDING_TOKEN2REMOTE, &token)
                .map(|remote| (platform, remote))
        })
    }

    // ─── Transitions ─────────────────────────────────────────────────────────

    /// UNBOUND → PENDING. Returns the token; a pending sync keeps its token.
    pub fn start(&self, platform: &str, remote_user: &str) -> ProfileSyncResult<String> {
        self.ensure_registered(platform)?;
        if self.canonical_for(platform, remote_user).is_some() {
            return Err(ProfileSyncError::AlreadyCompleted {
                platform: platform.to_string(),
                remote_user: remote_user.to_string(),
            });
        }
        if let Some(token) = self.pending_token(platform, remote_user) {
            return Ok(token);
        }
        let token = loop {
            let candidate = new_token();
            if self.get(platform, PENDING_TOKEN2REMOTE, &candidate).is_none() {
                break candidate;
            }
        };
        self.set(platform, PENDING_TOKEN2REMOTE, &token, remote_user)?;
        self.set(platform, PENDING_REMOTE2TOKEN, remote_user, &token)?;
        self.memory.save();
        debug!(platform = %platform, remote_user = %remote_user, "Profile sync started");
        Ok(token)
    }

    /// How to finish the bind, shown on the remote platform.
    pub fn instructions(&self, platform: &str, token: &str, command_prefix: &str) -> String {
        let label = self
            .platform(platform)
            .map_or_else(|| platform.to_string(), |p| p.label);
        format!(
            "To sync your {label} profile, send `{command_prefix} syncprofile {token}` to the bot \
             in a private chat on the primary platform.\n\
             Add `split` to keep your one-to-one chats separate: \
             `{command_prefix} syncprofile {token} split`"
        )
    }

    /// PENDING → BOUND without side effects on other components.
    pub fn bind(&self, platform: &str, canonical_user: &str, remote_user: &str) -> ProfileSyncResult<()> {
        self.ensure_registered(platform)?;
        if self.canonical_for(platform, remote_user).is_some() {
            return Err(ProfileSyncError::AlreadyCompleted {
                platform: platform.to_string(),
                remote_user: remote_user.to_string(),
            });
        }
        let token = self
            .pop(platform, PENDING_REMOTE2TOKEN, remote_user)
            .ok_or_else(|| ProfileSyncError::NotPending {
                platform: platform.to_string(),
                remote_user: remote_user.to_string(),
            })?;
        self.pop(platform, PENDING_TOKEN2REMOTE, &token);
        // One remote identity per canonical user and platform.
        if let Some(previous) = self.pop(platform, CANONICAL2REMOTE, canonical_user) {
            self.pop(platform, REMOTE2CANONICAL, &previous);
            self.remove_sync_pairs_with(&format!("{platform}:{previous}"))?;
        }
        self.set(platform, REMOTE2CANONICAL, remote_user, canonical_user)?;
        self.set(platform, CANONICAL2REMOTE, canonical_user, remote_user)?;
        self.memory.save();
        Ok(())
    }

    /// PENDING → BOUND, wiring one-to-ones and notifying `sync_profile`.
    pub async fn complete(
        &self,
        bot: &Bot,
        platform: &str,
        canonical_user: &str,
        remote_user: &str,
        split_1on1s: bool,
    ) -> ProfileSyncResult<ProfileSyncEvent> {
        self.bind(platform, canonical_user, remote_user)?;
        let conv_1on1 = match bot.get_1to1(canonical_user).await {
            OneToOne::Found(conv_id) => Some(conv_id),
            OneToOne::NotAllowed | OneToOne::Failed => None,
        };
        if !split_1on1s && let Some(conv_id) = &conv_1on1 {
            self.add_sync_pair(conv_id, &format!("{platform}:{remote_user}"))?;
        }
        let event = ProfileSyncEvent {
            platform: platform.to_string(),
            remote_user: remote_user.to_string(),
            canonical_user: canonical_user.to_string(),
            conv_1on1,
            split_1on1s,
        };
        info!(
            platform = %platform,
            remote_user = %remote_user,
            split = split_1on1s,
            "Profile sync completed"
        );
        bot.hub()
            .sync_profile
            .run(Call::new(bot.clone(), Arc::new(event.clone())))
            .await;
        Ok(event)
    }

    /// Completes the pending sync identified by `token`.
    pub async fn complete_with_token(
        &self,
        bot: &Bot,
        token: &str,
        canonical_user: &str,
        split_1on1s: bool,
    ) -> ProfileSyncResult<ProfileSyncEvent> {
        let (platform, remote_user) = self
            .lookup_token(token)
            .ok_or_else(|| ProfileSyncError::UnknownToken(token.to_string()))?;
        self.complete(bot, &platform, canonical_user, &remote_user, split_1on1s)
            .await
    }

    /// BOUND → UNBOUND; returns the remote user that was unbound.
    pub fn unsync(&self, platform: &str, canonical_user: &str) -> ProfileSyncResult<String> {
        let remote = self
            .pop(platform, CANONICAL2REMOTE, canonical_user)
            .ok_or_else(|| ProfileSyncError::NotBound(format!("{platform}:{canonical_user}")))?;
        self.pop(platform, REMOTE2CANONICAL, &remote);
        self.remove_sync_pairs_with(&format!("{platform}:{remote}"))?;
        self.memory.save();
        info!(platform = %platform, remote_user = %remote, "Profile sync removed");
        Ok(remote)
    }

    // ─── One-to-one sync pairs ───────────────────────────────────────────────

    pub fn sync_pairs(&self) -> Vec<(String, String)> {
        self.memory
            .get_as::<Vec<(String, String)>>(&[SYNC_PAIRS])
            .unwrap_or_default()
    }

    fn add_sync_pair(&self, a: &str, b: &str) -> ProfileSyncResult<()> {
        let mut pairs = self.sync_pairs();
        if !pairs.iter().any(|(x, y)| x == a && y == b) {
            pairs.push((a.to_string(), b.to_string()));
            self.memory
                .set_by_path(&[SYNC_PAIRS], serde_json::to_value(&pairs).unwrap_or_default())?;
            self.memory.save();
        }
        Ok(())
    }

    fn remove_sync_pairs_with(&self, conv_id: &str) -> ProfileSyncResult<()> {
        let pairs = self.sync_pairs();
        let kept: Vec<_> = pairs
            .iter()
            .filter(|(a, b)| a != conv_id && b != conv_id)
            .cloned()
            .collect();
        if kept.len() != pairs.len() {
            self.memory
                .set_by_path(&[SYNC_PAIRS], serde_json::to_value(&kept).map_err(StoreError::from)?)?;
        }
        Ok(())
    }
}

fn new_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| char::from(TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANON: &str = "123456789012345678901";

    fn sync() -> (ProfileSync, JsonStore) {
        let memory = JsonStore::in_memory("memory");
        let sync = ProfileSync::new(memory.clone());
        sync.register("telegram", "Telegram", Some("telesync"));
        (sync, memory)
    }

    #[test]
    fn tokens_use_the_restricted_alphabet() {
        let token = new_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
    }

    #[test]
    fn start_requires_registration_and_is_idempotent() {
        let (sync, _) = sync();
        assert!(matches!(sync.start("slack", "R1"), Err(ProfileSyncError::NotRegistered(_))));
        let token = sync.start("telegram", "R42").unwrap();
        assert_eq!(sync.start("telegram", "R42").unwrap(), token);
        assert_eq!(
            sync.lookup_token(&token.to_lowercase()),
            Some(("telegram".to_string(), "R42".to_string()))
        );
        assert!(sync.instructions("telegram", &token, "/bot").contains(&token));
    }

    #[test]
    fn bind_writes_both_directions_once() {
        let (sync, _) = sync();
        let token = sync.start("telegram", "R42").unwrap();
        sync.bind("telegram", CANON, "R42").unwrap();
        assert_eq!(sync.canonical_for("telegram", "R42").as_deref(), Some(CANON));
        assert_eq!(sync.remote_for("telegram", CANON).as_deref(), Some("R42"));
        assert_eq!(sync.lookup_token(&token), None);
        assert!(matches!(
            sync.bind("telegram", CANON, "R42"),
            Err(ProfileSyncError::AlreadyCompleted { .. })
        ));
        assert!(matches!(
            sync.start("telegram", "R42"),
            Err(ProfileSyncError::AlreadyCompleted { .. })
        ));
    }

    #[test]
    fn bind_requires_a_pending_sync() {
        let (sync, memory) = sync();
        assert!(matches!(
            sync.bind("telegram", CANON, "R9"),
            Err(ProfileSyncError::NotPending { .. })
        ));
        assert_eq!(sync.canonical_for("telegram", "R9"), None);
        assert!(!memory.exists(&[PROFILESYNC, "telegram", CANONICAL2REMOTE, CANON]));
    }

    #[test]
    fn rebinding_replaces_previous_remote() {
        let (sync, _) = sync();
        sync.start("telegram", "R1").unwrap();
        sync.bind("telegram", CANON, "R1").unwrap();
        sync.start("telegram", "R2").unwrap();
        sync.bind("telegram", CANON, "R2").unwrap();
        assert_eq!(sync.canonical_for("telegram", "R1"), None);
        assert_eq!(sync.remote_for("telegram", CANON).as_deref(), Some("R2"));
    }

    #[test]
    fn unsync_clears_binding_and_pairs() {
        let (sync, _) = sync();
        sync.start("telegram", "R42").unwrap();
        sync.bind("telegram", CANON, "R42").unwrap();
        sync.add_sync_pair("dm", "telegram:R42").unwrap();
        assert_eq!(sync.unsync("telegram", CANON).unwrap(), "R42");
        assert!(sync.sync_pairs().is_empty());
        assert!(matches!(sync.unsync("telegram", CANON), Err(ProfileSyncError::NotBound(_))));
    }

    #[test]
    fn deregistering_the_plugin_disables_the_platform() {
        let (sync, _) = sync();
        assert_eq!(sync.deregister_plugin("telesync"), 1);
        assert!(sync.platform("telegram").is_none());
    }
}
