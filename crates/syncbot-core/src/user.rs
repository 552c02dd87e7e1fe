//! User identities.
//!
//! [`User`] is a person on the primary platform. [`SyncUser`] wraps it with
//! the data another platform supplied when relaying a message: the identifier
//! of the relaying platform, an optional nickname and profile link.

use serde::{Deserialize, Serialize};

/// Placeholder id for users without a bound primary identity.
pub const SYNC_USER_ID: &str = "sync";

/// Length of a canonical primary-platform user id.
pub const CANONICAL_ID_LEN: usize = 21;

/// Profile URL template for canonical users; `{id}` is replaced.
pub const PROFILE_URL_TEMPLATE: &str = "https://plus.google.com/u/0/{id}/about";

/// Whether `id` is a canonical primary-platform id (21 ASCII digits).
pub fn is_canonical_id(id: &str) -> bool {
    id.len() == CANONICAL_ID_LEN && id.bytes().all(|b| b.is_ascii_digit())
}

/// Strips the scheme from a photo URL so equal images compare equal.
pub fn normalize_photo_url(url: &str) -> String {
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("https:")
        .or_else(|| trimmed.strip_prefix("http:"))
        .unwrap_or(trimmed);
    if rest.starts_with("//") {
        rest.to_string()
    } else {
        format!("//{rest}")
    }
}

/// A user on the primary platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Canonical id or [`SYNC_USER_ID`].
    pub id: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    #[serde(default)]
    pub is_self: bool,
    /// Set once the data came from the platform itself rather than a guess.
    #[serde(default)]
    pub is_definitive: bool,
}

impl User {
    pub fn new(id: impl Into<String>, full_name: impl Into<String>) -> Self {
        let full_name = full_name.into();
        let first_name = full_name
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            id: id.into(),
            full_name,
            first_name,
            photo_url: None,
            emails: Vec::new(),
            is_self: false,
            is_definitive: false,
        }
    }

    pub fn definitive(mut self) -> Self {
        self.is_definitive = true;
        self
    }

    pub fn with_photo(mut self, url: &str) -> Self {
        self.photo_url = Some(normalize_photo_url(url));
        self
    }

    pub fn is_canonical(&self) -> bool {
        is_canonical_id(&self.id)
    }

    /// Merges `other` into `self`; returns whether anything changed.
    ///
    /// A definitive record is never overwritten by a non-definitive one.
    pub fn merge_from(&mut self, other: &User) -> bool {
        if self.is_definitive && !other.is_definitive {
            return false;
        }
        let mut merged = other.clone();
        if merged.photo_url.is_none() {
            merged.photo_url.clone_from(&self.photo_url);
        }
        if merged.emails.is_empty() {
            merged.emails.clone_from(&self.emails);
        }
        merged.is_self |= self.is_self;
        let changed = merged != *self;
        *self = merged;
        changed
    }

    /// Default profile link for canonical users.
    pub fn profile_url(&self) -> Option<String> {
        self.is_canonical()
            .then(|| PROFILE_URL_TEMPLATE.replace("{id}", &self.id))
    }
}

/// A user as seen by the sync layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUser {
    pub user: User,
    /// Platform tag of the relaying platform, e.g. `telegram:1234`.
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_link: Option<String>,
}

impl SyncUser {
    pub fn new(identifier: impl Into<String>, user: User) -> Self {
        Self {
            user,
            identifier: identifier.into(),
            nickname: None,
            user_link: None,
        }
    }

    /// A remote user without a bound primary identity.
    pub fn remote(
        identifier: impl Into<String>,
        full_name: impl Into<String>,
        user_link: Option<String>,
    ) -> Self {
        Self {
            user: User::new(SYNC_USER_ID, full_name),
            identifier: identifier.into(),
            nickname: None,
            user_link,
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.user.id
    }

    /// Explicit link, else the canonical profile URL.
    pub fn link(&self) -> Option<String> {
        self.user_link.clone().or_else(|| self.user.profile_url())
    }

    /// `Full Name (nick)` when a nickname is set and requested.
    pub fn display_name(&self, with_nickname: bool) -> String {
        match (&self.nickname, with_nickname) {
            (Some(nick), true) if !nick.is_empty() => format!("{} ({nick})", self.user.full_name),
            _ => self.user.full_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "123456789012345678901";

    #[test]
    fn canonical_ids() {
        assert!(is_canonical_id(CANONICAL));
        assert!(!is_canonical_id(SYNC_USER_ID));
        assert!(!is_canonical_id("12345678901234567890a"));
    }

    #[test]
    fn photo_urls_are_scheme_less() {
        assert_eq!(normalize_photo_url("https://x.org/p.png"), "//x.org/p.png");
        assert_eq!(normalize_photo_url("//x.org/p.png"), "//x.org/p.png");
        assert_eq!(normalize_photo_url("x.org/p.png"), "//x.org/p.png");
    }

    #[test]
    fn definitive_is_not_downgraded() {
        let mut known = User::new(CANONICAL, "Alice Real").definitive();
        let guess = User::new(CANONICAL, "alice?");
        assert!(!known.merge_from(&guess));
        assert_eq!(known.full_name, "Alice Real");

        let mut guessed = User::new(CANONICAL, "alice?");
        assert!(guessed.merge_from(&known));
        assert!(guessed.is_definitive);
        assert_eq!(guessed.first_name, "Alice");
    }

    #[test]
    fn sync_user_links_and_names() {
        let canon = SyncUser::new("hangouts:conv", User::new(CANONICAL, "Alice"));
        assert_eq!(
            canon.link().as_deref(),
            Some("https://plus.google.com/u/0/123456789012345678901/about")
        );
        let remote = SyncUser::remote("telegram:1", "Bob", None).with_nickname("bobby");
        assert_eq!(remote.id(), SYNC_USER_ID);
        assert_eq!(remote.link(), None);
        assert_eq!(remote.display_name(true), "Bob (bobby)");
        assert_eq!(remote.display_name(false), "Bob");
    }
}
