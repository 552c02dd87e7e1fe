//! Conversation records and conversation id conventions.
//!
//! Ids on the primary platform are bare chat ids. Ids on every other
//! platform are `platform:chat...`. A *target tag* always carries the
//! platform, so loop detection can compare tags from any source.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvType {
    Group,
    OneToOne,
    Channel,
    #[default]
    Unknown,
}

impl ConvType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "GROUP",
            Self::OneToOne => "ONE_TO_ONE",
            Self::Channel => "CHANNEL",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GROUP" => Some(Self::Group),
            "ONE_TO_ONE" | "ONETOONE" | "1TO1" => Some(Self::OneToOne),
            "CHANNEL" => Some(Self::Channel),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConvType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvStatus {
    #[default]
    Active,
    Invited,
}

/// A conversation as tracked by conversation memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub conv_type: ConvType,
    #[serde(default)]
    pub participants: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub history: bool,
    #[serde(default)]
    pub link_sharing: bool,
    #[serde(default)]
    pub status: ConvStatus,
}

fn default_true() -> bool {
    true
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>, conv_type: ConvType) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            conv_type,
            participants: BTreeSet::new(),
            history: true,
            link_sharing: false,
            status: ConvStatus::Active,
        }
    }

    pub fn with_participants<I, S>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.participants = participants.into_iter().map(Into::into).collect();
        self
    }

    /// Users that joined and left between `self` and `newer`.
    pub fn membership_diff(&self, newer: &Conversation) -> (Vec<String>, Vec<String>) {
        let joined = newer
            .participants
            .difference(&self.participants)
            .cloned()
            .collect();
        let left = self
            .participants
            .difference(&newer.participants)
            .cloned()
            .collect();
        (joined, left)
    }
}

/// Whether `conv_id` lives on the primary platform.
pub fn is_primary_conv(conv_id: &str) -> bool {
    !conv_id.contains(':')
}

/// Platform part of a conversation id; `primary` for bare ids.
pub fn platform_of<'a>(conv_id: &'a str, primary: &'a str) -> &'a str {
    conv_id.split_once(':').map_or(primary, |(platform, _)| platform)
}

/// Tag used in `previous_targets` for a destination conversation.
pub fn target_tag(conv_id: &str, primary: &str) -> String {
    if is_primary_conv(conv_id) {
        format!("{primary}:{conv_id}")
    } else {
        conv_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_and_platforms() {
        assert_eq!(target_tag("abc", "hangouts"), "hangouts:abc");
        assert_eq!(target_tag("telegram:12", "hangouts"), "telegram:12");
        assert_eq!(platform_of("slack:team:chan", "hangouts"), "slack");
        assert_eq!(platform_of("abc", "hangouts"), "hangouts");
    }

    #[test]
    fn membership_diff_reports_both_sides() {
        let old = Conversation::new("c", "t", ConvType::Group).with_participants(["a", "b"]);
        let new = Conversation::new("c", "t", ConvType::Group).with_participants(["b", "c"]);
        let (joined, left) = old.membership_diff(&new);
        assert_eq!(joined, vec!["c".to_string()]);
        assert_eq!(left, vec!["a".to_string()]);
    }

    #[test]
    fn deserializes_with_missing_fields() {
        let conv: Conversation = serde_json::from_str(r#"{"id": "x", "type": "GROUP"}"#).unwrap();
        assert_eq!(conv.conv_type, ConvType::Group);
        assert!(conv.history);
        assert_eq!(conv.status, ConvStatus::Active);
    }
}
