//! Events flowing through the bot.
//!
//! Two families exist:
//!
//! - **Chat events** ([`ChatEvent`], [`MembershipEvent`], ...) as delivered
//!   by the protocol client of the primary platform.
//! - **Sync events** ([`SyncEvent`], [`SyncEventMembership`]) built by the
//!   router once per destination. The `previous_targets` and
//!   `notified_users` sets are shared between every destination of one
//!   fan-out, so a later destination sees what earlier ones recorded.
//!
//! Handlers exchange per-event data through [`EventContext`]: a JSON map for
//! data that survives a round trip through the protocol, and typed
//! [`Extensions`] for everything else.

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::format::{self, FormatStyle, Markup, Segment, TextSegment};
use crate::image::{ImageData, SyncImage};
use crate::user::{SyncUser, User};

// =============================================================================
// Context
// =============================================================================

/// Typed per-event storage keyed by type.
///
/// Only one value per type is stored; later inserts overwrite.
#[derive(Default)]
pub struct Extensions {
    map: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.lock().len())
            .finish()
    }
}

impl Extensions {
    pub fn insert<T: Send + Sync + 'static>(&self, value: T) {
        self.map.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        self.map
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.map.lock().contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T: 'static>(&self) -> Option<T> {
        self.map
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

/// Data handlers attach to an event.
#[derive(Debug, Default)]
pub struct EventContext {
    values: Mutex<Map<String, Value>>,
    extensions: Extensions,
}

impl EventContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn from_map(values: Map<String, Value>) -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(values),
            extensions: Extensions::default(),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.lock().insert(key.into(), value);
    }

    /// Merges `other` into the map; existing keys are overwritten.
    pub fn merge(&self, other: Map<String, Value>) {
        self.values.lock().extend(other);
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.lock().clone()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }
}

/// A set of strings shared between every destination of one fan-out.
#[derive(Debug, Clone, Default)]
pub struct TargetSet(Arc<Mutex<BTreeSet<String>>>);

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Arc::new(Mutex::new(items.into_iter().map(Into::into).collect())))
    }

    /// Adds `item`; returns whether it was new.
    pub fn insert(&self, item: impl Into<String>) -> bool {
        self.0.lock().insert(item.into())
    }

    pub fn contains(&self, item: &str) -> bool {
        self.0.lock().contains(item)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.0.lock().clone()
    }

    /// Whether both handles point at the same underlying set.
    pub fn same_as(&self, other: &TargetSet) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// =============================================================================
// Annotations
// =============================================================================

/// In-band metadata attached to an outgoing message and echoed back by the
/// protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub kind: u32,
    pub value: String,
}

impl Annotation {
    pub fn new(kind: u32, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

// =============================================================================
// Chat events
// =============================================================================

/// A message event from the primary platform.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub event_id: String,
    pub conv_id: String,
    pub user: User,
    pub segments: Vec<Segment>,
    pub image: Option<Arc<SyncImage>>,
    pub annotations: Vec<Annotation>,
    pub timestamp: DateTime<Utc>,
    pub context: Arc<EventContext>,
    /// Sent by the bot account itself.
    pub from_bot: bool,
    /// Already relayed by the sync layer; handlers must not relay it again.
    pub syncroom_no_repeat: bool,
}

impl ChatEvent {
    pub fn new(conv_id: impl Into<String>, user: User, segments: Vec<Segment>) -> Self {
        let from_bot = user.is_self;
        Self {
            event_id: String::new(),
            conv_id: conv_id.into(),
            user,
            segments,
            image: None,
            annotations: Vec::new(),
            timestamp: Utc::now(),
            context: EventContext::new(),
            from_bot,
            syncroom_no_repeat: false,
        }
    }

    pub fn text(&self) -> String {
        format::plain_text(&self.segments)
    }

    /// Annotation values of `kind`.
    pub fn annotations_of(&self, kind: u32) -> impl Iterator<Item = &str> {
        self.annotations
            .iter()
            .filter(move |a| a.kind == kind)
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipChange {
    Join,
    Leave,
}

/// Users joined or left a primary conversation.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub conv_id: String,
    /// Who triggered the change.
    pub user: User,
    pub change: MembershipChange,
    pub participant_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RenameEvent {
    pub conv_id: String,
    pub user: User,
    pub old_title: String,
    pub new_title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingStatus {
    Started,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TypingEvent {
    pub conv_id: String,
    pub user_id: String,
    pub status: TypingStatus,
}

#[derive(Debug, Clone)]
pub struct WatermarkEvent {
    pub conv_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CallEvent {
    pub conv_id: String,
    pub user_id: String,
    pub ongoing: bool,
}

// =============================================================================
// Sync events
// =============================================================================

/// Message content handed to the router.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Markdown-formatted text.
    Text(String),
    Segments(Vec<Segment>),
}

impl MessageBody {
    pub fn into_segments(self) -> Vec<Segment> {
        match self {
            Self::Text(text) => format::parse(&text, Markup::Markdown),
            Self::Segments(segments) => format::normalize(segments),
        }
    }
}

impl From<&str> for MessageBody {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<Segment>> for MessageBody {
    fn from(segments: Vec<Segment>) -> Self {
        Self::Segments(segments)
    }
}

/// The message a relayed message replies to.
#[derive(Debug, Clone)]
pub struct SyncReply {
    pub user: Option<SyncUser>,
    pub segments: Vec<Segment>,
    pub image: Option<Arc<SyncImage>>,
    /// Resolved per destination by the router.
    pub image_data: Option<ImageData>,
}

impl SyncReply {
    pub fn new(user: Option<SyncUser>, body: impl Into<MessageBody>) -> Self {
        Self {
            user,
            segments: body.into().into_segments(),
            image: None,
            image_data: None,
        }
    }

    pub fn with_image(mut self, image: Arc<SyncImage>) -> Self {
        self.image = Some(image);
        self
    }
}

/// One destination's view of a relayed message.
#[derive(Debug)]
pub struct SyncEvent {
    /// Source tag, `platform:chat`.
    pub identifier: String,
    /// Destination conversation.
    pub conv_id: String,
    /// Conversation the message originated in.
    pub source_conv: String,
    pub user: SyncUser,
    pub segments: Vec<Segment>,
    pub reply: Option<SyncReply>,
    pub image: Option<Arc<SyncImage>>,
    /// The image rendered for this destination, if any.
    pub image_data: Option<ImageData>,
    pub title: Option<String>,
    pub edited: bool,
    pub from_bot: bool,
    pub previous_targets: TargetSet,
    pub notified_users: TargetSet,
    pub context: Arc<EventContext>,
    syncroom_no_repeat: AtomicBool,
}

impl SyncEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier: impl Into<String>,
        conv_id: impl Into<String>,
        source_conv: impl Into<String>,
        user: SyncUser,
        segments: Vec<Segment>,
        previous_targets: TargetSet,
        notified_users: TargetSet,
        context: Arc<EventContext>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            conv_id: conv_id.into(),
            source_conv: source_conv.into(),
            user,
            segments,
            reply: None,
            image: None,
            image_data: None,
            title: None,
            edited: false,
            from_bot: false,
            previous_targets,
            notified_users,
            context,
            syncroom_no_repeat: AtomicBool::new(false),
        }
    }

    pub fn text(&self) -> String {
        format::plain_text(&self.segments)
    }

    pub fn syncroom_no_repeat(&self) -> bool {
        self.syncroom_no_repeat.load(Ordering::Relaxed)
    }

    pub fn set_syncroom_no_repeat(&self, value: bool) {
        self.syncroom_no_repeat.store(value, Ordering::Relaxed);
    }

    /// Segments prefixed with the bold sender name (and title, if any).
    pub fn labelled_segments(&self, with_nickname: bool) -> Vec<Segment> {
        let mut name = self.user.display_name(with_nickname);
        if let Some(title) = self.title.as_deref().filter(|t| !t.is_empty()) {
            name = format!("{name} ({title})");
        }
        let mut label = TextSegment::plain(name).bold();
        if let Some(link) = self.user.link() {
            label = label.link(link);
        }
        let mut out = vec![Segment::Text(label), Segment::text(": ")];
        out.extend(self.segments.iter().cloned());
        out
    }

    /// The labelled message rendered in `style`.
    pub fn formatted(&self, style: &FormatStyle, with_nickname: bool) -> String {
        format::format_segments(&self.labelled_segments(with_nickname), style)
    }

    /// A primary-platform view of this event for the legacy handler buckets.
    pub fn to_chat_event(&self) -> ChatEvent {
        let mut user = self.user.user.clone();
        user.is_self = self.from_bot;
        ChatEvent {
            event_id: String::new(),
            conv_id: self.conv_id.clone(),
            user,
            segments: self.segments.clone(),
            image: self.image.clone(),
            annotations: Vec::new(),
            timestamp: Utc::now(),
            context: Arc::clone(&self.context),
            from_bot: self.from_bot,
            syncroom_no_repeat: self.syncroom_no_repeat(),
        }
    }
}

/// One destination's view of a relayed membership change.
#[derive(Debug)]
pub struct SyncEventMembership {
    pub identifier: String,
    pub conv_id: String,
    pub source_conv: String,
    /// Who triggered the change.
    pub user: SyncUser,
    pub change: MembershipChange,
    pub participants: Vec<SyncUser>,
    pub title: Option<String>,
    pub previous_targets: TargetSet,
    pub notified_users: TargetSet,
    pub context: Arc<EventContext>,
}

impl SyncEventMembership {
    /// Human readable summary, e.g. `Alice added Bob, Carol`.
    pub fn summary(&self) -> String {
        let names = self
            .participants
            .iter()
            .map(|p| p.display_name(false))
            .collect::<Vec<_>>()
            .join(", ");
        let actor = self.user.display_name(false);
        match self.change {
            MembershipChange::Join if names.is_empty() || names == actor => format!("{actor} joined"),
            MembershipChange::Join => format!("{actor} added {names}"),
            MembershipChange::Leave if names.is_empty() || names == actor => format!("{actor} left"),
            MembershipChange::Leave => format!("{actor} removed {names}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Marker(u32);

    #[test]
    fn extensions_are_typed() {
        let ext = Extensions::default();
        assert!(!ext.contains::<Marker>());
        ext.insert(Marker(1));
        ext.insert(Marker(2));
        assert_eq!(ext.get::<Marker>(), Some(Marker(2)));
        assert_eq!(ext.remove::<Marker>(), Some(Marker(2)));
        assert_eq!(ext.get::<Marker>(), None);
    }

    #[test]
    fn target_sets_are_shared() {
        let a = TargetSet::with(["hangouts:x"]);
        let b = a.clone();
        assert!(b.insert("telegram:1"));
        assert!(!a.insert("telegram:1"));
        assert!(a.same_as(&b));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn labelled_segments_carry_name_and_link() {
        let user = SyncUser::remote("telegram:1", "Bob", Some("https://t.me/bob".into()));
        let mut event = SyncEvent::new(
            "telegram:1",
            "conv",
            "telegram:1",
            user,
            MessageBody::from("hi *there*").into_segments(),
            TargetSet::new(),
            TargetSet::new(),
            EventContext::new(),
        );
        event.title = Some("ops".into());
        assert_eq!(
            event.formatted(&FormatStyle::text(), false),
            "Bob (ops) (https://t.me/bob): hi there"
        );
        assert_eq!(event.text(), "hi there");
    }

    #[test]
    fn membership_summary() {
        let event = SyncEventMembership {
            identifier: "hangouts:c".into(),
            conv_id: "c".into(),
            source_conv: "c".into(),
            user: SyncUser::remote("hangouts:c", "Alice", None),
            change: MembershipChange::Join,
            participants: vec![SyncUser::remote("hangouts:c", "Bob", None)],
            title: None,
            previous_targets: TargetSet::new(),
            notified_users: TargetSet::new(),
            context: EventContext::new(),
        };
        assert_eq!(event.summary(), "Alice added Bob");
    }
}
