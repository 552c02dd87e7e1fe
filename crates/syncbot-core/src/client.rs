//! Protocol client seam.
//!
//! The core never speaks a chat protocol itself. A [`ProtocolClient`] wraps
//! the primary platform's session; inbound traffic reaches the bot through
//! the [`InboundSender`] handed to [`ProtocolClient::connect`].
//!
//! ```text
//! chat service ◄──► ProtocolClient ──InboundEvent──► runtime event loop
//!                        ▲
//!                        └── send_message / get_users / kick ... (bot)
//! ```
//!
//! Because the runtime reconnects with a fresh session after failures, it is
//! handed a [`ClientFactory`] rather than a client.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::conversation::Conversation;
use crate::error::ClientResult;
use crate::event::{
    Annotation, CallEvent, ChatEvent, MembershipEvent, RenameEvent, TypingEvent, WatermarkEvent,
};
use crate::format::Segment;
use crate::user::User;

/// Everything the client can deliver to the bot.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(ChatEvent),
    Membership(MembershipEvent),
    Rename(RenameEvent),
    Typing(TypingEvent),
    Watermark(WatermarkEvent),
    Call(CallEvent),
    /// A conversation was created or its metadata changed.
    ConversationUpdate(Conversation),
}

impl InboundEvent {
    pub fn conv_id(&self) -> &str {
        match self {
            Self::Message(e) => &e.conv_id,
            Self::Membership(e) => &e.conv_id,
            Self::Rename(e) => &e.conv_id,
            Self::Typing(e) => &e.conv_id,
            Self::Watermark(e) => &e.conv_id,
            Self::Call(e) => &e.conv_id,
            Self::ConversationUpdate(c) => &c.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Membership(_) => "membership",
            Self::Rename(_) => "rename",
            Self::Typing(_) => "typing",
            Self::Watermark(_) => "watermark",
            Self::Call(_) => "call",
            Self::ConversationUpdate(_) => "conversation_update",
        }
    }
}

pub type InboundSender = mpsc::UnboundedSender<InboundEvent>;
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundEvent>;

/// A message ready to be posted on the primary platform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub conv_id: String,
    pub segments: Vec<Segment>,
    /// Id returned by [`ProtocolClient::upload_image`].
    pub image_id: Option<String>,
    pub annotations: Vec<Annotation>,
    /// Context echoed back through the `CONTEXT` annotation.
    pub context: Map<String, Value>,
}

impl OutgoingMessage {
    pub fn new(conv_id: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            conv_id: conv_id.into(),
            segments,
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }
}

/// A session with the primary chat service.
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    /// Platform tag of the primary platform, e.g. `hangouts`.
    fn platform(&self) -> &str;

    /// The bot's own account.
    fn self_user(&self) -> User;

    /// Runs the session until it ends, delivering events into `inbound`.
    async fn connect(&self, inbound: InboundSender) -> ClientResult<()>;

    async fn disconnect(&self) -> ClientResult<()>;

    async fn send_message(&self, message: OutgoingMessage) -> ClientResult<()>;

    /// Uploads image bytes, returning the platform's image id.
    async fn upload_image(&self, bytes: Arc<Vec<u8>>, filename: &str) -> ClientResult<String>;

    /// Authoritative user records for `ids`.
    async fn get_users(&self, ids: &[String]) -> ClientResult<Vec<User>>;

    async fn get_conversations(&self) -> ClientResult<Vec<Conversation>>;

    /// Creates (or finds) the bot's one-to-one with `user_id`.
    async fn create_one_to_one(&self, user_id: &str) -> ClientResult<String>;

    async fn kick(&self, conv_id: &str, user_id: &str) -> ClientResult<()>;
}

/// Builds a fresh client for every connect attempt.
pub type ClientFactory = Arc<dyn Fn() -> Arc<dyn ProtocolClient> + Send + Sync>;
