//! # Syncbot Core
//!
//! The data model and primitives of the syncbot relay.
//!
//! ## Contents
//!
//! - **Formatting**: markdown / HTML ⇄ [`Segment`] lists ([`format`])
//! - **Persistence**: debounced, backed-up JSON documents ([`JsonStore`])
//! - **Caching**: TTL caches with optional persistence ([`Cache`])
//! - **Sending**: ordered per-destination queues with soft stop ([`QueueCache`])
//! - **Identities**: [`User`], [`SyncUser`], [`Conversation`]
//! - **Events**: chat events from the primary platform and per-destination
//!   [`SyncEvent`]s
//! - **Media**: lazily fetched, per-destination rendered [`SyncImage`]s
//! - **Protocol seam**: the [`ProtocolClient`] trait
//!
//! Nothing in this crate knows about plugins or the bot context; those live
//! in `syncbot-framework`.
//!
//! ```text
//! ProtocolClient ─► InboundEvent ─► (framework) SyncRouter ─► SyncEvent
//!                                                    │
//!                              QueueCache ◄── sending bucket
//! ```

pub mod cache;
pub mod client;
pub mod conversation;
pub mod error;
pub mod event;
pub mod format;
pub mod image;
pub mod queue;
pub mod store;
pub mod user;
pub mod worker;

pub use cache::Cache;
pub use client::{
    ClientFactory, InboundEvent, InboundReceiver, InboundSender, OutgoingMessage, ProtocolClient,
};
pub use conversation::{
    ConvStatus, ConvType, Conversation, is_primary_conv, platform_of, target_tag,
};
pub use error::{
    BoxError, ClientError, ClientResult, ImageError, ImageResult, QueueError, QueueResult,
    StoreError, StoreResult,
};
pub use event::{
    Annotation, CallEvent, ChatEvent, EventContext, Extensions, MembershipChange, MembershipEvent,
    MessageBody, RenameEvent, SyncEvent, SyncEventMembership, SyncReply, TargetSet, TypingEvent,
    TypingStatus, WatermarkEvent,
};
pub use format::{FormatStyle, Markup, Segment, TextSegment};
#[cfg(feature = "http-fetch")]
pub use image::HttpFetcher;
pub use image::{
    ImageData, ImagePipeline, ImageType, MediaFetcher, MediaRequest, MovieBackend, SyncImage,
};
pub use queue::{BlockingSink, FnSink, Queue, QueueCache, QueueControl, QueueSink};
pub use store::{JsonStore, StoreOptions};
pub use user::{SyncUser, User};
pub use worker::WorkerPool;
