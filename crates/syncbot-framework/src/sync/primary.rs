//! Delivery into primary-platform conversations.
//!
//! Relayed messages are queued per conversation so that uploads and posts
//! for one destination complete in submission order.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use syncbot_core::cache::Cache;
use syncbot_core::client::{OutgoingMessage, ProtocolClient};
use syncbot_core::error::BoxError;
use syncbot_core::event::SyncEvent;
use syncbot_core::format::Segment;
use syncbot_core::image::ImageData;
use syncbot_core::queue::{FnSink, QueueCache, QueueControl, QueueSink};

use crate::annotations::AnnotationRegistry;

/// Context key marking a message the sync layer itself posted.
pub const SYNC_NO_REPEAT_KEY: &str = "syncroom_no_repeat";

/// How long uploaded image ids are reused for the same source URL.
pub const IMAGE_UPLOAD_TTL: Duration = Duration::from_secs(3600);

const QUEUE_TTL: Duration = Duration::from_secs(3600);

/// One post waiting in a primary conversation's queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: OutgoingMessage,
    pub image: Option<ImageData>,
    /// Upload cache key, normally the image's source URL.
    pub image_key: Option<String>,
}

impl QueuedMessage {
    /// The post for a relayed event.
    pub fn from_event(event: &SyncEvent, with_nickname: bool) -> Self {
        let segments = if event.from_bot {
            event.segments.clone()
        } else {
            event.labelled_segments(with_nickname)
        };
        let mut segments: Vec<Segment> = match &event.reply {
            Some(reply) => {
                let mut quoted = Vec::new();
                if let Some(user) = &reply.user {
                    quoted.push(Segment::text(format!("| {}: ", user.display_name(false))));
                } else {
                    quoted.push(Segment::text("| "));
                }
                quoted.extend(reply.segments.iter().cloned());
                quoted.push(Segment::LineBreak);
                quoted.extend(segments);
                quoted
            }
            None => segments,
        };
        if event.edited {
            segments.push(Segment::text(" (edited)"));
        }
        let mut context = event.context.snapshot();
        context.insert(SYNC_NO_REPEAT_KEY.to_string(), Value::Bool(true));
        let mut message = OutgoingMessage::new(event.conv_id.clone(), segments);
        message.context = context;
        Self {
            message,
            image: event.image_data.clone(),
            image_key: event.image.as_ref().and_then(|i| i.url()).map(str::to_string),
        }
    }
}

/// Per-conversation sending queues for the primary platform.
pub struct PrimaryQueue {
    queues: QueueCache<QueuedMessage>,
    uploads: Cache<String>,
}

impl PrimaryQueue {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        annotations: Arc<AnnotationRegistry>,
        control: Arc<QueueControl>,
    ) -> Self {
        let group = client.platform().to_string();
        let uploads: Cache<String> = Cache::new("image_upload", IMAGE_UPLOAD_TTL, true);
        let sink_uploads = uploads.clone();
        let queues = QueueCache::new(group, control, QUEUE_TTL, move |_key: &str| {
            let uploads = sink_uploads.clone();
            let client = Arc::clone(&client);
            let annotations = Arc::clone(&annotations);
            Arc::new(FnSink::new(move |item: QueuedMessage| {
                let client = Arc::clone(&client);
                let annotations = Arc::clone(&annotations);
                let uploads = uploads.clone();
                async move { post(client.as_ref(), &annotations, &uploads, item).await }
            })) as Arc<dyn QueueSink<QueuedMessage>>
        });
        Self { queues, uploads }
    }

    /// Starts evicting idle queues and stale upload ids.
    pub fn spawn_eviction(&self, token: CancellationToken) {
        self.queues.spawn_eviction(token.clone());
        self.uploads.spawn_eviction(token);
    }

    pub fn schedule(&self, item: QueuedMessage) {
        let key = item.message.conv_id.clone();
        self.queues.schedule(&key, item);
    }

    pub fn queues(&self) -> &QueueCache<QueuedMessage> {
        &self.queues
    }
}

async fn post(
    client: &dyn ProtocolClient,
    annotations: &AnnotationRegistry,
    uploads: &Cache<String>,
    item: QueuedMessage,
) -> Result<(), BoxError> {
    let QueuedMessage {
        mut message,
        image,
        image_key,
    } = item;
    if let Some(image) = image {
        let cached = image_key.as_deref().and_then(|k| uploads.get(k));
        let image_id = match cached {
            Some(id) => id,
            None => {
                let id = client.upload_image(Arc::clone(&image.bytes), &image.filename).await?;
                if let Some(key) = image_key {
                    uploads.add(key, id.clone());
                }
                id
            }
        };
        message.image_id = Some(image_id);
    }
    if !message.context.is_empty() {
        let context: Map<String, Value> = std::mem::take(&mut message.context);
        message.annotations.push(annotations.attach_context(context));
    }
    debug!(conv_id = %message.conv_id, has_image = message.image_id.is_some(), "Posting relayed message");
    client.send_message(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncbot_core::event::{EventContext, MessageBody, SyncReply, TargetSet};
    use syncbot_core::format::plain_text;
    use syncbot_core::user::SyncUser;

    fn event() -> SyncEvent {
        let mut event = SyncEvent::new(
            "telegram:1",
            "abc",
            "telegram:1",
            SyncUser::remote("telegram:1", "Bob", None),
            MessageBody::from("hi").into_segments(),
            TargetSet::new(),
            TargetSet::new(),
            EventContext::new(),
        );
        event.reply = Some(SyncReply::new(Some(SyncUser::remote("telegram:1", "Ann", None)), "earlier"));
        event
    }

    #[test]
    fn relayed_posts_are_labelled_and_flagged() {
        let item = QueuedMessage::from_event(&event(), false);
        let text = plain_text(&item.message.segments);
        assert!(text.starts_with("| Ann: earlier"));
        assert!(text.ends_with("Bob: hi"));
        assert_eq!(item.message.context.get(SYNC_NO_REPEAT_KEY), Some(&Value::Bool(true)));
        assert!(item.image.is_none());
    }

    #[test]
    fn bot_messages_are_not_labelled() {
        let mut e = event();
        e.reply = None;
        e.from_bot = true;
        let item = QueuedMessage::from_event(&e, false);
        assert_eq!(plain_text(&item.message.segments), "hi");
    }
}
