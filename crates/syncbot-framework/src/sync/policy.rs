//! Per-destination image policy.

use tracing::warn;

use syncbot_core::event::{SyncEvent, SyncReply};
use syncbot_core::image::{ImagePipeline, ImageType};
use syncbot_core::store::JsonStore;

/// How images are relayed into one destination conversation.
///
/// Every field reads from the config with per-conversation overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePolicy {
    pub photos: bool,
    pub stickers: bool,
    pub gifs: bool,
    pub videos: bool,
    /// Longest side in pixels; 0 keeps the original size.
    pub max_size: u32,
    pub sticker_size: u32,
    /// Relay the image of an edited message again.
    pub edited_images: bool,
    pub reply_images: bool,
    pub reply_image_size: u32,
    pub video_as_gif: bool,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            photos: true,
            stickers: true,
            gifs: true,
            videos: true,
            max_size: 0,
            sticker_size: 256,
            edited_images: false,
            reply_images: true,
            reply_image_size: 256,
            video_as_gif: true,
        }
    }
}

impl ImagePolicy {
    pub fn for_conv(config: &JsonStore, conv_id: &str) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| config.get_conv_option_as::<bool>(conv_id, key).unwrap_or(default);
        let size = |key: &str, default: u32| config.get_conv_option_as::<u32>(conv_id, key).unwrap_or(default);
        Self {
            photos: flag("sync_photos", defaults.photos),
            stickers: flag("sync_stickers", defaults.stickers),
            gifs: flag("sync_gifs", defaults.gifs),
            videos: flag("sync_videos", defaults.videos),
            max_size: size("sync_max_image_size", defaults.max_size),
            sticker_size: size("sync_sticker_size", defaults.sticker_size),
            edited_images: flag("sync_edited_images", defaults.edited_images),
            reply_images: flag("sync_reply_images", defaults.reply_images),
            reply_image_size: size("sync_reply_image_size", defaults.reply_image_size),
            video_as_gif: flag("sync_video_as_gif", defaults.video_as_gif),
        }
    }

    pub fn allows(&self, kind: ImageType) -> bool {
        match kind {
            ImageType::Photo => self.photos,
            ImageType::Sticker => self.stickers,
            ImageType::Gif => self.gifs,
            ImageType::Video => self.videos,
        }
    }

    /// Pixel limit for `kind`; stickers use their own, smaller cap.
    pub fn limit_for(&self, kind: ImageType) -> u32 {
        match kind {
            ImageType::Sticker if self.max_size == 0 => self.sticker_size,
            ImageType::Sticker => self.sticker_size.min(self.max_size),
            _ => self.max_size,
        }
    }

    /// Renders the event's image (and reply image) for its destination.
    ///
    /// A disallowed or failing image is removed from the event.
    pub async fn apply(&self, pipeline: &ImagePipeline, event: &mut SyncEvent) {
        if let Some(image) = event.image.take() {
            if self.allows(image.kind) && (!event.edited || self.edited_images) {
                match image
                    .get_data(pipeline, self.limit_for(image.kind), self.video_as_gif)
                    .await
                {
                    Ok(data) => {
                        event.image_data = Some(data);
                        event.image = Some(image);
                    }
                    Err(e) => warn!(conv_id = %event.conv_id, error = %e, "Dropping image that failed to render"),
                }
            }
        }
        if let Some(reply) = event.reply.as_mut() {
            self.apply_reply(pipeline, reply).await;
        }
    }

    async fn apply_reply(&self, pipeline: &ImagePipeline, reply: &mut SyncReply) {
        let Some(image) = reply.image.take() else {
            return;
        };
        if !self.reply_images || !self.allows(image.kind) {
            return;
        }
        let limit = match self.max_size {
            0 => self.reply_image_size,
            max => self.reply_image_size.min(max),
        };
        match image.get_data(pipeline, limit, self.video_as_gif).await {
            Ok(data) => {
                reply.image_data = Some(data);
                reply.image = Some(image);
            }
            Err(e) => warn!(error = %e, "Dropping reply image that failed to render"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use syncbot_core::image::SyncImage;
    use syncbot_core::event::{EventContext, MessageBody, TargetSet};
    use syncbot_core::user::SyncUser;
    use syncbot_core::worker::WorkerPool;

    fn config() -> JsonStore {
        JsonStore::from_value(
            "config",
            json!({
                "sync_max_image_size": 1024,
                "conversations": {
                    "telegram:1": {"sync_stickers": false, "sync_max_image_size": 128}
                }
            }),
        )
    }

    #[test]
    fn reads_per_conversation_overrides() {
        let config = config();
        let global = ImagePolicy::for_conv(&config, "abc");
        assert!(global.stickers);
        assert_eq!(global.max_size, 1024);
        assert_eq!(global.limit_for(ImageType::Sticker), 256);

        let tg = ImagePolicy::for_conv(&config, "telegram:1");
        assert!(!tg.allows(ImageType::Sticker));
        assert_eq!(tg.limit_for(ImageType::Sticker), 128);
        assert_eq!(tg.limit_for(ImageType::Photo), 128);
    }

    fn event(edited: bool) -> SyncEvent {
        let mut event = SyncEvent::new(
            "telegram:1",
            "abc",
            "telegram:1",
            SyncUser::remote("telegram:1", "Bob", None),
            MessageBody::from("pic").into_segments(),
            TargetSet::new(),
            TargetSet::new(),
            EventContext::new(),
        );
        event.edited = edited;
        event.image = Some(Arc::new(SyncImage::from_bytes(ImageType::Sticker, vec![0; 4], "s.bin")));
        event
    }

    #[tokio::test]
    async fn disallowed_images_are_removed() {
        let pipeline = ImagePipeline::new(WorkerPool::new(1));
        let policy = ImagePolicy {
            stickers: false,
            ..ImagePolicy::default()
        };
        let mut e = event(false);
        policy.apply(&pipeline, &mut e).await;
        assert!(e.image.is_none());
        assert!(e.image_data.is_none());
    }

    #[tokio::test]
    async fn edited_images_need_opt_in() {
        let pipeline = ImagePipeline::new(WorkerPool::new(1));
        let mut e = event(true);
        ImagePolicy::default().apply(&pipeline, &mut e).await;
        assert!(e.image.is_none());
    }
}
