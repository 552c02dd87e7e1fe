//! Round-trip metadata through message annotations.
//!
//! The primary protocol has no extension fields, but it echoes annotations
//! back with the bot's own messages. Three reserved kinds carry an opaque
//! id; the payload itself never leaves the process:
//!
//! | Kind | Name | Payload |
//! |------|------|---------|
//! | 1025 | reprocessor | one-shot callback run on the echo |
//! | 1026 | passthru | JSON value exposed as `context["passthru"]` |
//! | 1027 | context | map merged into the echo's context |
//!
//! Payloads expire after [`ANNOTATION_TTL`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Map, Value};
use tracing::debug;

use syncbot_core::cache::Cache;
use syncbot_core::event::{Annotation, ChatEvent};

use crate::bot::Bot;

pub const REPROCESSOR: u32 = 1025;
pub const PASSTHRU: u32 = 1026;
pub const CONTEXT: u32 = 1027;

pub const ANNOTATION_TTL: Duration = Duration::from_secs(3600);

/// Context key the passthru payload lands under.
pub const PASSTHRU_KEY: &str = "passthru";

const TOKEN_LEN: usize = 16;

/// Callback invoked when a message carrying its token comes back.
pub type Reprocessor = Arc<dyn Fn(Bot, Arc<ChatEvent>, String) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct AnnotationRegistry {
    reprocessors: Cache<Reprocessor>,
    passthru: Cache<Value>,
    contexts: Cache<Map<String, Value>>,
}

impl Default for AnnotationRegistry {
    fn default() -> Self {
        Self::new(ANNOTATION_TTL)
    }
}

impl AnnotationRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            reprocessors: Cache::new("annotations.reprocessor", ttl, false),
            passthru: Cache::new("annotations.passthru", ttl, false),
            contexts: Cache::new("annotations.context", ttl, false),
        }
    }

    /// Registers `callback` and returns the annotation that triggers it.
    pub fn register_reprocessor(&self, callback: Reprocessor) -> Annotation {
        let id = new_token();
        self.reprocessors.add(id.clone(), callback);
        Annotation::new(REPROCESSOR, id)
    }

    pub fn attach_passthru(&self, value: Value) -> Annotation {
        let id = new_token();
        self.passthru.add(id.clone(), value);
        Annotation::new(PASSTHRU, id)
    }

    pub fn attach_context(&self, context: Map<String, Value>) -> Annotation {
        let id = new_token();
        self.contexts.add(id.clone(), context);
        Annotation::new(CONTEXT, id)
    }

    /// Consumes the reserved annotations of an echoed event.
    ///
    /// Context and passthru payloads are merged into `event.context`; the
    /// pending reprocessors are returned with their ids for the caller to run.
    pub fn process(&self, event: &ChatEvent) -> Vec<(String, Reprocessor)> {
        let mut callbacks = Vec::new();
        for annotation in &event.annotations {
            match annotation.kind {
                REPROCESSOR => match self.reprocessors.pop(&annotation.value) {
                    Some(cb) => callbacks.push((annotation.value.clone(), cb)),
                    None => debug!(id = %annotation.value, "Reprocessor expired or unknown"),
                },
                PASSTHRU => {
                    if let Some(value) = self.passthru.pop(&annotation.value) {
                        event.context.set(PASSTHRU_KEY, value);
                    }
                }
                CONTEXT => {
                    if let Some(context) = self.contexts.pop(&annotation.value) {
                        event.context.merge(context);
                    }
                }
                _ => {}
            }
        }
        callbacks
    }

    /// Drops expired payloads; returns how many.
    pub fn cleanup(&self) -> usize {
        self.reprocessors.cleanup() + self.passthru.cleanup() + self.contexts.cleanup()
    }
}

fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncbot_core::user::User;

    fn echo(annotations: Vec<Annotation>) -> ChatEvent {
        let mut event = ChatEvent::new("conv", User::new("bot", "Bot"), Vec::new());
        event.annotations = annotations;
        event
    }

    #[tokio::test]
    async fn context_and_passthru_are_merged_once() {
        let registry = AnnotationRegistry::default();
        let mut ctx = Map::new();
        ctx.insert("reprocessor".into(), json!("sync"));
        let a = registry.attach_context(ctx);
        let b = registry.attach_passthru(json!({"original": "hi"}));
        assert_eq!(a.kind, CONTEXT);

        let event = echo(vec![a.clone(), b.clone()]);
        assert!(registry.process(&event).is_empty());
        assert_eq!(event.context.get("reprocessor"), Some(json!("sync")));
        assert_eq!(event.context.get(PASSTHRU_KEY), Some(json!({"original": "hi"})));

        let again = echo(vec![a, b]);
        registry.process(&again);
        assert!(again.context.get("reprocessor").is_none());
    }

    #[tokio::test]
    async fn reprocessors_are_one_shot() {
        let registry = AnnotationRegistry::default();
        let annotation = registry.register_reprocessor(Arc::new(|_, _, _| Box::pin(async {})));
        let event = echo(vec![annotation.clone()]);
        let found = registry.process(&event);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, annotation.value);
        assert!(registry.process(&event).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn payloads_expire() {
        let registry = AnnotationRegistry::new(Duration::from_secs(1));
        let annotation = registry.attach_passthru(json!(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        let event = echo(vec![annotation]);
        registry.process(&event);
        assert!(event.context.get(PASSTHRU_KEY).is_none());
    }
}
