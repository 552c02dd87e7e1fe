//! Named handler buckets.
//!
//! A [`Pluggable`] is an ordered list of handlers for one event phase. Every
//! handler is stored as a type-erased tower service, so closures, service
//! structs and layered stacks all register the same way:
//!
//! ```text
//! register(plugin, priority, f) ──► service_fn(f) ──► BoxCloneSyncService
//!
//! run(arg):
//!   priority 10:  [h1, h2]   ── join_all ──►  outcomes
//!   priority 50:  [h3]       ── oneshot  ──►  outcome
//!   ...                        (stops on SkipBucket / SuppressEvent)
//! ```
//!
//! Handlers of the same priority run concurrently; groups run in ascending
//! priority order. Registration order breaks ties for result ordering.
//!
//! # Example
//!
//! ```rust,ignore
//! bot.hub().message.register(Some("echo"), 50, |call: Call<SyncEvent>| async move {
//!     if call.event.text().is_empty() {
//!         return Ok(Outcome::SkipHandler);
//!     }
//!     Ok(Outcome::Continue(()))
//! });
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use parking_lot::RwLock;
use tower::util::BoxCloneSyncService;
use tower::{ServiceExt, service_fn};
use tracing::{Instrument, debug, error, trace_span};

use syncbot_core::event::{
    CallEvent, ChatEvent, RenameEvent, SyncEvent, SyncEventMembership, TypingEvent, WatermarkEvent,
};
use syncbot_core::user::SyncUser;

use crate::bot::Bot;
use crate::error::{BoxError, SuppressAllHandlers, SuppressEventHandling, SuppressHandler};
use crate::profilesync::ProfileSyncEvent;
use crate::sync::{KickOutcome, KickRequest, SyncConvQuery};

/// Priority used when a plugin has no preference.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Priority of handlers that must run after everything else in a bucket.
pub const TAIL_PRIORITY: i32 = i32::MAX;

/// How a handler wants the bucket to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<R = ()> {
    /// Handled; the value is collected into the run report.
    Continue(R),
    /// Nothing to contribute; the rest of the bucket runs.
    SkipHandler,
    /// Stop the remaining priority groups of this bucket.
    SkipBucket,
    /// Stop the bucket and drop the event for the current destination.
    SuppressEvent,
}

impl Outcome<()> {
    pub fn done() -> Self {
        Self::Continue(())
    }
}

/// What a bucket run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport<R> {
    /// Values of every handler that returned [`Outcome::Continue`].
    pub results: Vec<R>,
    /// A handler asked for the event to be dropped.
    pub suppressed: bool,
}

impl<R> Default for RunReport<R> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            suppressed: false,
        }
    }
}

/// Identifies one registration, for targeted removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type BoxedHandler<A, R> = BoxCloneSyncService<A, Outcome<R>, BoxError>;

struct HandlerEntry<A, R> {
    id: HandlerId,
    plugin: Option<String>,
    priority: i32,
    service: BoxedHandler<A, R>,
}

/// An ordered, named list of handlers.
pub struct Pluggable<A, R = ()> {
    name: &'static str,
    handlers: RwLock<Vec<HandlerEntry<A, R>>>,
    next_id: AtomicU64,
}

impl<A, R> Pluggable<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Registers an async handler.
    pub fn register<F, Fut>(&self, plugin: Option<&str>, priority: i32, f: F) -> HandlerId
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome<R>, BoxError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_service(
            plugin,
            priority,
            BoxCloneSyncService::new(service_fn(move |arg: A| f(arg))),
        )
    }

    /// Registers an already boxed service.
    pub fn register_service(
        &self,
        plugin: Option<&str>,
        priority: i32,
        service: BoxedHandler<A, R>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write();
        handlers.push(HandlerEntry {
            id,
            plugin: plugin.map(str::to_string),
            priority,
            service,
        });
        // Stable: equal priorities keep registration order.
        handlers.sort_by_key(|h| h.priority);
        debug!(bucket = self.name, plugin = ?plugin, priority, "Handler registered");
        id
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    /// Removes every handler registered by `plugin`; returns how many.
    pub fn deregister_plugin(&self, plugin: &str) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.plugin.as_deref() != Some(plugin));
        before - handlers.len()
    }

    /// Runs every handler with a clone of `arg`.
    pub async fn run(&self, arg: A) -> RunReport<R> {
        let groups = self.snapshot_groups();
        let mut report = RunReport::default();
        if groups.is_empty() {
            return report;
        }

        let span = trace_span!("pluggable", bucket = self.name);
        async {
            for group in groups {
                let calls = group.into_iter().map(|(plugin, service)| {
                    let arg = arg.clone();
                    async move { (plugin, service.oneshot(arg).await) }
                });
                let mut stop = false;
                for (plugin, result) in join_all(calls).await {
                    match result {
                        Ok(Outcome::Continue(value)) => report.results.push(value),
                        Ok(Outcome::SkipHandler) => {}
                        Ok(Outcome::SkipBucket) => stop = true,
                        Ok(Outcome::SuppressEvent) => {
                            report.suppressed = true;
                            stop = true;
                        }
                        Err(e) if e.is::<SuppressHandler>() => {}
                        Err(e) if e.is::<SuppressAllHandlers>() => stop = true,
                        Err(e) if e.is::<SuppressEventHandling>() => {
                            report.suppressed = true;
                            stop = true;
                        }
                        Err(e) => {
                            error!(
                                bucket = self.name,
                                plugin = plugin.as_deref().unwrap_or("-"),
                                error = %e,
                                "Handler returned an error"
                            );
                        }
                    }
                }
                if stop {
                    debug!(bucket = self.name, suppressed = report.suppressed, "Bucket stopped early");
                    break;
                }
            }
        }
        .instrument(span)
        .await;
        report
    }

    fn snapshot_groups(&self) -> Vec<Vec<(Option<String>, BoxedHandler<A, R>)>> {
        let handlers = self.handlers.read();
        let mut groups: Vec<Vec<(Option<String>, BoxedHandler<A, R>)>> = Vec::new();
        let mut current: Option<i32> = None;
        for h in handlers.iter() {
            if current != Some(h.priority) {
                groups.push(Vec::new());
                current = Some(h.priority);
            }
            if let Some(group) = groups.last_mut() {
                group.push((h.plugin.clone(), h.service.clone()));
            }
        }
        groups
    }
}

// =============================================================================
// HandlerHub
// =============================================================================

/// Argument of every bot-level bucket: the bot plus the shared event.
pub struct Call<E> {
    pub bot: Bot,
    pub event: Arc<E>,
}

impl<E> Call<E> {
    pub fn new(bot: Bot, event: Arc<E>) -> Self {
        Self { bot, event }
    }
}

impl<E> Clone for Call<E> {
    fn clone(&self) -> Self {
        Self {
            bot: self.bot.clone(),
            event: Arc::clone(&self.event),
        }
    }
}

/// Every bucket the bot dispatches into.
pub struct HandlerHub {
    /// Relayed message, per destination, from users other than the bot.
    pub message: Pluggable<Call<SyncEvent>>,
    /// Relayed message, per destination.
    pub allmessages: Pluggable<Call<SyncEvent>>,
    pub message_once: Pluggable<Call<SyncEvent>>,
    pub allmessages_once: Pluggable<Call<SyncEvent>>,
    /// Emit a relayed message on the destination's platform.
    pub sending: Pluggable<Call<SyncEvent>>,
    pub membership: Pluggable<Call<SyncEventMembership>>,
    pub membership_once: Pluggable<Call<SyncEventMembership>>,
    pub rename: Pluggable<Call<RenameEvent>>,
    pub typing: Pluggable<Call<TypingEvent>>,
    pub watermark: Pluggable<Call<WatermarkEvent>>,
    pub call: Pluggable<Call<CallEvent>>,
    /// Peers of a conversation.
    pub sync_conv: Pluggable<Call<SyncConvQuery>, Vec<String>>,
    /// Users present in a non-primary conversation.
    pub sync_conv_user: Pluggable<Call<SyncConvQuery>, Vec<SyncUser>>,
    pub sync_user_kick: Pluggable<Call<KickRequest>, KickOutcome>,
    pub sync_profile: Pluggable<Call<ProfileSyncEvent>>,
    /// Messages arriving on the primary platform.
    pub primary_message: Pluggable<Call<ChatEvent>>,
    pub primary_allmessages: Pluggable<Call<ChatEvent>>,
}

impl Default for HandlerHub {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerHub {
    pub fn new() -> Self {
        Self {
            message: Pluggable::new("message"),
            allmessages: Pluggable::new("allmessages"),
            message_once: Pluggable::new("message_once"),
            allmessages_once: Pluggable::new("allmessages_once"),
            sending: Pluggable::new("sending"),
            membership: Pluggable::new("membership"),
            membership_once: Pluggable::new("membership_once"),
            rename: Pluggable::new("rename"),
            typing: Pluggable::new("typing"),
            watermark: Pluggable::new("watermark"),
            call: Pluggable::new("call"),
            sync_conv: Pluggable::new("sync_conv"),
            sync_conv_user: Pluggable::new("sync_conv_user"),
            sync_user_kick: Pluggable::new("sync_user_kick"),
            sync_profile: Pluggable::new("sync_profile"),
            primary_message: Pluggable::new("primary_message"),
            primary_allmessages: Pluggable::new("primary_allmessages"),
        }
    }

    /// Removes every handler `plugin` registered, in all buckets.
    pub fn deregister_plugin(&self, plugin: &str) -> usize {
        self.message.deregister_plugin(plugin)
            + self.allmessages.deregister_plugin(plugin)
            + self.message_once.deregister_plugin(plugin)
            + self.allmessages_once.deregister_plugin(plugin)
            + self.sending.deregister_plugin(plugin)
            + self.membership.deregister_plugin(plugin)
            + self.membership_once.deregister_plugin(plugin)
            + self.rename.deregister_plugin(plugin)
            + self.typing.deregister_plugin(plugin)
            + self.watermark.deregister_plugin(plugin)
            + self.call.deregister_plugin(plugin)
            + self.sync_conv.deregister_plugin(plugin)
            + self.sync_conv_user.deregister_plugin(plugin)
            + self.sync_user_kick.deregister_plugin(plugin)
            + self.sync_profile.deregister_plugin(plugin)
            + self.primary_message.deregister_plugin(plugin)
            + self.primary_allmessages.deregister_plugin(plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder() -> (Arc<parking_lot::Mutex<Vec<&'static str>>>, Pluggable<u32, u32>) {
        (Arc::new(parking_lot::Mutex::new(Vec::new())), Pluggable::new("test"))
    }

    #[tokio::test]
    async fn runs_in_priority_order() {
        let (seen, bucket) = recorder();
        for (name, priority) in [("late", 90), ("early", 10), ("middle", 50)] {
            let seen = Arc::clone(&seen);
            bucket.register(None, priority, move |x: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(name);
                    Ok(Outcome::Continue(x + 1))
                }
            });
        }
        let report = bucket.run(1).await;
        assert_eq!(*seen.lock(), vec!["early", "middle", "late"]);
        assert_eq!(report.results, vec![2, 2, 2]);
        assert!(!report.suppressed);
    }

    #[tokio::test(start_paused = true)]
    async fn same_priority_runs_concurrently() {
        let (seen, bucket) = recorder();
        for (name, delay) in [("slow", 20), ("fast", 5)] {
            let seen = Arc::clone(&seen);
            bucket.register(None, DEFAULT_PRIORITY, move |_: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    seen.lock().push(name);
                    Ok(Outcome::SkipHandler)
                }
            });
        }
        bucket.run(0).await;
        assert_eq!(*seen.lock(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn flow_control_outcomes() {
        let bucket: Pluggable<u32, u32> = Pluggable::new("flow");
        bucket.register(None, 10, |_| async { Ok(Outcome::SkipHandler) });
        bucket.register(None, 20, |_| async { Err::<Outcome<u32>, _>(SuppressHandler.into()) });
        bucket.register(None, 30, |x| async move { Ok(Outcome::Continue(x)) });
        bucket.register(None, 40, |_| async { Ok(Outcome::SkipBucket) });
        bucket.register(None, 50, |_| async { Ok(Outcome::Continue(99)) });
        let report = bucket.run(7).await;
        assert_eq!(report.results, vec![7]);
        assert!(!report.suppressed);

        let bucket: Pluggable<u32, u32> = Pluggable::new("suppress");
        bucket.register(None, 10, |_| async { Err::<Outcome<u32>, _>(SuppressEventHandling.into()) });
        bucket.register(None, 20, |_| async { Ok(Outcome::Continue(1)) });
        let report = bucket.run(0).await;
        assert!(report.suppressed);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn errors_do_not_stop_siblings() {
        let bucket: Pluggable<u32, u32> = Pluggable::new("errors");
        bucket.register(Some("broken"), 10, |_| async { Err::<Outcome<u32>, _>("boom".into()) });
        bucket.register(Some("fine"), 20, |x| async move { Ok(Outcome::Continue(x)) });
        assert_eq!(bucket.run(3).await.results, vec![3]);
    }

    #[tokio::test]
    async fn deregister_by_plugin_and_id() {
        let bucket: Pluggable<u32, u32> = Pluggable::new("dereg");
        let id = bucket.register(Some("a"), 10, |_| async { Ok(Outcome::Continue(1)) });
        bucket.register(Some("b"), 10, |_| async { Ok(Outcome::Continue(2)) });
        bucket.register(Some("b"), 20, |_| async { Ok(Outcome::Continue(3)) });
        assert_eq!(bucket.deregister_plugin("b"), 2);
        assert!(bucket.remove(id));
        assert!(!bucket.remove(id));
        assert!(bucket.is_empty());
    }
}
