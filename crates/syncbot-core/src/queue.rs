//! Ordered per-destination sending queues with soft stop.
//!
//! # Architecture
//!
//! ```text
//! QueueCache (one per group)
//!   └── destination key ─► Queue ─ FIFO of (blocked_at_submit, item)
//!                                   │  drained by at most one task
//!                                   ▼
//!                               QueueSink::send
//!
//! QueueControl (shared by every group)
//!   global block, per-group blocks, pending counters
//! ```
//!
//! Items submitted while their group (or everything) is soft-stopped are
//! tagged blocked. When the drain reaches such an item it waits up to the
//! block retry delay for the block to lift and discards the item otherwise.
//!
//! # Example
//!
//! ```rust,ignore
//! let control = QueueControl::new(Duration::from_secs(1));
//! let queues = QueueCache::new("hangouts", control.clone(), Duration::from_secs(3600), |key| {
//!     Arc::new(FnSink::new(move |msg: String| async move { post(&msg).await }))
//! });
//! queues.schedule("conv-1", "hello".to_string());
//! control.global_stop(Duration::from_secs(5)).await?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::error::{BoxError, QueueError, QueueResult};
use crate::worker::WorkerPool;

/// Default wait for a soft stop to lift before blocked items are dropped.
pub const SENDING_BLOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Sinks
// =============================================================================

/// Final consumer of queued items.
#[async_trait]
pub trait QueueSink<A>: Send + Sync + 'static {
    async fn send(&self, item: A) -> Result<(), BoxError>;
}

/// Sink backed by an async closure.
pub struct FnSink<F, A> {
    f: F,
    _marker: PhantomData<fn(A)>,
}

impl<F, A> FnSink<F, A> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut,
    {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, A> QueueSink<A> for FnSink<F, A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send,
    A: Send + 'static,
{
    async fn send(&self, item: A) -> Result<(), BoxError> {
        (self.f)(item).await
    }
}

/// Sink whose body blocks; each call runs on the [`WorkerPool`].
pub struct BlockingSink<F, A> {
    f: Arc<F>,
    pool: WorkerPool,
    _marker: PhantomData<fn(A)>,
}

impl<F, A> BlockingSink<F, A> {
    pub fn new(pool: WorkerPool, f: F) -> Self
    where
        F: Fn(A) -> Result<(), BoxError>,
    {
        Self {
            f: Arc::new(f),
            pool,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, A> QueueSink<A> for BlockingSink<F, A>
where
    F: Fn(A) -> Result<(), BoxError> + Send + Sync + 'static,
    A: Send + 'static,
{
    async fn send(&self, item: A) -> Result<(), BoxError> {
        let f = Arc::clone(&self.f);
        self.pool.run(move || f(item)).await?
    }
}

// =============================================================================
// Control
// =============================================================================

#[derive(Debug, Default)]
struct ControlState {
    global: bool,
    groups: HashSet<String>,
    pending: HashMap<String, usize>,
}

/// Soft-stop state and pending counters shared by all queues.
#[derive(Debug)]
pub struct QueueControl {
    state: Mutex<ControlState>,
    released: Notify,
    drained: Notify,
    block_retry_delay: Duration,
}

impl Default for QueueControl {
    fn default() -> Self {
        Self::with_delay(SENDING_BLOCK_RETRY_DELAY)
    }
}

impl QueueControl {
    pub fn new(block_retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self::with_delay(block_retry_delay))
    }

    fn with_delay(block_retry_delay: Duration) -> Self {
        Self {
            state: Mutex::new(ControlState::default()),
            released: Notify::new(),
            drained: Notify::new(),
            block_retry_delay,
        }
    }

    pub fn is_blocked(&self, group: &str) -> bool {
        let state = self.state.lock();
        state.global || state.groups.contains(group)
    }

    /// Pending items in `group`, or in every group for `None`.
    pub fn pending(&self, group: Option<&str>) -> usize {
        let state = self.state.lock();
        match group {
            Some(group) => state.pending.get(group).copied().unwrap_or(0),
            None => state.pending.values().sum(),
        }
    }

    fn enqueued(&self, group: &str) {
        *self.state.lock().pending.entry(group.to_string()).or_default() += 1;
    }

    fn finished(&self, group: &str) {
        {
            let mut state = self.state.lock();
            if let Some(count) = state.pending.get_mut(group) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.pending.remove(group);
                }
            }
        }
        self.drained.notify_waiters();
    }

    /// Blocks `group` and waits up to `timeout` for its queues to drain.
    pub async fn local_stop(&self, group: &str, timeout: Duration) -> QueueResult<()> {
        self.state.lock().groups.insert(group.to_string());
        debug!(group, "Sending queues soft-stopped");
        self.wait_drained(Some(group), timeout).await
    }

    /// Blocks every group and waits up to `timeout` for all queues to drain.
    pub async fn global_stop(&self, timeout: Duration) -> QueueResult<()> {
        self.state.lock().global = true;
        debug!("All sending queues soft-stopped");
        self.wait_drained(None, timeout).await
    }

    /// Lifts the block on `group`, or every block for `None`.
    pub fn release_block(&self, group: Option<&str>) {
        {
            let mut state = self.state.lock();
            match group {
                Some(group) => {
                    state.groups.remove(group);
                }
                None => {
                    state.global = false;
                    state.groups.clear();
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Waits up to `timeout` until nothing is pending in `group` (or anywhere).
    pub async fn wait_drained(&self, group: Option<&str>, timeout: Duration) -> QueueResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending(group) == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::StopTimeout {
                    group: group.map(str::to_string),
                    pending: self.pending(group),
                });
            }
        }
    }

    /// Waits up to the block retry delay for `group` to be released.
    async fn wait_released(&self, group: &str) -> bool {
        let deadline = Instant::now() + self.block_retry_delay;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_blocked(group) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_blocked(group);
            }
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// FIFO of items for one destination.
pub struct Queue<A> {
    group: String,
    key: String,
    items: Mutex<VecDeque<(bool, A)>>,
    drain: tokio::sync::Mutex<()>,
    sink: Arc<dyn QueueSink<A>>,
    control: Arc<QueueControl>,
}

impl<A: Send + 'static> Queue<A> {
    pub fn new(
        group: impl Into<String>,
        key: impl Into<String>,
        sink: Arc<dyn QueueSink<A>>,
        control: Arc<QueueControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            group: group.into(),
            key: key.into(),
            items: Mutex::new(VecDeque::new()),
            drain: tokio::sync::Mutex::new(()),
            sink,
            control,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether items are waiting or a drain is still sending one.
    pub fn is_busy(&self) -> bool {
        !self.is_empty() || self.drain.try_lock().is_err()
    }

    /// Appends `item` and spawns a drain.
    pub fn schedule(self: &Arc<Self>, item: A) {
        let blocked = self.control.is_blocked(&self.group);
        self.items.lock().push_back((blocked, item));
        self.control.enqueued(&self.group);
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.drain().await });
    }

    async fn drain(&self) {
        let _guard = self.drain.lock().await;
        loop {
            let Some((blocked, item)) = self.items.lock().pop_front() else {
                break;
            };
            if blocked && !self.control.wait_released(&self.group).await {
                warn!(group = %self.group, key = %self.key, "Discarding item submitted during soft stop");
            } else if let Err(e) = self.sink.send(item).await {
                warn!(group = %self.group, key = %self.key, error = %e, "Sending queue sink failed");
            }
            self.control.finished(&self.group);
        }
    }
}

// =============================================================================
// QueueCache
// =============================================================================

type SinkFactory<A> = dyn Fn(&str) -> Arc<dyn QueueSink<A>> + Send + Sync;

/// Queues of one group, materialized per destination key on first use.
///
/// Idle queues expire after the TTL. A busy queue is never replaced, so
/// items for one key keep draining through a single FIFO.
pub struct QueueCache<A> {
    group: String,
    queues: Cache<Arc<Queue<A>>>,
    create: Mutex<()>,
    factory: Box<SinkFactory<A>>,
    control: Arc<QueueControl>,
}

impl<A: Send + 'static> QueueCache<A> {
    pub fn new<F>(group: impl Into<String>, control: Arc<QueueControl>, ttl: Duration, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn QueueSink<A>> + Send + Sync + 'static,
    {
        let group = group.into();
        Self {
            queues: Cache::new(format!("queue.{group}"), ttl, true),
            group,
            create: Mutex::new(()),
            factory: Box::new(factory),
            control,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn control(&self) -> &Arc<QueueControl> {
        &self.control
    }

    /// Returns the queue for `key`, creating it on miss.
    pub fn get(&self, key: &str) -> Arc<Queue<A>> {
        let _create = self.create.lock();
        if let Some(busy) = self.queues.get_ignore_timeout(key).filter(|q| q.is_busy()) {
            self.queues.add(key, Arc::clone(&busy));
            return busy;
        }
        if let Some(queue) = self.queues.get(key) {
            return queue;
        }
        let queue = Queue::new(&self.group, key, (self.factory)(key), Arc::clone(&self.control));
        self.queues.add(key, Arc::clone(&queue));
        queue
    }

    /// Number of materialized queues, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Spawns the task that drops idle expired queues.
    pub fn spawn_eviction(&self, token: CancellationToken) -> JoinHandle<()> {
        self.queues.spawn_eviction_unless(token, |queue| queue.is_busy())
    }

    pub fn schedule(&self, key: &str, item: A) {
        self.get(key).schedule(item);
    }

    pub async fn local_stop(&self, timeout: Duration) -> QueueResult<()> {
        self.control.local_stop(&self.group, timeout).await
    }

    pub fn release_block(&self) {
        self.control.release_block(Some(&self.group));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok};

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn QueueSink<String>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = FnSink::new(move |item: String| {
            let seen = Arc::clone(&sink_seen);
            async move {
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
                seen.lock().push(item);
                Ok(())
            }
        });
        (seen, Arc::new(sink))
    }

    #[tokio::test]
    async fn preserves_submission_order() {
        let control = Arc::new(QueueControl::default());
        let (seen, sink) = recorder();
        let queue = Queue::new("g", "dest", sink, Arc::clone(&control));
        queue.schedule("M1".to_string());
        queue.schedule("M2".to_string());
        queue.schedule("M3".to_string());
        control.global_stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(*seen.lock(), vec!["M1", "M2", "M3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_items_are_dropped_after_delay() {
        let control = QueueControl::new(Duration::from_secs(1));
        let (seen, sink) = recorder();
        let queue = Queue::new("g", "dest", sink, Arc::clone(&control));
        assert!(control.local_stop("g", Duration::from_secs(1)).await.is_ok());
        queue.schedule("late".to_string());
        control.local_stop("g", Duration::from_secs(5)).await.unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(control.pending(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_lets_blocked_items_through() {
        let control = QueueControl::new(Duration::from_secs(10));
        let (seen, sink) = recorder();
        let queue = Queue::new("g", "dest", sink, Arc::clone(&control));
        control.global_stop(Duration::ZERO).await.unwrap();
        queue.schedule("held".to_string());
        tokio::time::sleep(Duration::from_secs(2)).await;
        control.release_block(None);
        control.wait_drained(None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(*seen.lock(), vec!["held"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_times_out_on_slow_sink() {
        let control = Arc::new(QueueControl::default());
        let sink = FnSink::new(|_: u32| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let queue = Queue::new("g", "dest", Arc::new(sink), Arc::clone(&control));
        queue.schedule(1);
        let err = control.global_stop(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, QueueError::StopTimeout { group: None, pending: 1 }));
    }

    #[tokio::test]
    async fn sink_errors_do_not_stall_the_queue() {
        let control = Arc::new(QueueControl::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = BlockingSink::new(WorkerPool::new(2), move |n: u32| {
            if n == 1 {
                return Err("boom".into());
            }
            sink_seen.lock().push(n);
            Ok(())
        });
        let queue = Queue::new("g", "d", Arc::new(sink), Arc::clone(&control));
        queue.schedule(1);
        queue.schedule(2);
        control.wait_drained(None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[tokio::test]
    async fn cache_reuses_queue_per_key() {
        let control = Arc::new(QueueControl::default());
        let (seen, _) = recorder();
        let factory_seen = Arc::clone(&seen);
        let queues = QueueCache::new("g", Arc::clone(&control), Duration::from_secs(60), move |key| {
            let seen = Arc::clone(&factory_seen);
            let key = key.to_string();
            let sink: Arc<dyn QueueSink<String>> = Arc::new(FnSink::new(move |item: String| {
                let seen = Arc::clone(&seen);
                let tagged = format!("{key}:{item}");
                async move {
                    seen.lock().push(tagged);
                    Ok(())
                }
            }));
            sink
        });
        assert!(Arc::ptr_eq(&queues.get("a"), &queues.get("a")));
        queues.schedule("a", "1".to_string());
        queues.schedule("b", "2".to_string());
        control.wait_drained(Some("g"), Duration::from_secs(5)).await.unwrap();
        let mut got = seen.lock().clone();
        got.sort();
        assert_eq!(got, vec!["a:1", "b:2"]);
    }

    fn slow_queues(ttl: Duration, control: &Arc<QueueControl>) -> QueueCache<u32> {
        QueueCache::new("g", Arc::clone(control), ttl, |_key| {
            let sink: Arc<dyn QueueSink<u32>> = Arc::new(FnSink::new(|_: u32| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }));
            sink
        })
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_spares_busy_queues() {
        let control = Arc::new(QueueControl::default());
        let queues = slow_queues(Duration::from_secs(10), &control);
        let token = CancellationToken::new();
        let eviction = queues.spawn_eviction(token.clone());

        let first = queues.get("a");
        first.schedule(1);
        first.schedule(2);
        let mut drained = tokio_test::task::spawn(control.wait_drained(Some("g"), Duration::from_secs(120)));
        assert_pending!(drained.poll());

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(queues.len(), 1);
        assert!(first.is_busy());
        assert!(Arc::ptr_eq(&first, &queues.get("a")));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_ready_ok!(drained.poll());
        assert!(!first.is_busy());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(queues.is_empty());
        token.cancel();
        eviction.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_busy_queue_keeps_its_order() {
        let control = Arc::new(QueueControl::default());
        let queues = slow_queues(Duration::from_secs(5), &control);
        let first = queues.get("a");
        first.schedule(1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(Arc::ptr_eq(&first, &queues.get("a")));

        control.wait_drained(None, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!Arc::ptr_eq(&first, &queues.get("a")));
    }
}
