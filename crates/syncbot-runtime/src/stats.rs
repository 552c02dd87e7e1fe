//! Counters the runtime keeps for diagnostics.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use syncbot_framework::WeakBot;

/// Live counters of a [`SyncbotRuntime`](crate::SyncbotRuntime).
#[derive(Default)]
pub struct RuntimeStats {
    connect_attempts: AtomicU64,
    current_retry: AtomicU32,
    events: AtomicU64,
    active_plugins: AtomicUsize,
    session: Mutex<Option<WeakBot>>,
}

/// A point-in-time copy of [`RuntimeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connect_attempts: u64,
    pub current_retry: u32,
    /// Inbound events handled across all sessions.
    pub events: u64,
    pub active_plugins: usize,
    /// Messages waiting in the current session's sending queues.
    pub pending_sends: usize,
}

impl RuntimeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let pending_sends = self
            .session
            .lock()
            .as_ref()
            .and_then(WeakBot::upgrade)
            .map_or(0, |bot| bot.queue_control().pending(None));
        StatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            current_retry: self.current_retry.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            active_plugins: self.active_plugins.load(Ordering::Relaxed),
            pending_sends,
        }
    }

    pub fn current_retry(&self) -> u32 {
        self.current_retry.load(Ordering::Relaxed)
    }

    pub(crate) fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new retry count.
    pub(crate) fn retry(&self) -> u32 {
        self.current_retry.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_retry(&self) {
        self.current_retry.store(0, Ordering::Relaxed);
    }

    pub(crate) fn event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_started(&self, bot: WeakBot, active_plugins: usize) {
        *self.session.lock() = Some(bot);
        self.active_plugins.store(active_plugins, Ordering::Relaxed);
    }

    pub(crate) fn session_ended(&self) {
        *self.session.lock() = None;
        self.active_plugins.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for RuntimeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RuntimeStats").field(&self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_count_up_and_reset() {
        let stats = RuntimeStats::default();
        assert_eq!(stats.retry(), 1);
        assert_eq!(stats.retry(), 2);
        stats.reset_retry();
        assert_eq!(stats.current_retry(), 0);
        stats.connect_attempt();
        stats.event();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connect_attempts, 1);
        assert_eq!(snapshot.events, 1);
        assert_eq!(snapshot.pending_sends, 0);
    }
}
