//! Connection identity and active-count tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for logs and request contexts
//! - Count live connections or workers against an optional limit
//! - Let a caller wait until the count drops to zero

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts live units of work (connections, worker slots).
///
/// Cloning shares the count.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a unit unconditionally.
    pub fn track(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.guard()
    }

    /// Records a unit only if fewer than `limit` are live.
    pub fn try_track(&self, limit: usize) -> Option<ConnectionGuard> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                return None;
            }
            match self
                .active
                .compare_exchange_weak(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Some(self.guard()),
                Err(actual) => current = actual,
            }
        }
    }

    fn guard(&self) -> ConnectionGuard {
        ConnectionGuard {
            active: Arc::clone(&self.active),
            drained: Arc::clone(&self.drained),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits until no unit is live.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the tracker's count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn try_track_respects_limit() {
        let tracker = ConnectionTracker::new();
        let first = tracker.try_track(2).unwrap();
        let _second = tracker.try_track(2).unwrap();
        assert!(tracker.try_track(2).is_none());
        drop(first);
        assert_eq!(tracker.active_count(), 1);
        assert!(tracker.try_track(2).is_some());
    }

    #[tokio::test]
    async fn wait_idle_returns_after_last_guard() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
