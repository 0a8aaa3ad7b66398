//! Per-host connection pool.
//!
//! # Responsibilities
//! - Cap open connections (idle plus busy) at `max_conns`
//! - Hand out the most recently released idle connection first
//! - Close connections idle longer than `max_idle` from a background reaper
//!
//! # Design Decisions
//! - A `PooledConn` is always exactly one of: idle in the pool, or owned by
//!   one caller. Dropping it closes the socket and frees its slot, so an
//!   exchange abandoned mid-flight can never leak a count.
//! - The lock is held only for O(1) bookkeeping; dialing and closing happen
//!   outside it.
//! - The idle stack is ordered by release time, so the reaper only scans a
//!   prefix.
//! - The reaper runs while the pool has any connection and stops itself
//!   when the count reaches zero.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::net::{BoxedConn, Deadlined, HostDialer};
use crate::observability::metrics;

use super::ClientError;

#[derive(Default)]
struct PoolState {
    /// Open connections, idle and busy, plus dials in progress.
    count: usize,
    /// Oldest release first.
    idle: Vec<PooledConn>,
    reaper_running: bool,
}

struct PoolInner {
    dialer: HostDialer,
    max_conns: usize,
    max_idle: Duration,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(1);
    }
}

/// A connection checked out of, or idle in, a [`ConnPool`].
pub struct PooledConn {
    stream: Deadlined<BoxedConn>,
    created: Instant,
    last_use: Instant,
    pool: Weak<PoolInner>,
}

impl PooledConn {
    pub fn stream(&mut self) -> &mut Deadlined<BoxedConn> {
        &mut self.stream
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_use(&self) -> Instant {
        self.last_use
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release_slot();
        }
    }
}

/// Undoes a slot reservation if the dial fails or is cancelled.
struct Reservation<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

/// Bounded pool of keep-alive connections to one logical host.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("addr", &self.inner.dialer.label())
            .field("max_conns", &self.inner.max_conns)
            .field("open", &self.open_conns())
            .finish()
    }
}

impl ConnPool {
    pub fn new(dialer: HostDialer, max_conns: usize, max_idle: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                dialer,
                max_conns,
                max_idle,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn dialer(&self) -> &HostDialer {
        &self.inner.dialer
    }

    /// Open connections, idle and busy.
    pub fn open_conns(&self) -> usize {
        self.inner.state.lock().count
    }

    pub fn idle_conns(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Takes an idle connection or dials a new one.
    ///
    /// Fails with [`ClientError::PoolExhausted`] when no connection is idle
    /// and `max_conns` are open.
    pub async fn acquire(&self) -> Result<PooledConn, ClientError> {
        let start_reaper = {
            let mut state = self.inner.state.lock();
            if let Some(conn) = state.idle.pop() {
                return Ok(conn);
            }
            if state.count >= self.inner.max_conns {
                drop(state);
                metrics::record_pool_exhausted();
                return Err(ClientError::PoolExhausted);
            }
            state.count += 1;
            !std::mem::replace(&mut state.reaper_running, true)
        };
        if start_reaper {
            tokio::spawn(reap_idle(Arc::downgrade(&self.inner), self.inner.max_idle));
        }

        let mut reservation = Reservation {
            pool: &self.inner,
            armed: true,
        };
        let stream = self.inner.dialer.dial().await.map_err(ClientError::from_dial)?;
        reservation.armed = false;

        let now = Instant::now();
        tracing::debug!(addr = %self.inner.dialer.label(), "Dialed new connection");
        Ok(PooledConn {
            stream: Deadlined::new(stream),
            created: now,
            last_use: now,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Returns a healthy connection for reuse.
    pub fn release(&self, mut conn: PooledConn) {
        conn.last_use = Instant::now();
        conn.stream.clear_deadlines();
        self.inner.state.lock().idle.push(conn);
    }
}

/// Periodically closes connections idle longer than `max_idle`.
async fn reap_idle(pool: Weak<PoolInner>, max_idle: Duration) {
    let mut expired = Vec::new();
    loop {
        tokio::time::sleep(max_idle).await;
        let Some(inner) = pool.upgrade() else { return };

        let now = Instant::now();
        let must_stop = {
            let mut state = inner.state.lock();
            let stale = state
                .idle
                .iter()
                .take_while(|conn| now.saturating_duration_since(conn.last_use) > max_idle)
                .count();
            expired.extend(state.idle.drain(..stale));
            let must_stop = state.count == stale;
            if must_stop {
                state.reaper_running = false;
            }
            must_stop
        };

        if !expired.is_empty() {
            tracing::debug!(addr = %inner.dialer.label(), closed = expired.len(), "Closed idle connections");
            for _ in 0..expired.len() {
                metrics::record_conn_closed("idle");
            }
            // dropping closes the sockets and frees the slots
            expired.clear();
        }
        if must_stop {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dial_fn;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(max_conns: usize, max_idle: Duration) -> (ConnPool, Arc<AtomicUsize>) {
        let dials = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dials);
        let dial = dial_fn(move |_addr: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let (conn, _peer) = tokio::io::duplex(64);
                Ok(Box::new(conn) as BoxedConn)
            }
        });
        let dialer = HostDialer::new("test:80", 80, Some(Arc::new(dial)), Duration::from_secs(1));
        (ConnPool::new(dialer, max_conns, max_idle), dials)
    }

    #[tokio::test]
    async fn reuses_most_recent_idle_connection() {
        let (pool, dials) = counting_pool(4, Duration::from_secs(10));
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        let second_created = second.created();
        pool.release(first);
        pool.release(second);
        let again = pool.acquire().await.unwrap();
        assert_eq!(again.created(), second_created);
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_conns(), 2);
        assert_eq!(pool.idle_conns(), 1);
    }

    #[tokio::test]
    async fn never_exceeds_max_conns() {
        let (pool, _dials) = counting_pool(2, Duration::from_secs(10));
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(ClientError::PoolExhausted)));
        drop(a);
        assert_eq!(pool.open_conns(), 1);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn failed_dial_frees_slot() {
        let dial = dial_fn(|_addr: String| async move {
            Err::<BoxedConn, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        });
        let dialer = HostDialer::new("down:80", 80, Some(Arc::new(dial)), Duration::from_secs(1));
        let pool = ConnPool::new(dialer, 1, Duration::from_secs(10));
        assert!(matches!(pool.acquire().await, Err(ClientError::Dial(_))));
        assert_eq!(pool.open_conns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_closes_idle_connections_and_stops() {
        let (pool, _dials) = counting_pool(4, Duration::from_millis(100));
        let conn = pool.acquire().await.unwrap();
        pool.release(conn);
        assert_eq!(pool.open_conns(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(pool.open_conns(), 0);
        assert_eq!(pool.idle_conns(), 0);
        assert!(!pool.inner.state.lock().reaper_running);

        // a new connection restarts the reaper
        let conn = pool.acquire().await.unwrap();
        pool.release(conn);
        assert!(pool.inner.state.lock().reaper_running);
    }
}
