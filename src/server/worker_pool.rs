//! Bounded pool of long-lived connection-serving tasks.
//!
//! # Responsibilities
//! - Hand each accepted connection to an idle slot, or start a new slot
//!   while fewer than `max_workers` are alive
//! - Keep a handler panic confined to the connection that caused it
//! - Retire slots that stay idle for `max_idle`
//!
//! Idle slots are reused most-recently-parked first so that, under low load,
//! the oldest slots time out and the pool shrinks.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::net::{Accepted, ConnectionGuard, ConnectionTracker};
use crate::observability::logging::panic_message;
use crate::observability::metrics::record_workers;

use super::error::ServerError;

/// Serves one connection to completion.
pub type ConnHandler = Arc<dyn Fn(Accepted) -> BoxFuture<'static, Result<(), ServerError>> + Send + Sync>;

/// Boxes an async closure as a [`ConnHandler`].
pub fn conn_handler<F, Fut>(f: F) -> ConnHandler
where
    F: Fn(Accepted) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ServerError>> + Send + 'static,
{
    Arc::new(move |conn: Accepted| -> BoxFuture<'static, Result<(), ServerError>> { Box::pin(f(conn)) })
}

struct IdleSlot {
    id: u64,
    handoff: oneshot::Sender<Accepted>,
}

#[derive(Default)]
struct IdleState {
    slots: Vec<IdleSlot>,
    stopped: bool,
}

struct PoolInner {
    handler: ConnHandler,
    max_workers: usize,
    max_idle: Duration,
    log_all_errors: bool,
    idle: Mutex<IdleState>,
    workers: ConnectionTracker,
    next_slot_id: AtomicU64,
}

/// Caps concurrently served connections at `max_workers`.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(handler: ConnHandler, max_workers: usize, max_idle: Duration, log_all_errors: bool) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handler,
                max_workers: max_workers.max(1),
                max_idle,
                log_all_errors,
                idle: Mutex::new(IdleState::default()),
                workers: ConnectionTracker::new(),
                next_slot_id: AtomicU64::new(0),
            }),
        }
    }

    /// Hands `conn` to a slot. Gives the connection back when every slot is
    /// busy or the pool is stopped; the caller rejects it.
    pub fn submit(&self, mut conn: Accepted) -> Result<(), Accepted> {
        {
            let mut idle = self.inner.idle.lock();
            if idle.stopped {
                return Err(conn);
            }
            while let Some(slot) = idle.slots.pop() {
                match slot.handoff.send(conn) {
                    Ok(()) => return Ok(()),
                    Err(back) => conn = back,
                }
            }
        }

        let Some(guard) = self.inner.workers.try_track(self.inner.max_workers) else {
            return Err(conn);
        };
        record_workers(self.inner.workers.active_count());
        tokio::spawn(run_slot(Arc::clone(&self.inner), conn, guard));
        Ok(())
    }

    /// Slots currently alive, busy or idle.
    pub fn active_workers(&self) -> usize {
        self.inner.workers.active_count()
    }

    /// Slots parked waiting for a connection.
    pub fn idle_workers(&self) -> usize {
        self.inner.idle.lock().slots.len()
    }

    /// Stops accepting work. Idle slots retire now, busy ones after their
    /// current connection.
    pub fn stop(&self) {
        let parked = {
            let mut idle = self.inner.idle.lock();
            idle.stopped = true;
            std::mem::take(&mut idle.slots)
        };
        drop(parked);
    }

    /// Waits until every slot has retired.
    pub async fn wait_stopped(&self) {
        self.inner.workers.wait_idle().await;
    }
}

async fn run_slot(inner: Arc<PoolInner>, first: Accepted, _guard: ConnectionGuard) {
    let id = inner.next_slot_id.fetch_add(1, Ordering::Relaxed);
    let mut next = Some(first);
    while let Some(conn) = next.take() {
        inner.serve(conn).await;
        next = inner.park(id).await;
    }
    tracing::trace!(slot = id, "Worker slot retired");
    record_workers(inner.workers.active_count().saturating_sub(1));
}

impl PoolInner {
    async fn serve(&self, conn: Accepted) {
        let peer = conn.peer;
        let handler = Arc::clone(&self.handler);
        let run = async move { handler(conn).await };
        match std::panic::AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_disconnect_noise() && !self.log_all_errors => {
                tracing::debug!(peer_addr = ?peer, error = %err, "Connection ended");
            }
            Ok(Err(err)) => {
                tracing::warn!(peer_addr = ?peer, error = %err, "Error when serving connection");
            }
            Err(payload) => {
                tracing::error!(
                    peer_addr = ?peer,
                    panic = %panic_message(payload.as_ref()),
                    "Connection handler panicked"
                );
            }
        }
    }

    /// Waits for the next handoff. `None` retires the slot.
    async fn park(&self, id: u64) -> Option<Accepted> {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut idle = self.idle.lock();
            if idle.stopped {
                return None;
            }
            idle.slots.push(IdleSlot { id, handoff: tx });
        }

        match tokio::time::timeout(self.max_idle, &mut rx).await {
            Ok(handoff) => handoff.ok(),
            Err(_) => {
                {
                    let mut idle = self.idle.lock();
                    if let Some(pos) = idle.slots.iter().position(|slot| slot.id == id) {
                        idle.slots.remove(pos);
                        return None;
                    }
                }
                // Claimed by `submit` between the timeout and the lock.
                rx.await.ok()
            }
        }
    }
}
