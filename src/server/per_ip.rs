//! Per-client-IP connection counting.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::BoxedConn;

/// Live connection counts keyed by client IP.
#[derive(Debug, Clone, Default)]
pub struct PerIpRegistry {
    counts: Arc<DashMap<IpAddr, usize>>,
}

impl PerIpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a connection from `ip` unless `limit` are already live.
    pub fn try_acquire(&self, ip: IpAddr, limit: usize) -> Option<PerIpGuard> {
        let mut count = self.counts.entry(ip).or_insert(0);
        if *count >= limit {
            return None;
        }
        *count += 1;
        Some(PerIpGuard {
            counts: Arc::clone(&self.counts),
            ip,
        })
    }

    pub fn count(&self, ip: IpAddr) -> usize {
        self.counts.get(&ip).map(|c| *c).unwrap_or(0)
    }
}

/// Releases one connection slot for its IP when dropped.
#[derive(Debug)]
pub struct PerIpGuard {
    counts: Arc<DashMap<IpAddr, usize>>,
    ip: IpAddr,
}

impl Drop for PerIpGuard {
    fn drop(&mut self) {
        self.counts.remove_if_mut(&self.ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

/// A connection that holds its per-IP slot until closed, including after a
/// hijack hands it to user code.
pub(crate) struct PerIpConn {
    inner: BoxedConn,
    _guard: PerIpGuard,
}

impl PerIpConn {
    pub(crate) fn new(inner: BoxedConn, guard: PerIpGuard) -> Self {
        Self { inner, _guard: guard }
    }
}

impl AsyncRead for PerIpConn {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PerIpConn {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
