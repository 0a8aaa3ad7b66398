//! Handing a connection over to user code.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::{BoxedConn, ConnectionId};
use crate::observability::logging::panic_message;

use super::ctx::HijackHandler;

/// A connection taken over by a hijack handler.
///
/// Bytes the server had already read past the last request are returned
/// first by reads.
pub struct HijackedConn {
    buffered: Bytes,
    inner: BoxedConn,
    peer: Option<SocketAddr>,
}

impl HijackedConn {
    pub(crate) fn new(buffered: Bytes, inner: BoxedConn, peer: Option<SocketAddr>) -> Self {
        Self { buffered, inner, peer }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Unread buffered bytes and the raw connection.
    pub fn into_parts(self) -> (Bytes, BoxedConn) {
        (self.buffered, self.inner)
    }
}

impl std::fmt::Debug for HijackedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackedConn")
            .field("buffered", &self.buffered.len())
            .field("peer", &self.peer)
            .finish()
    }
}

impl AsyncRead for HijackedConn {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.remaining());
            buf.put_slice(&self.buffered[..n]);
            self.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for HijackedConn {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Runs `handler` on its own task. The connection is closed when the
/// handler returns or panics.
pub(crate) fn spawn_hijack(handler: HijackHandler, conn: HijackedConn, conn_id: ConnectionId) {
    tokio::spawn(async move {
        let run = async move { handler(conn).await };
        match std::panic::AssertUnwindSafe(run).catch_unwind().await {
            Ok(()) => tracing::trace!(connection_id = %conn_id, "Hijack handler finished"),
            Err(payload) => {
                tracing::error!(
                    connection_id = %conn_id,
                    panic = %panic_message(payload.as_ref()),
                    "Hijack handler panicked"
                );
            }
        }
    });
}
