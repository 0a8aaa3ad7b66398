//! Listener abstraction and the TCP implementation.
//!
//! # Responsibilities
//! - Accept incoming connections as type-erased `BoxedConn`s
//! - Report the peer address when the transport has one
//! - Support closing from another task so a serve loop can return cleanly

use std::io;
use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::conn::BoxedConn;

/// An accepted connection.
pub struct Accepted {
    pub conn: BoxedConn,
    /// Remote address, if the transport has one.
    pub peer: Option<SocketAddr>,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted").field("peer", &self.peer).finish()
    }
}

/// Source of incoming connections.
pub trait Listener: Send + Sync {
    /// Waits for the next connection. `Ok(None)` means the listener was
    /// closed and no more connections will arrive.
    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Accepted>>>;

    /// Stops accepting. Pending and future `accept` calls return `Ok(None)`.
    fn close(&self);

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// TCP listener.
#[derive(Debug)]
pub struct TcpAcceptor {
    inner: TcpListener,
    closed: CancellationToken,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(address = %listener.local_addr()?, "Listener bound");
        Ok(Self::from_listener(listener))
    }

    pub fn from_listener(inner: TcpListener) -> Self {
        Self {
            inner,
            closed: CancellationToken::new(),
        }
    }
}

impl Listener for TcpAcceptor {
    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Accepted>>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Ok(None);
            }
            tokio::select! {
                _ = self.closed.cancelled() => Ok(None),
                res = self.inner.accept() => {
                    let (stream, peer) = res?;
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!(peer_addr = %peer, error = %err, "Failed to set TCP_NODELAY");
                    }
                    tracing::trace!(peer_addr = %peer, "Connection accepted");
                    Ok(Some(Accepted { conn: Box::new(stream), peer: Some(peer) }))
                }
            }
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr().ok()
    }
}

/// Accept errors worth retrying after a pause (resource exhaustion, aborted
/// handshakes). Anything else ends the serve loop.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(code) if is_fd_exhaustion(code))
}

fn is_fd_exhaustion(code: i32) -> bool {
    // EMFILE / ENFILE / ENOBUFS / ENOMEM on Linux and macOS
    matches!(code, 23 | 24 | 105 | 12 | 55)
}
