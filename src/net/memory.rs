//! In-memory listener for tests and embedding.
//!
//! Each `dial` creates a `tokio::io::duplex` pair: one end is handed to the
//! caller, the other is queued for `accept`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::conn::BoxedConn;
use super::dial::{dial_fn, Dial};
use super::listener::{Accepted, Listener};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

struct Shared {
    tx: mpsc::UnboundedSender<(DuplexStream, Option<SocketAddr>)>,
    rx: Mutex<mpsc::UnboundedReceiver<(DuplexStream, Option<SocketAddr>)>>,
    closed: CancellationToken,
    pipe_capacity: usize,
}

/// A listener whose connections are in-process pipes.
///
/// Cloning yields another handle to the same listener.
#[derive(Clone)]
pub struct InMemoryListener {
    shared: Arc<Shared>,
}

impl Default for InMemoryListener {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryListener {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// `pipe_capacity` bounds the bytes buffered in each direction.
    pub fn with_capacity(pipe_capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                tx,
                rx: Mutex::new(rx),
                closed: CancellationToken::new(),
                pipe_capacity,
            }),
        }
    }

    /// Opens a connection with no peer address.
    pub fn dial(&self) -> io::Result<DuplexStream> {
        self.dial_from(None)
    }

    /// Opens a connection that the server sees as coming from `peer`.
    pub fn dial_from(&self, peer: Option<SocketAddr>) -> io::Result<DuplexStream> {
        if self.shared.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"));
        }
        let (client, server) = tokio::io::duplex(self.shared.pipe_capacity);
        self.shared
            .tx
            .send((server, peer))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        Ok(client)
    }

    /// A [`Dial`] that ignores the address and connects to this listener.
    pub fn dialer(&self) -> impl Dial {
        let listener = self.clone();
        dial_fn(move |_addr: String| {
            let conn = listener.dial().map(|c| Box::new(c) as BoxedConn);
            async move { conn }
        })
    }
}

impl Listener for InMemoryListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Option<Accepted>>> {
        Box::pin(async move {
            let mut rx = tokio::select! {
                _ = self.shared.closed.cancelled() => return Ok(None),
                rx = self.shared.rx.lock() => rx,
            };
            tokio::select! {
                _ = self.shared.closed.cancelled() => Ok(None),
                next = rx.recv() => Ok(next.map(|(conn, peer)| Accepted { conn: Box::new(conn), peer })),
            }
        })
    }

    fn close(&self) {
        self.shared.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_reaches_accept() {
        let listener = InMemoryListener::new();
        let mut client = listener.dial().unwrap();
        let mut accepted = listener.accept().await.unwrap().unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn closed_listener_refuses() {
        let listener = InMemoryListener::new();
        listener.close();
        assert!(listener.dial().is_err());
        assert!(listener.accept().await.unwrap().is_none());
    }
}
