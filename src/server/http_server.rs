//! Server entry points and the accept loop.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::FutureExt;
use http::{HeaderValue, StatusCode};
use tokio::io::AsyncWriteExt;

use crate::codec::Response;
use crate::config::ServerConfig;
use crate::net::listener::is_transient_accept_error;
use crate::net::{Accepted, BoxedConn, BufferPool, ConnectionTracker, Listener};
use crate::observability::logging::{panic_message, ErrorThrottle};
use crate::observability::metrics::record_connection_rejected;

use super::error::ServerError;
use super::handler::RequestHandler;
use super::per_ip::{PerIpConn, PerIpRegistry};
use super::serve::serve_connection;
use super::worker_pool::{conn_handler, WorkerPool};

/// Buffers retained per direction for reuse across connections.
const RETAINED_BUFFERS: usize = 1024;

/// Pause after a transient accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pause after rejecting a connection because every worker is busy.
const OVERLOAD_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on writing a rejection response to a connection.
const FAST_ERROR_TIMEOUT: Duration = Duration::from_secs(1);

const PER_IP_LIMIT_MESSAGE: &str = "The number of connections from your ip exceeds max_conns_per_ip";
const CONCURRENCY_LIMIT_MESSAGE: &str =
    "The connection cannot be served because the server concurrency limit is exceeded";

/// State shared by the accept loop and every served connection.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<dyn RequestHandler>,
    pub(crate) read_buffers: BufferPool,
    pub(crate) write_buffers: BufferPool,
    pub(crate) server_name: Option<HeaderValue>,
    per_ip: PerIpRegistry,
    open: ConnectionTracker,
}

impl ServerShared {
    /// Wraps the connection so it holds a per-IP slot for its lifetime.
    /// Gives the connection back when its IP is over the limit.
    fn limit_per_ip(&self, accepted: Accepted) -> Result<Accepted, Accepted> {
        let limit = self.config.max_conns_per_ip;
        let Some(ip) = accepted.peer.map(|peer| peer.ip()) else {
            return Ok(accepted);
        };
        if limit == 0 {
            return Ok(accepted);
        }
        match self.per_ip.try_acquire(ip, limit) {
            Some(guard) => Ok(Accepted {
                conn: Box::new(PerIpConn::new(accepted.conn, guard)),
                peer: accepted.peer,
            }),
            None => Err(accepted),
        }
    }

    async fn serve_tracked(&self, accepted: Accepted) -> Result<(), ServerError> {
        let _open = self.open.track();
        serve_connection(self, accepted.conn, accepted.peer).await
    }

    /// Writes a short error response and closes the connection.
    async fn reject(&self, mut conn: BoxedConn, status: StatusCode, msg: &'static str) {
        let mut resp = Response::text(status, msg);
        resp.set_connection_close();
        let mut buf = BytesMut::new();
        resp.write_to(&mut buf, self.server_name.as_ref());
        let write = async {
            conn.write_all(&buf).await?;
            conn.shutdown().await
        };
        if let Ok(Err(err)) = tokio::time::timeout(FAST_ERROR_TIMEOUT, write).await {
            tracing::trace!(error = %err, "Failed to write rejection response");
        }
    }
}

/// HTTP/1.x server.
///
/// Cloning is cheap; clones share limits and counters.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.shared.config.name)
            .field("concurrency", &self.concurrency())
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig, handler: impl RequestHandler) -> Self {
        let server_name = if config.name.is_empty() {
            None
        } else {
            HeaderValue::from_str(&config.name).ok()
        };
        Self {
            shared: Arc::new(ServerShared {
                read_buffers: BufferPool::new(config.read_buffer_size(), RETAINED_BUFFERS),
                write_buffers: BufferPool::new(config.write_buffer_size(), RETAINED_BUFFERS),
                server_name,
                handler: Arc::new(handler),
                per_ip: PerIpRegistry::new(),
                open: ConnectionTracker::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Connections currently being served.
    pub fn concurrency(&self) -> usize {
        self.shared.open.active_count()
    }

    /// Waits until no connection is being served.
    pub async fn wait_idle(&self) {
        self.shared.open.wait_idle().await;
    }

    /// Accepts and serves connections until the listener is closed.
    pub async fn serve<L>(&self, listener: &L) -> Result<(), ServerError>
    where
        L: Listener + ?Sized,
    {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Like [`Server::serve`], and also closes the listener once `signal`
    /// completes. Connections in progress keep being served; see
    /// [`Server::wait_idle`].
    pub async fn serve_with_shutdown<L, F>(&self, listener: &L, signal: F) -> Result<(), ServerError>
    where
        L: Listener + ?Sized,
        F: Future<Output = ()>,
    {
        let config = &self.shared.config;
        let shared = Arc::clone(&self.shared);
        let pool = WorkerPool::new(
            conn_handler(move |accepted: Accepted| {
                let shared = Arc::clone(&shared);
                async move { shared.serve_tracked(accepted).await }
            }),
            config.concurrency(),
            config.max_idle_worker_duration(),
            config.log_all_errors,
        );
        tracing::info!(
            address = ?listener.local_addr(),
            concurrency = config.concurrency(),
            "Server accepting connections"
        );

        tokio::pin!(signal);
        let mut per_ip_warnings = ErrorThrottle::per_minute();
        let mut overload_warnings = ErrorThrottle::per_minute();

        let result = loop {
            let accepted = tokio::select! {
                _ = &mut signal => {
                    listener.close();
                    break Ok(());
                }
                res = listener.accept() => res,
            };
            let accepted = match accepted {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break Ok(()),
                Err(err) if is_transient_accept_error(&err) => {
                    tracing::warn!(error = %err, "Temporary error when accepting new connections");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
                Err(err) => break Err(ServerError::Accept(err)),
            };

            let accepted = match self.shared.limit_per_ip(accepted) {
                Ok(accepted) => accepted,
                Err(rejected) => {
                    record_connection_rejected("per_ip");
                    if per_ip_warnings.allow() {
                        tracing::warn!(
                            peer_addr = ?rejected.peer,
                            max_conns_per_ip = config.max_conns_per_ip,
                            "Too many connections from the same ip"
                        );
                    }
                    self.spawn_reject(rejected.conn, StatusCode::TOO_MANY_REQUESTS, PER_IP_LIMIT_MESSAGE);
                    continue;
                }
            };

            if let Err(rejected) = pool.submit(accepted) {
                record_connection_rejected("concurrency");
                if overload_warnings.allow() {
                    tracing::warn!(
                        peer_addr = ?rejected.peer,
                        concurrency = config.concurrency(),
                        "Cannot serve the connection, concurrency limit reached"
                    );
                }
                self.spawn_reject(rejected.conn, StatusCode::SERVICE_UNAVAILABLE, CONCURRENCY_LIMIT_MESSAGE);
                tokio::time::sleep(OVERLOAD_DELAY).await;
            }
        };

        pool.stop();
        tracing::info!("Server stopped accepting connections");
        result
    }

    /// Serves a single connection, applying the per-IP and concurrency
    /// limits. The connection is closed on return unless a handler hijacked
    /// it.
    pub async fn serve_conn(&self, conn: BoxedConn, peer: Option<SocketAddr>) -> Result<(), ServerError> {
        let accepted = match self.shared.limit_per_ip(Accepted { conn, peer }) {
            Ok(accepted) => accepted,
            Err(rejected) => {
                record_connection_rejected("per_ip");
                self.shared
                    .reject(rejected.conn, StatusCode::TOO_MANY_REQUESTS, PER_IP_LIMIT_MESSAGE)
                    .await;
                return Err(ServerError::PerIpConnLimit);
            }
        };
        let Some(_open) = self.shared.open.try_track(self.shared.config.concurrency()) else {
            record_connection_rejected("concurrency");
            self.shared
                .reject(accepted.conn, StatusCode::SERVICE_UNAVAILABLE, CONCURRENCY_LIMIT_MESSAGE)
                .await;
            return Err(ServerError::ConcurrencyLimit);
        };
        let peer = accepted.peer;
        match AssertUnwindSafe(serve_connection(&self.shared, accepted.conn, peer))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let panic = panic_message(payload.as_ref());
                tracing::error!(peer_addr = ?peer, panic = %panic, "Connection handler panicked");
                Err(ServerError::HandlerPanic(panic))
            }
        }
    }

    fn spawn_reject(&self, conn: BoxedConn, status: StatusCode, msg: &'static str) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.reject(conn, status, msg).await });
    }
}
