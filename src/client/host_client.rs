//! Request executor for a single logical host.
//!
//! # Data Flow
//! ```text
//! execute(req, resp)
//!     → attempt: acquire pooled conn → write (deadline) → read (deadline)
//!         ├─ success: release for reuse, or close when either side asked
//!         └─ failure: close; retryable if nothing was read yet
//!     → one replay for idempotent requests on a retryable failure
//!     → peer EOF before the first byte surfaces as ConnectionClosed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use http::{HeaderValue, Method};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::codec::{CodecError, Limits, Request, Response, WriteOptions};
use crate::config::HostClientConfig;
use crate::net::{BufferPool, Dial, HostDialer};
use crate::observability::metrics;
use crate::resilience::retries;

use super::executor::{self, RequestExecutor};
use super::pool::{ConnPool, PooledConn};
use super::ClientError;

/// Buffers kept per host for reuse between exchanges.
const RETAINED_BUFFERS: usize = 64;

/// Outcome of one exchange attempt.
struct Failure {
    error: ClientError,
    /// Nothing was read from the peer, so an idempotent request may be sent
    /// again on a fresh connection.
    retryable: bool,
}

impl Failure {
    fn fatal(error: ClientError) -> Self {
        Self { error, retryable: false }
    }
}

struct HostInner {
    config: HostClientConfig,
    pool: ConnPool,
    buffers: BufferPool,
    user_agent: HeaderValue,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last call.
    last_use: AtomicU64,
}

/// Client bound to one host (or a round-robin list of addresses).
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct HostClient {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for HostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("addr", &self.inner.config.addr)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl HostClient {
    /// Creates a client that dials over TCP.
    pub fn new(config: HostClientConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a client that opens connections with `dial`.
    pub fn with_dialer(config: HostClientConfig, dial: Arc<dyn Dial>) -> Self {
        Self::build(config, Some(dial))
    }

    fn build(config: HostClientConfig, dial: Option<Arc<dyn Dial>>) -> Self {
        let dial = dial.or_else(|| {
            config
                .dial_dual_stack
                .then(|| Arc::new(crate::net::TcpDialer::new(config.dial_timeout(), true)) as Arc<dyn Dial>)
        });
        let dialer = HostDialer::new(&config.addr, 80, dial, config.dial_timeout());
        let pool = ConnPool::new(dialer, config.max_conns(), config.max_idle_conn_duration());
        let user_agent =
            HeaderValue::from_str(&config.name).unwrap_or_else(|_| HeaderValue::from_static("fastwire"));
        Self {
            inner: Arc::new(HostInner {
                buffers: BufferPool::new(config.read_buffer_size().max(config.write_buffer_size()), RETAINED_BUFFERS),
                config,
                pool,
                user_agent,
                epoch: Instant::now(),
                last_use: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &HostClientConfig {
        &self.inner.config
    }

    /// Open connections, idle and busy.
    pub fn open_conns(&self) -> usize {
        self.inner.pool.open_conns()
    }

    /// When the client was last asked to do anything.
    pub fn last_use_time(&self) -> Instant {
        self.inner.epoch + Duration::from_millis(self.inner.last_use.load(Ordering::Relaxed))
    }

    fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.inner.epoch);
        self.inner
            .last_use
            .store(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Performs one request/response exchange.
    ///
    /// Idempotent requests are sent a second time if the first attempt failed
    /// before any response byte arrived. Fails fast with
    /// [`ClientError::PoolExhausted`] when every connection is busy.
    pub async fn execute(&self, req: &Request, resp: &mut Response) -> Result<(), ClientError> {
        let mut attempt = 0;
        loop {
            match self.attempt(req, resp).await {
                Ok(()) => return Ok(()),
                Err(failure) if retries::should_retry(&req.method, failure.retryable, attempt) => {
                    tracing::debug!(
                        addr = %self.inner.config.addr,
                        error = %failure.error,
                        "Retrying idempotent request on a new connection"
                    );
                    metrics::record_retry();
                    attempt += 1;
                }
                Err(failure) => {
                    return Err(match failure.error {
                        ClientError::Codec(CodecError::Eof) => ClientError::ConnectionClosed,
                        other => other,
                    })
                }
            }
        }
    }

    /// Like [`HostClient::execute`], waiting at most `timeout`.
    pub async fn execute_timeout(&self, req: &Request, resp: &mut Response, timeout: Duration) -> Result<(), ClientError> {
        executor::execute_deadline(self, req, resp, Instant::now() + timeout).await
    }

    /// Like [`HostClient::execute`], giving up at `deadline`.
    ///
    /// Waits for a free connection with backoff instead of failing fast. On
    /// timeout the exchange keeps running in the background and `resp` is
    /// left untouched.
    pub async fn execute_deadline(&self, req: &Request, resp: &mut Response, deadline: Instant) -> Result<(), ClientError> {
        executor::execute_deadline(self, req, resp, deadline).await
    }

    pub async fn get(&self, url: &str) -> Result<Response, ClientError> {
        executor::get(self, url, None).await
    }

    pub async fn get_timeout(&self, url: &str, timeout: Duration) -> Result<Response, ClientError> {
        executor::get(self, url, Some(Instant::now() + timeout)).await
    }

    pub async fn post(&self, url: &str, body: bytes::Bytes) -> Result<Response, ClientError> {
        executor::post(self, url, body).await
    }

    async fn attempt(&self, req: &Request, resp: &mut Response) -> Result<(), Failure> {
        self.touch();
        let cfg = &self.inner.config;
        let mut conn = self.inner.pool.acquire().await.map_err(Failure::fatal)?;

        let now = Instant::now();
        if let Some(timeout) = cfg.write_timeout() {
            conn.stream().refresh_write_deadline(now, timeout);
        }
        let reset_connection = cfg
            .max_conn_duration()
            .is_some_and(|max| now.saturating_duration_since(conn.created()) > max)
            && !req.connection_close();

        let mut buf = self.inner.buffers.acquire();
        req.write_to(
            &mut buf,
            &WriteOptions {
                user_agent: Some(&self.inner.user_agent),
                connection_close: reset_connection,
            },
        );
        if let Err(err) = write_all(&mut conn, &buf).await {
            self.inner.buffers.release(buf);
            metrics::record_conn_closed("write_error");
            return Err(Failure {
                error: err.into(),
                retryable: true,
            });
        }
        buf.clear();

        if let Some(timeout) = cfg.read_timeout() {
            conn.stream().refresh_read_deadline(Instant::now(), timeout);
        }
        let limits = Limits::new(cfg.read_buffer_size(), cfg.max_response_body_size);
        let skip_body = req.method == Method::HEAD;
        let read = Response::read_from(conn.stream(), &mut buf, limits, skip_body).await;
        let trailing_bytes = !buf.is_empty();
        self.inner.buffers.release(buf);

        match read {
            Ok(response) => {
                let close = reset_connection || req.connection_close() || response.connection_close() || trailing_bytes;
                *resp = response;
                if close {
                    metrics::record_conn_closed("connection_close");
                } else {
                    self.inner.pool.release(conn);
                }
                Ok(())
            }
            Err(err) => {
                metrics::record_conn_closed("read_error");
                let retryable = matches!(err, CodecError::Eof);
                Err(Failure {
                    error: err.into(),
                    retryable,
                })
            }
        }
    }
}

async fn write_all(conn: &mut PooledConn, buf: &BytesMut) -> std::io::Result<()> {
    let stream = conn.stream();
    stream.write_all(buf).await?;
    stream.flush().await
}

impl RequestExecutor for HostClient {
    fn execute<'a>(&'a self, req: &'a Request, resp: &'a mut Response) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(HostClient::execute(self, req, resp))
    }
}
