//! Per-connection request loop.
//!
//! # State Machine
//! ```text
//! Idle → ReadingRequest ─┬─────────────────────────────────┬→ Dispatching → WritingResponse
//!                        └→ Expect100: WriteContinue → ReadingBody ┘              │
//!        ↑                                                                        │
//!        └──────────────── keep-alive ←───────────────────────────────────────────┤
//!                                                            Closing ←────────────┤
//!                                                            Hijacked ←───────────┘
//! ```
//!
//! Responses are batched in the write buffer while pipelined requests are
//! still buffered, and flushed once the read buffer drains or the
//! connection is closing.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::CONNECTION;
use http::{HeaderValue, Method, Version};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::codec::{CodecError, Request, Response};
use crate::net::{BoxedConn, ConnectionId, Deadlined};
use crate::observability::metrics::record_request_served;

use super::ctx::{HijackHandler, RequestCtx};
use super::error::ServerError;
use super::hijack::{spawn_hijack, HijackedConn};
use super::http_server::ServerShared;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Write window granted to a final response once the keep-alive allowance
/// is used up.
const KEEPALIVE_GRACE: Duration = Duration::from_millis(100);

struct Session<'a> {
    shared: &'a ServerShared,
    stream: Deadlined<BoxedConn>,
    read_buf: Option<BytesMut>,
    write_buf: Option<BytesMut>,
    conn_id: ConnectionId,
    conn_time: Instant,
    peer: Option<SocketAddr>,
}

/// Serves requests on `conn` until either side closes it, an error occurs,
/// or a handler hijacks it.
pub(crate) async fn serve_connection(
    shared: &ServerShared,
    conn: BoxedConn,
    peer: Option<SocketAddr>,
) -> Result<(), ServerError> {
    let mut session = Session {
        shared,
        stream: Deadlined::new(conn),
        read_buf: None,
        write_buf: None,
        conn_id: ConnectionId::new(),
        conn_time: Instant::now(),
        peer,
    };
    tracing::trace!(connection_id = %session.conn_id, peer_addr = ?peer, "Serving connection");

    match session.run().await {
        Ok(Some(hijack)) => {
            session.hand_over(hijack);
            Ok(())
        }
        Ok(None) => {
            session.finish().await;
            Ok(())
        }
        Err(err) => {
            session.finish().await;
            Err(err)
        }
    }
}

impl Session<'_> {
    /// Returns the hijack handler when the connection must be handed over.
    async fn run(&mut self) -> Result<Option<HijackHandler>, ServerError> {
        let shared = self.shared;
        let config = &shared.config;
        let mut request_num: u64 = 0;

        loop {
            request_num += 1;

            let now = Instant::now();
            if let Some(window) = self.read_window(now)? {
                self.stream.refresh_read_deadline(now, window);
            }

            let mut request = match self.read_request().await {
                Ok(request) => request,
                Err(CodecError::Eof) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            if self.read_buf.as_ref().is_some_and(|buf| buf.is_empty()) {
                self.release_read_buf();
            }
            if config.get_only && request.method != Method::GET {
                return Err(ServerError::NonGetRequest);
            }
            self.read_request_body(&mut request).await?;

            let close_requested = config.disable_keepalive || request.connection_close();
            let is_http11 = request.version == Version::HTTP_11;

            let mut ctx = RequestCtx::new(request, self.conn_id, request_num, self.conn_time, self.peer);
            shared.handler.handle(&mut ctx).await;
            let (request, mut response, mut hijack, timeout) = ctx.into_parts();

            if let Some(timeout_response) = timeout.seal() {
                response = timeout_response;
                hijack = None;
                if self.read_buf.is_some() {
                    response.set_connection_close();
                }
            }
            if request.method == Method::HEAD {
                response.skip_body = true;
            }
            if config.max_requests_per_conn > 0 && request_num >= config.max_requests_per_conn {
                response.set_connection_close();
            }

            if let Some(window) = self.write_window(&mut response) {
                self.stream.refresh_write_deadline(Instant::now(), window);
            }

            let close = close_requested || request.connection_close() || response.connection_close();
            if close {
                response.set_connection_close();
            } else if !is_http11 {
                response.headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
            }

            let write_buf = self.write_buf.get_or_insert_with(|| shared.write_buffers.acquire());
            response.write_to(write_buf, shared.server_name.as_ref());
            record_request_served();

            if self.read_buf.is_none() || close || write_buf.len() >= config.write_buffer_size() {
                self.flush().await?;
            }
            if close {
                return Ok(None);
            }
            if hijack.is_some() {
                self.flush().await?;
                return Ok(hijack);
            }
        }
    }

    async fn read_request(&mut self) -> Result<Request, CodecError> {
        let max_head = self.shared.config.read_buffer_size();
        let buf = self
            .read_buf
            .get_or_insert_with(|| self.shared.read_buffers.acquire());
        Request::read_head(&mut self.stream, buf, max_head).await
    }

    async fn read_request_body(&mut self, request: &mut Request) -> Result<(), ServerError> {
        if !request.has_body()? {
            return Ok(());
        }
        if request.expects_continue() {
            self.stream.write_all(CONTINUE_RESPONSE).await?;
            self.stream.flush().await?;
        }
        let max_body = self.shared.config.max_request_body_size;
        let buf = self
            .read_buf
            .get_or_insert_with(|| self.shared.read_buffers.acquire());
        request.read_body(&mut self.stream, buf, max_body).await?;
        if buf.is_empty() {
            self.release_read_buf();
        }
        Ok(())
    }

    /// Read deadline window: the per-request read timeout capped by what is
    /// left of the keep-alive allowance.
    fn read_window(&self, now: Instant) -> Result<Option<Duration>, ServerError> {
        let config = &self.shared.config;
        let mut window = config.read_timeout();
        if let Some(max) = config.max_keepalive_duration() {
            let left = max.saturating_sub(now.saturating_duration_since(self.conn_time));
            if left.is_zero() {
                return Err(ServerError::KeepaliveTimeout);
            }
            window = Some(window.map_or(left, |w| w.min(left)));
        }
        Ok(window)
    }

    /// Write deadline window. Past the keep-alive allowance the response is
    /// still attempted briefly, with `Connection: close`.
    fn write_window(&self, response: &mut Response) -> Option<Duration> {
        let config = &self.shared.config;
        let mut window = config.write_timeout();
        if let Some(max) = config.max_keepalive_duration() {
            let mut left = max.saturating_sub(self.conn_time.elapsed());
            if left.is_zero() {
                response.set_connection_close();
                left = KEEPALIVE_GRACE;
            }
            window = Some(window.map_or(left, |w| w.min(left)));
        }
        window
    }

    async fn flush(&mut self) -> Result<(), ServerError> {
        if let Some(mut buf) = self.write_buf.take() {
            let res = async {
                self.stream.write_all(&buf).await?;
                self.stream.flush().await
            }
            .await;
            buf.clear();
            self.shared.write_buffers.release(buf);
            res?;
        }
        Ok(())
    }

    fn release_read_buf(&mut self) {
        if let Some(buf) = self.read_buf.take() {
            self.shared.read_buffers.release(buf);
        }
    }

    /// Best-effort delivery of batched responses, then close.
    async fn finish(&mut self) {
        if let Err(err) = self.flush().await {
            tracing::trace!(connection_id = %self.conn_id, error = %err, "Dropped pending responses");
        }
        let _ = self.stream.shutdown().await;
        self.release_read_buf();
    }

    fn hand_over(mut self, handler: HijackHandler) {
        let buffered = match self.read_buf.take() {
            Some(mut buf) => {
                let bytes = buf.split().freeze();
                self.shared.read_buffers.release(buf);
                bytes
            }
            None => Bytes::new(),
        };
        self.stream.clear_deadlines();
        tracing::debug!(connection_id = %self.conn_id, buffered = buffered.len(), "Connection hijacked");
        let conn = HijackedConn::new(buffered, self.stream.into_inner(), self.peer);
        spawn_hijack(handler, conn, self.conn_id);
    }
}
