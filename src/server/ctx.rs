//! Per-request context handed to handlers.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::codec::{Request, Response};
use crate::net::ConnectionId;

use super::hijack::HijackedConn;

/// Takes over a connection after the response has been written.
pub type HijackHandler = Box<dyn FnOnce(HijackedConn) -> BoxFuture<'static, ()> + Send>;

enum TimeoutSlot {
    Open(Option<Response>),
    Sealed,
}

/// Shared cell through which a handler, or a task it spawned, replaces the
/// response after the handler gave up on time.
///
/// Once the serve loop seals the cell, later calls have no effect.
#[derive(Clone)]
pub struct TimeoutHandle {
    slot: Arc<Mutex<TimeoutSlot>>,
}

impl TimeoutHandle {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(TimeoutSlot::Open(None))),
        }
    }

    /// Sends `resp` instead of whatever the handler leaves in its context.
    /// Returns false if the request has already been answered.
    pub fn respond(&self, resp: Response) -> bool {
        let mut slot = self.slot.lock();
        match &mut *slot {
            TimeoutSlot::Open(current) => {
                *current = Some(resp);
                true
            }
            TimeoutSlot::Sealed => false,
        }
    }

    /// Responds with `status` and a plain-text `msg`.
    pub fn error(&self, msg: impl Into<Bytes>, status: StatusCode) -> bool {
        self.respond(Response::text(status, msg))
    }

    pub(crate) fn seal(&self) -> Option<Response> {
        match std::mem::replace(&mut *self.slot.lock(), TimeoutSlot::Sealed) {
            TimeoutSlot::Open(resp) => resp,
            TimeoutSlot::Sealed => None,
        }
    }
}

/// State of one request on a server connection.
pub struct RequestCtx {
    pub request: Request,
    pub response: Response,
    conn_id: ConnectionId,
    conn_request_num: u64,
    conn_time: Instant,
    time: Instant,
    remote_addr: Option<SocketAddr>,
    hijack: Option<HijackHandler>,
    timeout: TimeoutHandle,
}

impl RequestCtx {
    pub(crate) fn new(
        request: Request,
        conn_id: ConnectionId,
        conn_request_num: u64,
        conn_time: Instant,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            request,
            response: Response::default(),
            conn_id,
            conn_request_num,
            conn_time,
            time: Instant::now(),
            remote_addr,
            hijack: None,
            timeout: TimeoutHandle::new(),
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// 1-based position of this request on its connection.
    pub fn conn_request_num(&self) -> u64 {
        self.conn_request_num
    }

    /// When the connection was accepted.
    pub fn conn_time(&self) -> Instant {
        self.conn_time
    }

    /// When the request was read.
    pub fn time(&self) -> Instant {
        self.time
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr.map(|addr| addr.ip())
    }

    /// Sets a `200 OK` response with the given content type and body.
    pub fn success(&mut self, content_type: &'static str, body: impl Into<Bytes>) {
        self.response.status = StatusCode::OK;
        self.response.set_body(content_type, body);
    }

    /// Sets a plain-text error response.
    pub fn error(&mut self, msg: impl Into<Bytes>, status: StatusCode) {
        self.response = Response::text(status, msg);
    }

    /// Closes the connection after this response.
    pub fn set_connection_close(&mut self) {
        self.response.set_connection_close();
    }

    /// Registers `handler` to own the raw connection once the response is
    /// written. Skipped if the connection closes after this response.
    ///
    /// # Panics
    ///
    /// Panics if a hijack handler is already registered for this request.
    pub fn hijack<F, Fut>(&mut self, handler: F)
    where
        F: FnOnce(HijackedConn) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        assert!(self.hijack.is_none(), "hijack handler already registered for this request");
        self.hijack = Some(Box::new(move |conn| Box::pin(handler(conn))));
    }

    pub fn hijacked(&self) -> bool {
        self.hijack.is_some()
    }

    /// Handle for answering the request after the handler returns, for
    /// handlers that time out or hand work to other tasks.
    pub fn timeout_handle(&self) -> TimeoutHandle {
        self.timeout.clone()
    }

    /// Responds with `408 Request Timeout` and `msg`, overriding anything the
    /// handler writes afterwards. Buffered pipelined requests are dropped by
    /// closing the connection.
    pub fn timeout_error(&self, msg: impl Into<Bytes>) {
        self.timeout.error(msg, StatusCode::REQUEST_TIMEOUT);
    }

    /// Like [`RequestCtx::timeout_error`] with a full response.
    pub fn timeout_error_with_response(&self, resp: &Response) {
        self.timeout.respond(resp.clone());
    }

    pub(crate) fn into_parts(self) -> (Request, Response, Option<HijackHandler>, TimeoutHandle) {
        (self.request, self.response, self.hijack, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestCtx {
        RequestCtx::new(Request::get("/"), ConnectionId::new(), 1, Instant::now(), None)
    }

    #[tokio::test]
    async fn timeout_response_wins_until_sealed() {
        let mut ctx = ctx();
        let handle = ctx.timeout_handle();
        ctx.timeout_error("too slow");
        ctx.success("text/plain", "late");
        let (_, _, _, timeout) = ctx.into_parts();
        let resp = timeout.seal().unwrap();
        assert_eq!(resp.status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(&resp.body[..], b"too slow");
        assert!(!handle.error("ignored", StatusCode::OK));
    }

    #[tokio::test]
    #[should_panic(expected = "hijack handler already registered")]
    async fn second_hijack_panics() {
        let mut ctx = ctx();
        ctx.hijack(|_conn| async {});
        ctx.hijack(|_conn| async {});
    }
}
