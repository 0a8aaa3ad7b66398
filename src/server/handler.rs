//! Request handler trait and adapters.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::StatusCode;

use super::ctx::RequestCtx;

/// Produces the response for one request.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx) -> BoxFuture<'a, ()>;
}

impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx) -> BoxFuture<'a, ()> {
        (**self).handle(ctx)
    }
}

/// Adapter for synchronous closures; see [`handler_fn`].
pub struct HandlerFn<F>(F);

/// Wraps a synchronous closure as a [`RequestHandler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut RequestCtx) + Send + Sync + 'static,
{
    HandlerFn(f)
}

impl<F> RequestHandler for HandlerFn<F>
where
    F: Fn(&mut RequestCtx) + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx) -> BoxFuture<'a, ()> {
        (self.0)(ctx);
        Box::pin(std::future::ready(()))
    }
}

/// Answers `408` with a fixed message when the inner handler runs longer
/// than `timeout`.
pub struct TimeoutHandler<H> {
    inner: H,
    timeout: Duration,
    msg: Bytes,
}

pub fn timeout_handler<H: RequestHandler>(inner: H, timeout: Duration, msg: impl Into<Bytes>) -> TimeoutHandler<H> {
    TimeoutHandler {
        inner,
        timeout,
        msg: msg.into(),
    }
}

impl<H: RequestHandler> RequestHandler for TimeoutHandler<H> {
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let handle = ctx.timeout_handle();
            if tokio::time::timeout(self.timeout, self.inner.handle(ctx)).await.is_err() {
                handle.error(self.msg.clone(), StatusCode::REQUEST_TIMEOUT);
            }
        })
    }
}
