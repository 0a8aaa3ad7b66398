//! Deadline-bounded execution and URL helpers shared by all clients.
//!
//! # Data Flow
//! ```text
//! execute_deadline(req, resp, deadline)
//!     loop:
//!         deadline passed?            → Timeout (no I/O)
//!         spawn execute(copy of req)  ──▶ detached task
//!         race task result vs deadline
//!             result PoolExhausted    → backoff sleep, clipped to remaining
//!             other result            → copy response back, return
//!             deadline first          → Timeout, task keeps running
//! ```

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::LOCATION;
use http::{Method, StatusCode};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::{Request, Response};
use crate::resilience::backoff::next_backoff;

use super::ClientError;

/// Redirect hops followed by `get` before giving up.
pub const MAX_REDIRECTS: usize = 16;

/// Something that performs a full request/response exchange.
///
/// Implemented by [`HostClient`](super::HostClient) and
/// [`Client`](super::Client); clones must share connection state.
pub trait RequestExecutor: Clone + Send + Sync + 'static {
    fn execute<'a>(&'a self, req: &'a Request, resp: &'a mut Response) -> BoxFuture<'a, Result<(), ClientError>>;
}

/// Runs `execute` under a deadline, retrying pool exhaustion with backoff.
pub async fn execute_deadline<C: RequestExecutor>(
    client: &C,
    req: &Request,
    resp: &mut Response,
    deadline: Instant,
) -> Result<(), ClientError> {
    let mut sleep = Duration::ZERO;
    loop {
        match execute_before(client, req, resp, deadline).await {
            Err(ClientError::PoolExhausted) => {}
            other => return other,
        }
        sleep = next_backoff(sleep, deadline.saturating_duration_since(Instant::now()));
        tokio::time::sleep(sleep).await;
    }
}

/// One detached attempt. The caller's response is only written when the
/// attempt finishes before the deadline.
async fn execute_before<C: RequestExecutor>(
    client: &C,
    req: &Request,
    resp: &mut Response,
    deadline: Instant,
) -> Result<(), ClientError> {
    if Instant::now() >= deadline {
        return Err(ClientError::Timeout);
    }

    let (tx, rx) = oneshot::channel();
    let detached = client.clone();
    let req = req.clone();
    tokio::spawn(async move {
        let mut resp = Response::default();
        let result = detached.execute(&req, &mut resp).await;
        let _ = tx.send((result, resp));
    });

    tokio::select! {
        outcome = rx => match outcome {
            Ok((result, response)) => {
                *resp = response;
                result
            }
            // the task panicked
            Err(_) => Err(ClientError::Timeout),
        },
        _ = tokio::time::sleep_until(deadline) => Err(ClientError::Timeout),
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Fetches `url` with GET, following up to [`MAX_REDIRECTS`] redirects.
pub async fn get<C: RequestExecutor>(
    client: &C,
    url: &str,
    deadline: Option<Instant>,
) -> Result<Response, ClientError> {
    let mut current = url::Url::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    for _ in 0..MAX_REDIRECTS {
        let req = Request::get(current.as_str());
        let mut resp = Response::default();
        match deadline {
            Some(deadline) => execute_deadline(client, &req, &mut resp, deadline).await?,
            None => client.execute(&req, &mut resp).await?,
        }
        if !is_redirect(resp.status) {
            return Ok(resp);
        }
        let location = resp.header(LOCATION.as_str()).ok_or(ClientError::MissingLocation)?;
        current = current
            .join(location)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        tracing::debug!(location = %current, "Following redirect");
    }
    Err(ClientError::TooManyRedirects)
}

/// Sends `body` to `url` with POST. Redirects are not followed.
pub async fn post<C: RequestExecutor>(client: &C, url: &str, body: Bytes) -> Result<Response, ClientError> {
    url::Url::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    let mut req = Request::new(Method::POST, url);
    req.body = body;
    let mut resp = Response::default();
    client.execute(&req, &mut resp).await?;
    Ok(resp)
}
