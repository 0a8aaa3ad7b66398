//! Pipelining client: many in-flight requests on one connection.
//!
//! # Data Flow
//! ```text
//! callers ──push──▶ outgoing (bounded) ──writer──▶ socket ──reader──▶ callers
//!                                          │                  ▲
//!                                          └──▶ in_flight ────┘
//!                                               (bounded, FIFO)
//! ```
//!
//! # Responsibilities
//! - Queue requests and pair responses with them in send order
//! - Batch writes: flush when the outgoing queue drains, the in-flight queue
//!   fills, or the batch delay expires
//! - Close the connection after `max_idle_conn_duration` without requests
//! - Fail every queued item with `PipelineStopped` when the connection dies,
//!   then start a new connection on demand
//!
//! # Design Decisions
//! - Each item carries a single-use completion channel. Dropping an item
//!   without completing it reports `PipelineStopped` to its caller.
//! - Non-deadline submissions evict the oldest queued item on overflow;
//!   deadline submissions wait for room instead.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use http::{HeaderValue, Method};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{Limits, Request, Response, WriteOptions};
use crate::config::PipelineClientConfig;
use crate::net::{BoxedConn, Deadlined, Dial, HostDialer};
use crate::observability::metrics;

use super::work_queue::WorkQueue;
use super::ClientError;

/// Pause before reconnecting after a dial failure.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

type Completion = oneshot::Sender<Result<Response, ClientError>>;

/// One queued request.
struct PipelineWork {
    req: Request,
    deadline: Option<Instant>,
    done: Completion,
}

impl PipelineWork {
    fn complete(self, result: Result<Response, ClientError>) {
        // the caller may have given up already
        let _ = self.done.send(result);
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

struct PipelineInner {
    config: PipelineClientConfig,
    dialer: HostDialer,
    outgoing: WorkQueue<PipelineWork>,
    in_flight: WorkQueue<PipelineWork>,
    running: Mutex<bool>,
    user_agent: HeaderValue,
}

/// Client that pipelines requests to one host over a single connection.
#[derive(Clone)]
pub struct PipelineClient {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for PipelineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineClient")
            .field("addr", &self.inner.config.addr)
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl PipelineClient {
    pub fn new(config: PipelineClientConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_dialer(config: PipelineClientConfig, dial: Arc<dyn Dial>) -> Self {
        Self::build(config, Some(dial))
    }

    fn build(config: PipelineClientConfig, dial: Option<Arc<dyn Dial>>) -> Self {
        let capacity = config.max_pending_requests();
        let dialer = HostDialer::new(&config.addr, 80, dial, config.dial_timeout());
        let user_agent =
            HeaderValue::from_str(&config.name).unwrap_or_else(|_| HeaderValue::from_static("fastwire"));
        Self {
            inner: Arc::new(PipelineInner {
                config,
                dialer,
                outgoing: WorkQueue::new(capacity),
                in_flight: WorkQueue::new(capacity),
                running: Mutex::new(false),
                user_agent,
            }),
        }
    }

    /// Requests queued or awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.outgoing.len() + self.inner.in_flight.len()
    }

    /// Queues `req` and waits for its response.
    ///
    /// When the outgoing queue is full the oldest queued request is failed
    /// with [`ClientError::PipelineOverflow`] to make room; if there is still
    /// no room this call fails the same way.
    pub async fn execute(&self, req: &Request, resp: &mut Response) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();
        let work = PipelineWork {
            req: req.clone(),
            deadline: None,
            done,
        };
        if let Err(work) = self.inner.outgoing.try_push(work) {
            if let Some(oldest) = self.inner.outgoing.try_pop() {
                metrics::record_pipeline_overflow();
                oldest.complete(Err(ClientError::PipelineOverflow));
            }
            if self.inner.outgoing.try_push(work).is_err() {
                metrics::record_pipeline_overflow();
                return Err(ClientError::PipelineOverflow);
            }
        }
        self.inner.ensure_running();

        *resp = rx.await.unwrap_or(Err(ClientError::PipelineStopped))?;
        Ok(())
    }

    pub async fn execute_timeout(&self, req: &Request, resp: &mut Response, timeout: Duration) -> Result<(), ClientError> {
        self.execute_deadline(req, resp, Instant::now() + timeout).await
    }

    /// Queues `req` and waits for its response until `deadline`.
    ///
    /// Waits for queue room rather than evicting. The writer skips the
    /// request if its deadline has passed by the time it is dequeued.
    pub async fn execute_deadline(&self, req: &Request, resp: &mut Response, deadline: Instant) -> Result<(), ClientError> {
        if Instant::now() >= deadline {
            return Err(ClientError::Timeout);
        }
        let (done, rx) = oneshot::channel();
        let work = PipelineWork {
            req: req.clone(),
            deadline: Some(deadline),
            done,
        };

        // a full queue only drains while a worker runs
        self.inner.ensure_running();
        if tokio::time::timeout_at(deadline, self.inner.outgoing.push(work)).await.is_err() {
            return Err(ClientError::Timeout);
        }
        self.inner.ensure_running();

        match tokio::time::timeout_at(deadline, rx).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(Err(_)) => Err(ClientError::PipelineStopped),
            Ok(Ok(result)) => {
                *resp = result?;
                Ok(())
            }
        }
    }
}

impl PipelineInner {
    fn ensure_running(self: &Arc<Self>) {
        {
            let mut running = self.running.lock();
            if *running {
                return;
            }
            *running = true;
        }
        tokio::spawn(Arc::clone(self).supervise());
    }

    /// Serves connections until the outgoing queue is empty after one ends.
    async fn supervise(self: Arc<Self>) {
        loop {
            let outcome = self.run_connection().await;
            self.fail_pending();
            if let Err(err) = &outcome {
                tracing::warn!(addr = %self.dialer.label(), error = %err, "Pipeline connection failed");
            }

            {
                let mut running = self.running.lock();
                if self.outgoing.is_empty() {
                    *running = false;
                    return;
                }
            }
            if matches!(outcome, Err(ClientError::Dial(_) | ClientError::DialTimeout)) {
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }

    fn fail_pending(&self) {
        while let Some(work) = self.in_flight.try_pop() {
            work.complete(Err(ClientError::PipelineStopped));
        }
        while let Some(work) = self.outgoing.try_pop() {
            work.complete(Err(ClientError::PipelineStopped));
        }
    }

    async fn run_connection(self: &Arc<Self>) -> Result<(), ClientError> {
        let conn = self.dialer.dial().await.map_err(ClientError::from_dial)?;
        tracing::debug!(addr = %self.dialer.label(), "Pipeline connection established");
        let (read_half, write_half) = tokio::io::split(conn);
        let stop = CancellationToken::new();

        let mut writer = tokio::spawn(Arc::clone(self).write_loop(Deadlined::new(write_half), stop.clone()));
        let mut reader = tokio::spawn(Arc::clone(self).read_loop(Deadlined::new(read_half), stop.clone()));

        // whichever side ends first takes the other down with it
        let result = tokio::select! {
            res = &mut writer => {
                stop.cancel();
                let _ = (&mut reader).await;
                res
            }
            res = &mut reader => {
                stop.cancel();
                let _ = (&mut writer).await;
                res
            }
        };
        result.unwrap_or(Err(ClientError::PipelineStopped))
    }

    async fn write_loop(self: Arc<Self>, mut stream: Deadlined<WriteHalf<BoxedConn>>, stop: CancellationToken) -> Result<(), ClientError> {
        let cfg = &self.config;
        let max_idle = cfg.max_idle_conn_duration();
        let batch_delay = cfg.max_batch_delay();
        let flush_threshold = cfg.write_buffer_size();
        let mut buf = BytesMut::with_capacity(flush_threshold);
        let mut flush_at: Option<Instant> = None;

        loop {
            let work = match self.outgoing.try_pop() {
                Some(work) => work,
                None => tokio::select! {
                    work = self.outgoing.pop() => work,
                    _ = tokio::time::sleep(max_idle) => {
                        tracing::debug!(addr = %self.dialer.label(), "Closing idle pipeline connection");
                        flush(&mut stream, &mut buf, &stop).await?;
                        return Ok(());
                    }
                    _ = stop.cancelled() => return Ok(()),
                    _ = sleep_until(flush_at), if flush_at.is_some() => {
                        flush(&mut stream, &mut buf, &stop).await?;
                        flush_at = None;
                        continue;
                    }
                },
            };

            let now = Instant::now();
            if work.is_expired(now) {
                work.complete(Err(ClientError::Timeout));
                continue;
            }

            if let Some(timeout) = cfg.write_timeout() {
                stream.refresh_write_deadline(now, timeout);
            }
            work.req.write_to(
                &mut buf,
                &WriteOptions {
                    user_agent: Some(&self.user_agent),
                    connection_close: false,
                },
            );
            if buf.len() >= flush_threshold {
                if let Err(err) = flush(&mut stream, &mut buf, &stop).await {
                    work.complete(Err(err.replicate()));
                    return Err(err);
                }
            }
            if flush_at.is_none() && (self.outgoing.is_empty() || self.in_flight.is_full()) {
                flush_at = Some(match batch_delay {
                    Some(delay) => now + delay,
                    None => now,
                });
            }

            let mut work = work;
            loop {
                match self.in_flight.try_push(work) {
                    Ok(()) => break,
                    Err(back) => work = back,
                }
                tokio::select! {
                    _ = self.in_flight.wait_not_full() => {}
                    _ = stop.cancelled() => {
                        work.complete(Err(ClientError::PipelineStopped));
                        return Ok(());
                    }
                    _ = sleep_until(flush_at), if flush_at.is_some() => {
                        if let Err(err) = flush(&mut stream, &mut buf, &stop).await {
                            work.complete(Err(err.replicate()));
                            return Err(err);
                        }
                        flush_at = None;
                    }
                }
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: Deadlined<ReadHalf<BoxedConn>>, stop: CancellationToken) -> Result<(), ClientError> {
        let cfg = &self.config;
        let limits = Limits::new(cfg.read_buffer_size(), cfg.max_response_body_size);
        let mut buf = BytesMut::with_capacity(cfg.read_buffer_size());

        loop {
            let work = tokio::select! {
                work = self.in_flight.pop() => work,
                _ = stop.cancelled() => return Ok(()),
            };
            if let Some(timeout) = cfg.read_timeout() {
                stream.refresh_read_deadline(Instant::now(), timeout);
            }
            let skip_body = work.req.method == Method::HEAD;
            let read = tokio::select! {
                read = Response::read_from(&mut stream, &mut buf, limits, skip_body) => read,
                _ = stop.cancelled() => {
                    work.complete(Err(ClientError::PipelineStopped));
                    return Ok(());
                }
            };
            match read {
                Ok(resp) => work.complete(Ok(resp)),
                Err(err) => {
                    let err = ClientError::from(err);
                    work.complete(Err(err.replicate()));
                    return Err(err);
                }
            }
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Writes buffered requests. Gives up when the connection is being torn down.
async fn flush<W>(stream: &mut W, buf: &mut BytesMut, stop: &CancellationToken) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
{
    if buf.is_empty() {
        return Ok(());
    }
    let write = async {
        stream.write_all(buf).await?;
        stream.flush().await
    };
    tokio::select! {
        res = write => res?,
        _ = stop.cancelled() => {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "pipeline stopped").into());
        }
    }
    buf.clear();
    Ok(())
}
