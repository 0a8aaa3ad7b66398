//! Endpoint resolution and dialing.
//!
//! # Responsibilities
//! - `Dial`: the pluggable "address → connection" seam used by clients
//! - `TcpDialer`: TCP dialing with a DNS cache and a global concurrency cap
//! - `HostDialer`: round-robin over a comma separated address list under one
//!   overall deadline
//!
//! # Design Decisions
//! - Resolved addresses are cached for one minute. An expired entry is
//!   refreshed by a single caller while others keep using the stale list.
//! - A background sweep removes entries not refreshed for two cache periods.
//! - IPv4 results only unless dual stack is enabled.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::conn::BoxedConn;

/// Dial attempts give up after this when no read/write timeouts are set.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

const DNS_CACHE_DURATION: Duration = Duration::from_secs(60);
const DNS_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DIAL_CONCURRENCY: usize = 1000;

/// Opens a connection to `addr` (`host:port`).
pub trait Dial: Send + Sync + 'static {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxedConn>>;
}

/// Adapts a closure into a [`Dial`].
pub struct DialFn<F>(F);

/// Wraps `f` so it can be used wherever a [`Dial`] is expected.
pub fn dial_fn<F, Fut>(f: F) -> DialFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<BoxedConn>> + Send + 'static,
{
    DialFn(f)
}

impl<F, Fut> Dial for DialFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<BoxedConn>> + Send + 'static,
{
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxedConn>> {
        Box::pin((self.0)(addr.to_owned()))
    }
}

/// Marker carried inside `io::Error` when a dial ran out of time.
#[derive(Debug, thiserror::Error)]
#[error("dialing to the given address timed out")]
pub struct DialTimeoutError;

impl DialTimeoutError {
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, self)
    }

    pub fn is(err: &io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<DialTimeoutError>())
    }
}

#[derive(Debug)]
struct Resolved {
    addrs: Arc<[SocketAddr]>,
    next: Arc<AtomicUsize>,
    resolved_at: Instant,
    pending: bool,
}

#[derive(Debug)]
struct DialerInner {
    timeout: Duration,
    dual_stack: bool,
    cache: DashMap<String, Resolved>,
    permits: Semaphore,
    sweeping: AtomicBool,
}

/// TCP dialer with a DNS cache.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    inner: Arc<DialerInner>,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT, false)
    }
}

impl TcpDialer {
    pub fn new(timeout: Duration, dual_stack: bool) -> Self {
        Self {
            inner: Arc::new(DialerInner {
                timeout,
                dual_stack,
                cache: DashMap::new(),
                permits: Semaphore::new(MAX_DIAL_CONCURRENCY),
                sweeping: AtomicBool::new(false),
            }),
        }
    }

    /// Process-wide dialer used when a client has no custom dial function.
    pub fn shared() -> TcpDialer {
        static SHARED: OnceLock<TcpDialer> = OnceLock::new();
        SHARED.get_or_init(TcpDialer::default).clone()
    }

    pub fn cached_hosts(&self) -> usize {
        self.inner.cache.len()
    }

    /// Dials `addr`, trying each resolved address in turn until one
    /// connects or the timeout passes.
    pub async fn dial_tcp(&self, addr: &str, timeout: Duration) -> io::Result<TcpStream> {
        self.ensure_sweeper();
        let deadline = Instant::now() + timeout;
        let (addrs, start) = self.resolve(addr).await?;
        let mut last_err = None;
        for i in 0..addrs.len() {
            let target = addrs[(start + i) % addrs.len()];
            match self.connect(target, deadline).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) if DialTimeoutError::is(&err) => return Err(err),
                Err(err) => {
                    tracing::debug!(addr = %addr, target = %target, error = %err, "Dial attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses to dial")))
    }

    async fn connect(&self, target: SocketAddr, deadline: Instant) -> io::Result<TcpStream> {
        let _permit = tokio::time::timeout_at(deadline, self.inner.permits.acquire())
            .await
            .map_err(|_| DialTimeoutError.into_io())?
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        tokio::time::timeout_at(deadline, TcpStream::connect(target))
            .await
            .map_err(|_| DialTimeoutError.into_io())?
    }

    async fn resolve(&self, addr: &str) -> io::Result<(Arc<[SocketAddr]>, usize)> {
        let now = Instant::now();
        if let Some(mut entry) = self.inner.cache.get_mut(addr) {
            let expired = now.saturating_duration_since(entry.resolved_at) > DNS_CACHE_DURATION;
            if !expired || entry.pending {
                let start = entry.next.fetch_add(1, Ordering::Relaxed);
                return Ok((Arc::clone(&entry.addrs), start));
            }
            entry.pending = true;
        }

        match self.lookup(addr).await {
            Ok(addrs) => {
                self.inner.cache.insert(
                    addr.to_owned(),
                    Resolved {
                        addrs: Arc::clone(&addrs),
                        next: Arc::new(AtomicUsize::new(1)),
                        resolved_at: Instant::now(),
                        pending: false,
                    },
                );
                Ok((addrs, 0))
            }
            Err(err) => {
                if let Some(mut entry) = self.inner.cache.get_mut(addr) {
                    entry.pending = false;
                }
                Err(err)
            }
        }
    }

    async fn lookup(&self, addr: &str) -> io::Result<Arc<[SocketAddr]>> {
        let dual_stack = self.inner.dual_stack;
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr)
            .await?
            .filter(|a| dual_stack || a.is_ipv4())
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no usable addresses for {addr}"),
            ));
        }
        Ok(addrs.into())
    }

    fn ensure_sweeper(&self) {
        if self.inner.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(sweep_dns_cache(weak));
    }
}

/// Clears the sweeping flag however the sweep task ends, including runtime
/// shutdown, so a later dial starts a new one.
struct SweepFlag(Weak<DialerInner>);

impl Drop for SweepFlag {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            inner.sweeping.store(false, Ordering::Release);
        }
    }
}

async fn sweep_dns_cache(weak: Weak<DialerInner>) {
    let _flag = SweepFlag(weak.clone());
    loop {
        tokio::time::sleep(DNS_SWEEP_INTERVAL).await;
        let Some(inner) = weak.upgrade() else { return };
        let now = Instant::now();
        inner
            .cache
            .retain(|_, entry| now.saturating_duration_since(entry.resolved_at) <= 2 * DNS_CACHE_DURATION);
    }
}

impl Dial for TcpDialer {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, io::Result<BoxedConn>> {
        Box::pin(async move {
            let stream = self.dial_tcp(addr, self.inner.timeout).await?;
            Ok(Box::new(stream) as BoxedConn)
        })
    }
}

/// Appends `:port` to addresses that carry none.
pub fn add_missing_port(addr: &str, port: u16) -> String {
    let has_port = match addr.rfind(']') {
        Some(bracket) => addr[bracket..].contains(':'),
        None => addr.contains(':'),
    };
    if has_port {
        addr.to_owned()
    } else {
        format!("{addr}:{port}")
    }
}

/// Dials one logical host that may be served by several addresses.
pub struct HostDialer {
    addrs: Vec<String>,
    next: AtomicUsize,
    dial: Arc<dyn Dial>,
    timeout: Duration,
}

impl std::fmt::Debug for HostDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDialer")
            .field("addrs", &self.addrs)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HostDialer {
    /// `addr_list` is a comma separated list of `host[:port]`; missing ports
    /// default to `default_port`. Without `dial` the shared [`TcpDialer`] is
    /// used.
    pub fn new(addr_list: &str, default_port: u16, dial: Option<Arc<dyn Dial>>, timeout: Duration) -> Self {
        let addrs = addr_list
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|a| add_missing_port(a, default_port))
            .collect();
        Self {
            addrs,
            next: AtomicUsize::new(0),
            dial: dial.unwrap_or_else(|| Arc::new(TcpDialer::shared())),
            timeout,
        }
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Description used in logs and metrics.
    pub fn label(&self) -> String {
        self.addrs.join(",")
    }

    fn next_addr(&self) -> &str {
        if self.addrs.len() == 1 {
            return &self.addrs[0];
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.addrs.len();
        &self.addrs[idx]
    }

    /// Tries up to one dial per configured address, stopping at the first
    /// success or when the overall deadline passes.
    pub async fn dial(&self) -> io::Result<BoxedConn> {
        if self.addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no address configured"));
        }
        let deadline = Instant::now() + self.timeout;
        let mut last_err = None;
        for _ in 0..self.addrs.len() {
            let addr = self.next_addr();
            match tokio::time::timeout_at(deadline, self.dial.dial(addr)).await {
                Ok(Ok(conn)) => {
                    crate::observability::metrics::record_dial(true);
                    return Ok(conn);
                }
                Ok(Err(err)) => {
                    tracing::debug!(addr = %addr, error = %err, "Dial failed");
                    last_err = Some(err);
                }
                Err(_) => last_err = Some(DialTimeoutError.into_io()),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        crate::observability::metrics::record_dial(false);
        Err(last_err.unwrap_or_else(|| DialTimeoutError.into_io()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn missing_ports_are_added() {
        assert_eq!(add_missing_port("example.com", 80), "example.com:80");
        assert_eq!(add_missing_port("example.com:8080", 80), "example.com:8080");
        assert_eq!(add_missing_port("[::1]", 443), "[::1]:443");
        assert_eq!(add_missing_port("[::1]:9000", 443), "[::1]:9000");
    }

    #[tokio::test]
    async fn host_dialer_round_robins() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let dial = dial_fn(move |addr: String| {
            recorder.lock().unwrap().push(addr);
            async move {
                let (conn, _peer) = tokio::io::duplex(64);
                Ok(Box::new(conn) as BoxedConn)
            }
        });
        let dialer = HostDialer::new("a:1,b:2,c", 80, Some(Arc::new(dial)), Duration::from_secs(1));
        for _ in 0..6 {
            dialer.dial().await.unwrap();
        }
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, ["a:1", "b:2", "c:80", "a:1", "b:2", "c:80"]);
    }

    #[tokio::test]
    async fn host_dialer_tries_next_address_on_failure() {
        let dial = dial_fn(|addr: String| async move {
            if addr.starts_with("down") {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            } else {
                let (conn, _peer) = tokio::io::duplex(64);
                Ok(Box::new(conn) as BoxedConn)
            }
        });
        let dialer = HostDialer::new("down:1,up:1", 80, Some(Arc::new(dial)), Duration::from_secs(1));
        assert!(dialer.dial().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn host_dialer_reports_timeout() {
        let dial = dial_fn(|_addr: String| async move {
            std::future::pending::<()>().await;
            Err(io::Error::new(io::ErrorKind::Other, "unreachable"))
        });
        let dialer = HostDialer::new("slow:1", 80, Some(Arc::new(dial)), Duration::from_millis(100));
        let err = dialer.dial().await.err().expect("dial should time out");
        assert!(DialTimeoutError::is(&err));
    }

    #[tokio::test]
    async fn tcp_dialer_caches_resolution() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let dialer = TcpDialer::new(Duration::from_secs(1), false);
        let _a = dialer.dial_tcp(&addr, Duration::from_secs(1)).await.unwrap();
        let _b = dialer.dial_tcp(&addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dialer.cached_hosts(), 1);
    }
}
