//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Durations
//! are whole milliseconds (`*_ms`); 0 means "unlimited" for timeouts and
//! "use the default" for sizes and counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connections allowed per host when `max_conns` is 0.
pub const DEFAULT_MAX_CONNS_PER_HOST: usize = 512;
/// Idle keep-alive lifetime when `max_idle_conn_duration_ms` is 0.
pub const DEFAULT_MAX_IDLE_CONN_DURATION: Duration = Duration::from_secs(10);
/// Pipeline queue capacity when `max_pending_requests` is 0.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 1024;
/// Concurrent connections a server handles when `concurrency` is 0.
pub const DEFAULT_CONCURRENCY: usize = 256 * 1024;
/// Idle worker lifetime when `max_idle_worker_duration_ms` is 0.
pub const DEFAULT_MAX_IDLE_WORKER_DURATION: Duration = Duration::from_secs(10);
/// Read and write buffer size when unset. Also bounds message heads.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

pub(crate) fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn or_default(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}

/// Root configuration for the `fastwire` binary and embedders.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FastwireConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Server engine settings.
    pub server: ServerConfig,

    /// Defaults for the multi-host client.
    pub client: ClientConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Settings for a client bound to one logical host.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostClientConfig {
    /// Comma separated `host[:port]` list, dialed round-robin.
    pub addr: String,

    /// Sent as `User-Agent` when a request has none.
    pub name: String,

    /// Maximum open connections (idle plus busy). 0 = 512.
    pub max_conns: usize,

    /// Connections older than this are closed after their next exchange.
    /// 0 = unlimited.
    pub max_conn_duration_ms: u64,

    /// Idle keep-alive connections are closed after this. 0 = 10s.
    pub max_idle_conn_duration_ms: u64,

    /// Read buffer size; also the maximum response head size. 0 = 4096.
    pub read_buffer_size: usize,

    /// Write buffer size. 0 = 4096.
    pub write_buffer_size: usize,

    /// Per-read deadline window. 0 = unlimited.
    pub read_timeout_ms: u64,

    /// Per-write deadline window. 0 = unlimited.
    pub write_timeout_ms: u64,

    /// Responses with larger bodies fail. 0 = unlimited.
    pub max_response_body_size: usize,

    /// Resolve IPv6 addresses as well as IPv4.
    pub dial_dual_stack: bool,
}

impl Default for HostClientConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            name: "fastwire".to_string(),
            max_conns: 0,
            max_conn_duration_ms: 0,
            max_idle_conn_duration_ms: 0,
            read_buffer_size: 0,
            write_buffer_size: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            max_response_body_size: 0,
            dial_dual_stack: false,
        }
    }
}

impl HostClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn max_conns(&self) -> usize {
        or_default(self.max_conns, DEFAULT_MAX_CONNS_PER_HOST)
    }

    pub fn max_conn_duration(&self) -> Option<Duration> {
        millis(self.max_conn_duration_ms)
    }

    pub fn max_idle_conn_duration(&self) -> Duration {
        millis(self.max_idle_conn_duration_ms).unwrap_or(DEFAULT_MAX_IDLE_CONN_DURATION)
    }

    pub fn read_buffer_size(&self) -> usize {
        or_default(self.read_buffer_size, DEFAULT_BUFFER_SIZE)
    }

    pub fn write_buffer_size(&self) -> usize {
        or_default(self.write_buffer_size, DEFAULT_BUFFER_SIZE)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }

    /// Overall dial budget: read + write timeouts, or 3s when both are unset.
    pub fn dial_timeout(&self) -> Duration {
        dial_budget(self.read_timeout_ms, self.write_timeout_ms)
    }
}

fn dial_budget(read_ms: u64, write_ms: u64) -> Duration {
    match millis(read_ms.saturating_add(write_ms)) {
        Some(budget) => budget,
        None => crate::net::dial::DEFAULT_DIAL_TIMEOUT,
    }
}

/// Settings for a pipelining client bound to one logical host.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineClientConfig {
    /// Comma separated `host[:port]` list, dialed round-robin.
    pub addr: String,

    /// Sent as `User-Agent` when a request has none.
    pub name: String,

    /// Capacity of each of the outgoing and in-flight queues. 0 = 1024.
    pub max_pending_requests: usize,

    /// How long the writer may hold buffered requests before flushing.
    /// 0 = flush as soon as the outgoing queue drains.
    pub max_batch_delay_ms: u64,

    /// The connection closes after this long without a request. 0 = 10s.
    pub max_idle_conn_duration_ms: u64,

    /// Read buffer size; also the maximum response head size. 0 = 4096.
    pub read_buffer_size: usize,

    /// Buffered request bytes that force a flush. 0 = 4096.
    pub write_buffer_size: usize,

    /// Per-read deadline window. 0 = unlimited.
    pub read_timeout_ms: u64,

    /// Per-write deadline window. 0 = unlimited.
    pub write_timeout_ms: u64,

    /// Responses with larger bodies fail. 0 = unlimited.
    pub max_response_body_size: usize,
}

impl Default for PipelineClientConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            name: "fastwire".to_string(),
            max_pending_requests: 0,
            max_batch_delay_ms: 0,
            max_idle_conn_duration_ms: 0,
            read_buffer_size: 0,
            write_buffer_size: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            max_response_body_size: 0,
        }
    }
}

impl PipelineClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn max_pending_requests(&self) -> usize {
        or_default(self.max_pending_requests, DEFAULT_MAX_PENDING_REQUESTS)
    }

    pub fn max_batch_delay(&self) -> Option<Duration> {
        millis(self.max_batch_delay_ms)
    }

    pub fn max_idle_conn_duration(&self) -> Duration {
        millis(self.max_idle_conn_duration_ms).unwrap_or(DEFAULT_MAX_IDLE_CONN_DURATION)
    }

    pub fn read_buffer_size(&self) -> usize {
        or_default(self.read_buffer_size, DEFAULT_BUFFER_SIZE)
    }

    pub fn write_buffer_size(&self) -> usize {
        or_default(self.write_buffer_size, DEFAULT_BUFFER_SIZE)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        dial_budget(self.read_timeout_ms, self.write_timeout_ms)
    }
}

/// Defaults applied to every host the multi-host client talks to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sent as `User-Agent` when a request has none.
    pub name: String,

    /// Maximum open connections per host. 0 = 512.
    pub max_conns_per_host: usize,

    /// See [`HostClientConfig::max_conn_duration_ms`].
    pub max_conn_duration_ms: u64,

    /// See [`HostClientConfig::max_idle_conn_duration_ms`].
    pub max_idle_conn_duration_ms: u64,

    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_response_body_size: usize,
    pub dial_dual_stack: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "fastwire".to_string(),
            max_conns_per_host: 0,
            max_conn_duration_ms: 0,
            max_idle_conn_duration_ms: 0,
            read_buffer_size: 0,
            write_buffer_size: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            max_response_body_size: 0,
            dial_dual_stack: false,
        }
    }
}

impl ClientConfig {
    /// Settings for the host client serving `addr`.
    pub fn for_host(&self, addr: &str) -> HostClientConfig {
        HostClientConfig {
            addr: addr.to_string(),
            name: self.name.clone(),
            max_conns: self.max_conns_per_host,
            max_conn_duration_ms: self.max_conn_duration_ms,
            max_idle_conn_duration_ms: self.max_idle_conn_duration_ms,
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            read_timeout_ms: self.read_timeout_ms,
            write_timeout_ms: self.write_timeout_ms,
            max_response_body_size: self.max_response_body_size,
            dial_dual_stack: self.dial_dual_stack,
        }
    }
}

/// Server engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Sent as `Server` when a response has none.
    pub name: String,

    /// Maximum connections served at once. 0 = 262144.
    pub concurrency: usize,

    /// Close every connection after its first response.
    pub disable_keepalive: bool,

    /// Read buffer size; also the maximum request head size. 0 = 4096.
    pub read_buffer_size: usize,

    /// Write buffer size. 0 = 4096.
    pub write_buffer_size: usize,

    /// Per-read deadline window. 0 = unlimited.
    pub read_timeout_ms: u64,

    /// Per-write deadline window. 0 = unlimited.
    pub write_timeout_ms: u64,

    /// Concurrent connections allowed per client IP. 0 = unlimited.
    pub max_conns_per_ip: usize,

    /// Requests served per connection before it is closed. 0 = unlimited.
    pub max_requests_per_conn: u64,

    /// Maximum lifetime of a keep-alive connection. 0 = unlimited.
    pub max_keepalive_duration_ms: u64,

    /// Requests with larger bodies are rejected. 0 = unlimited.
    pub max_request_body_size: usize,

    /// Idle worker slots retire after this. 0 = 10s.
    pub max_idle_worker_duration_ms: u64,

    /// Reject every method except GET.
    pub get_only: bool,

    /// Also log errors caused by clients disconnecting or idling out.
    pub log_all_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "fastwire".to_string(),
            concurrency: 0,
            disable_keepalive: false,
            read_buffer_size: 0,
            write_buffer_size: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            max_conns_per_ip: 0,
            max_requests_per_conn: 0,
            max_keepalive_duration_ms: 0,
            max_request_body_size: 0,
            max_idle_worker_duration_ms: 0,
            get_only: false,
            log_all_errors: false,
        }
    }
}

impl ServerConfig {
    pub fn concurrency(&self) -> usize {
        or_default(self.concurrency, DEFAULT_CONCURRENCY)
    }

    pub fn read_buffer_size(&self) -> usize {
        or_default(self.read_buffer_size, DEFAULT_BUFFER_SIZE)
    }

    pub fn write_buffer_size(&self) -> usize {
        or_default(self.write_buffer_size, DEFAULT_BUFFER_SIZE)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }

    pub fn max_keepalive_duration(&self) -> Option<Duration> {
        millis(self.max_keepalive_duration_ms)
    }

    pub fn max_idle_worker_duration(&self) -> Duration {
        millis(self.max_idle_worker_duration_ms).unwrap_or(DEFAULT_MAX_IDLE_WORKER_DURATION)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter, overridden by `RUST_LOG`.
    pub log_level: String,

    /// Serve Prometheus metrics.
    pub metrics_enabled: bool,

    /// Prometheus scrape address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
