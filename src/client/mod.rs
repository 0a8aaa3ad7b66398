//! HTTP client subsystem.
//!
//! # Data Flow
//! ```text
//! Client (multi-host, URL routing, redirects)
//!     → HostClient (one host, retry once for idempotent requests)
//!         → ConnPool (bounded keep-alive pool, idle reaper)
//!             → HostDialer (round-robin addresses, overall dial deadline)
//!
//! PipelineClient (one host, one connection)
//!     → outgoing queue → writer → socket → reader → in-flight queue
//! ```
//!
//! # Design Decisions
//! - Pool exhaustion fails fast for plain calls and backs off for calls with
//!   a deadline
//! - Deadline calls run the exchange on a detached task so a timed-out
//!   caller never observes a half-written response
//! - Clients are cheap to clone; clones share pools and queues

pub mod error;
pub mod executor;
mod host_client;
mod multi_host;
mod pipeline;
pub mod pool;
mod work_queue;

pub use error::ClientError;
pub use executor::RequestExecutor;
pub use host_client::HostClient;
pub use multi_host::Client;
pub use pipeline::PipelineClient;
pub use pool::{ConnPool, PooledConn};
