//! HTTP server subsystem.
//!
//! # Data Flow
//! ```text
//! Listener::accept
//!     → per-IP limit (429 on overflow)
//!     → WorkerPool::submit (503 on overflow, accept loop pauses 100ms)
//!         → serve loop: read request → handler → write response → repeat
//!             └─ hijack: raw connection + buffered bytes → user task
//! ```
//!
//! # Design Decisions
//! - One long-lived task per worker slot; slots are reused across
//!   connections and retire when idle
//! - A handler panic ends only the connection it happened on
//! - Deadlines are re-armed only after a quarter of the window has passed

pub mod ctx;
pub mod error;
pub mod handler;
pub mod hijack;
mod http_server;
pub mod per_ip;
mod serve;
pub mod worker_pool;

pub use ctx::{RequestCtx, TimeoutHandle};
pub use error::ServerError;
pub use handler::{handler_fn, timeout_handler, RequestHandler};
pub use hijack::HijackedConn;
pub use http_server::Server;
pub use worker_pool::WorkerPool;
