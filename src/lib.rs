//! fastwire: an HTTP/1.x client and server engine built for very large
//! numbers of concurrent connections.
//!
//! # Architecture Overview
//!
//! ```text
//!   ┌──────────────────────────── client ────────────────────────────┐
//!   │ Client ─▶ HostClient ─▶ ConnPool ─▶ HostDialer ─▶ TcpDialer     │
//!   │                                         (round-robin)  (DNS cache)
//!   │ PipelineClient ─▶ writer task ─▶ socket ─▶ reader task (FIFO)   │
//!   └─────────────────────────────────────────────────────────────────┘
//!   ┌──────────────────────────── server ────────────────────────────┐
//!   │ Listener ─▶ per-IP limit ─▶ WorkerPool ─▶ serve loop ─▶ handler │
//!   │                                              └─▶ hijack task    │
//!   └─────────────────────────────────────────────────────────────────┘
//!   shared: codec (HTTP/1.x framing), net (deadlines, buffers,
//!   transports), config, observability, resilience (retry, backoff)
//! ```

// Core subsystems
pub mod client;
pub mod codec;
pub mod net;
pub mod server;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use client::{Client, ClientError, HostClient, PipelineClient};
pub use codec::{Request, Response};
pub use config::FastwireConfig;
pub use lifecycle::Shutdown;
pub use server::{RequestCtx, RequestHandler, Server, ServerError};
