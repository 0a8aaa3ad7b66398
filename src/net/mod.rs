//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Client side:
//!     "host:port[,host:port]" → dial.rs (round-robin, overall deadline)
//!         → TcpDialer (DNS cache, concurrency cap) → BoxedConn
//!
//! Server side:
//!     listener.rs / memory.rs (accept) → Accepted { conn, peer }
//!         → connection.rs (ids, active counts) → server serve loop
//!
//! Both sides:
//!     deadline.rs wraps a BoxedConn with absolute read/write deadlines
//!     buffer.rs recycles read/write buffers between connections
//! ```
//!
//! # Design Decisions
//! - Transports are erased behind `BoxedConn` so TCP and in-memory pipes
//!   share one code path in the client and server.
//! - Deadlines are absolute instants, re-armed only when more than a quarter
//!   of the window has passed since the last arm.

pub mod buffer;
pub mod conn;
pub mod connection;
pub mod deadline;
pub mod dial;
pub mod listener;
pub mod memory;

pub use buffer::BufferPool;
pub use conn::{BoxedConn, Conn};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use deadline::Deadlined;
pub use dial::{dial_fn, Dial, DialFn, DialTimeoutError, HostDialer, TcpDialer};
pub use listener::{Accepted, Listener, TcpAcceptor};
pub use memory::InMemoryListener;
