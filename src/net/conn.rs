//! Type-erased byte streams.

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream usable as an HTTP connection.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Conn for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An owned, type-erased connection.
pub type BoxedConn = Box<dyn Conn>;
