//! Minimal HTTP/1.x message codec.
//!
//! # Responsibilities
//! - Parse request and response heads with `httparse`
//! - Frame bodies by `Content-Length`, chunked encoding, or connection close
//! - Serialize requests and responses into a reusable `BytesMut` buffer
//!
//! # Data Flow
//! ```text
//! socket ──read_buf──▶ BytesMut ──httparse──▶ head ──framing──▶ Bytes body
//!                          ▲                                        │
//!                          └───────── leftover bytes stay ──────────┘
//! ```
//!
//! # Design Decisions
//! - Bytes that follow a complete message are left in the caller's buffer so
//!   pipelined messages and hijacked connections lose nothing.
//! - Header bytes are bounded by the caller-supplied head limit (the read
//!   buffer size); bodies by a separate limit where 0 means unlimited.
//! - Requests are read in two phases so a server can answer
//!   `Expect: 100-continue` between head and body.

pub mod error;
mod framing;
pub mod request;
pub mod response;

pub use error::CodecError;
pub use request::{Request, WriteOptions};
pub use response::Response;

/// Upper bound on header lines in a single message.
pub const MAX_HEADERS: usize = 100;

/// Size limits applied while reading one message.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum size of the message head in bytes.
    pub max_head: usize,
    /// Maximum body size in bytes. 0 means unlimited.
    pub max_body: usize,
}

impl Limits {
    pub fn new(max_head: usize, max_body: usize) -> Self {
        Self { max_head, max_body }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head: 4096,
            max_body: 0,
        }
    }
}

/// Returns true when a comma separated header value list contains `token`.
pub(crate) fn has_token(values: http::header::GetAll<'_, http::HeaderValue>, token: &str) -> bool {
    values.iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}
