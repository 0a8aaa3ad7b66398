//! Client error types.

use std::io;

use thiserror::Error;

use crate::codec::CodecError;
use crate::net::DialTimeoutError;

/// Errors returned by [`HostClient`](super::HostClient),
/// [`PipelineClient`](super::PipelineClient) and [`Client`](super::Client).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every connection to the host is busy and the cap is reached.
    #[error("no free connections available to host")]
    PoolExhausted,

    /// The caller's deadline passed before a response arrived.
    #[error("timeout")]
    Timeout,

    #[error("dialing to the given address timed out")]
    DialTimeout,

    /// A reused connection was closed by the server before the first
    /// response byte, and the request could not be replayed.
    #[error(
        "the server closed connection before returning the first response byte; \
         make sure the server returns 'Connection: close' before closing the connection"
    )]
    ConnectionClosed,

    /// The pipeline queue was full; increase `max_pending_requests`.
    #[error("pipelined requests' queue has been overflown; increase max_pending_requests")]
    PipelineOverflow,

    #[error("pipeline connection has been stopped")]
    PipelineStopped,

    #[error("unsupported protocol {0:?}; only http is supported")]
    UnsupportedScheme(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("too many redirects detected when doing the request")]
    TooManyRedirects,

    #[error("missing Location header for redirect response")]
    MissingLocation,

    #[error("dial error: {0}")]
    Dial(#[source] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Classifies an error returned by a dialer.
    pub fn from_dial(err: io::Error) -> Self {
        if DialTimeoutError::is(&err) {
            ClientError::DialTimeout
        } else {
            ClientError::Dial(err)
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout | ClientError::DialTimeout)
    }

    /// Copies the error for delivery to a second receiver. Variants holding
    /// an `io::Error` are flattened to their kind and message.
    pub(crate) fn replicate(&self) -> ClientError {
        match self {
            ClientError::PoolExhausted => ClientError::PoolExhausted,
            ClientError::Timeout => ClientError::Timeout,
            ClientError::DialTimeout => ClientError::DialTimeout,
            ClientError::ConnectionClosed => ClientError::ConnectionClosed,
            ClientError::PipelineOverflow => ClientError::PipelineOverflow,
            ClientError::PipelineStopped => ClientError::PipelineStopped,
            ClientError::TooManyRedirects => ClientError::TooManyRedirects,
            ClientError::MissingLocation => ClientError::MissingLocation,
            ClientError::UnsupportedScheme(s) => ClientError::UnsupportedScheme(s.clone()),
            ClientError::InvalidUrl(s) => ClientError::InvalidUrl(s.clone()),
            ClientError::Codec(CodecError::Eof) => ClientError::Codec(CodecError::Eof),
            ClientError::Codec(CodecError::UnexpectedEof) => ClientError::Codec(CodecError::UnexpectedEof),
            ClientError::Codec(CodecError::BodyTooLarge { limit }) => {
                ClientError::Codec(CodecError::BodyTooLarge { limit: *limit })
            }
            ClientError::Codec(CodecError::HeaderTooLarge { limit }) => {
                ClientError::Codec(CodecError::HeaderTooLarge { limit: *limit })
            }
            ClientError::Codec(CodecError::Malformed(s)) => ClientError::Codec(CodecError::Malformed(s.clone())),
            ClientError::Codec(CodecError::Io(e)) | ClientError::Io(e) | ClientError::Dial(e) => {
                ClientError::Io(io::Error::new(e.kind(), e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_timeouts_are_recognized() {
        assert!(matches!(
            ClientError::from_dial(DialTimeoutError.into_io()),
            ClientError::DialTimeout
        ));
        assert!(matches!(
            ClientError::from_dial(io::Error::from(io::ErrorKind::ConnectionRefused)),
            ClientError::Dial(_)
        ));
    }

    #[test]
    fn replicate_keeps_kind() {
        let err = ClientError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        match err.replicate() {
            ClientError::Io(copy) => assert_eq!(copy.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ClientError::Codec(CodecError::BodyTooLarge { limit: 3 }).replicate(),
            ClientError::Codec(CodecError::BodyTooLarge { limit: 3 })
        ));
    }
}
