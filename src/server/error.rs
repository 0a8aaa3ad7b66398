//! Server error types.

use std::io;

use thiserror::Error;

use crate::codec::CodecError;
use crate::observability::logging::is_disconnect_noise;

/// Errors ending a connection or a serve loop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("too many connections from the client ip")]
    PerIpConnLimit,

    #[error("cannot serve the connection because the concurrency limit is reached")]
    ConcurrencyLimit,

    #[error("exceeded max keep-alive duration")]
    KeepaliveTimeout,

    #[error("non-GET request received")]
    NonGetRequest,

    #[error("request handler panicked: {0}")]
    HandlerPanic(String),

    #[error("error accepting connections: {0}")]
    Accept(#[source] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// True for errors caused by clients disconnecting or idling out, which
    /// are only logged when `log_all_errors` is set.
    pub fn is_disconnect_noise(&self) -> bool {
        match self {
            ServerError::Io(err) | ServerError::Codec(CodecError::Io(err)) => is_disconnect_noise(err),
            ServerError::Codec(CodecError::UnexpectedEof) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resets_are_noise_limits_are_not() {
        assert!(ServerError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_disconnect_noise());
        assert!(ServerError::Codec(CodecError::Io(io::Error::from(io::ErrorKind::TimedOut))).is_disconnect_noise());
        assert!(!ServerError::KeepaliveTimeout.is_disconnect_noise());
        assert!(!ServerError::Codec(CodecError::HeaderTooLarge { limit: 10 }).is_disconnect_noise());
    }
}
