//! Codec error types.

use std::io;

use thiserror::Error;

/// Errors produced while reading or writing HTTP/1.x messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer closed the stream before sending any byte of a message.
    #[error("connection closed before the first byte of the message")]
    Eof,

    /// The peer closed the stream in the middle of a message.
    #[error("unexpected end of stream while reading message")]
    UnexpectedEof,

    #[error("message head exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("message body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<httparse::Error> for CodecError {
    fn from(err: httparse::Error) -> Self {
        CodecError::Malformed(err.to_string())
    }
}

impl CodecError {
    /// Returns the underlying I/O error if this is one.
    pub fn as_io(&self) -> Option<&io::Error> {
        match self {
            CodecError::Io(err) => Some(err),
            _ => None,
        }
    }
}
