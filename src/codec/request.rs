//! HTTP/1.x requests.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, EXPECT, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::AsyncRead;

use super::framing::{self, BodyKind};
use super::{has_token, CodecError, MAX_HEADERS};

/// An HTTP/1.x request.
///
/// `target` is either origin-form (`/path?q`) or an absolute URI
/// (`http://host/path`). Absolute targets are sent in origin-form with the
/// authority moved into the `Host` header.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Per-write adjustments the client applies on the wire only.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions<'a> {
    /// Sent as `User-Agent` when the request carries none.
    pub user_agent: Option<&'a HeaderValue>,
    /// Adds `Connection: close` without touching the caller's request.
    pub connection_close: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::GET,
            target: "/".to_string(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl Request {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::new(Method::POST, target)
        }
    }

    /// Appends a header, ignoring invalid names or values.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Path and query of the target, without scheme or authority.
    pub fn path(&self) -> &str {
        split_target(&self.target).1
    }

    /// Authority from an absolute target, falling back to the `Host` header.
    pub fn host(&self) -> Option<&str> {
        split_target(&self.target).0.or_else(|| self.header("host"))
    }

    /// GET, HEAD and PUT may be replayed after a transport failure.
    pub fn is_idempotent(&self) -> bool {
        crate::resilience::retries::is_idempotent(&self.method)
    }

    /// True when the connection must close after this exchange: an explicit
    /// `Connection: close`, or HTTP/1.0 without `Connection: keep-alive`.
    pub fn connection_close(&self) -> bool {
        if has_token(self.headers.get_all(CONNECTION), "close") {
            return true;
        }
        self.version == Version::HTTP_10 && !has_token(self.headers.get_all(CONNECTION), "keep-alive")
    }

    pub fn set_connection_close(&mut self) {
        self.headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    pub fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11 && has_token(self.headers.get_all(EXPECT), "100-continue")
    }

    /// Reads the request line and headers. The body is read separately with
    /// [`Request::read_body`].
    ///
    /// Returns [`CodecError::Eof`] when the stream ends before the first byte.
    pub async fn read_head<R>(reader: &mut R, buf: &mut BytesMut, max_head: usize) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if !buf.is_empty() {
                let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut parsed = httparse::Request::new(&mut raw);
                if let httparse::Status::Complete(len) = parsed.parse(buf)? {
                    if len > max_head {
                        return Err(CodecError::HeaderTooLarge { limit: max_head });
                    }
                    let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
                        .map_err(|e| CodecError::Malformed(e.to_string()))?;
                    let request = Self {
                        method,
                        target: parsed.path.unwrap_or("/").to_string(),
                        version: framing::parsed_version(parsed.version),
                        headers: framing::parse_headers(parsed.headers)?,
                        body: Bytes::new(),
                    };
                    buf.advance(len);
                    return Ok(request);
                }
            }
            if buf.len() >= max_head {
                return Err(CodecError::HeaderTooLarge { limit: max_head });
            }
            let was_empty = buf.is_empty();
            if framing::read_more(reader, buf).await? == 0 {
                return Err(if was_empty {
                    CodecError::Eof
                } else {
                    CodecError::UnexpectedEof
                });
            }
        }
    }

    /// True when the head announces a body.
    pub fn has_body(&self) -> Result<bool, CodecError> {
        Ok(framing::body_kind(&self.headers, BodyKind::Empty)? != BodyKind::Empty)
    }

    /// Reads the body announced by the head. Requests without framing
    /// headers have no body.
    pub async fn read_body<R>(&mut self, reader: &mut R, buf: &mut BytesMut, max_body: usize) -> Result<(), CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let kind = framing::body_kind(&self.headers, BodyKind::Empty)?;
        self.body = framing::read_body(reader, buf, kind, max_body).await?;
        Ok(())
    }

    /// Reads a complete request.
    pub async fn read_from<R>(reader: &mut R, buf: &mut BytesMut, limits: super::Limits) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut request = Self::read_head(reader, buf, limits.max_head).await?;
        request.read_body(reader, buf, limits.max_body).await?;
        Ok(request)
    }

    /// Serializes the request into `dst`.
    pub fn write_to(&self, dst: &mut BytesMut, opts: &WriteOptions<'_>) {
        let (authority, path) = split_target(&self.target);

        dst.extend_from_slice(self.method.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        if path.starts_with('?') {
            dst.extend_from_slice(b"/");
        }
        dst.extend_from_slice(path.as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(framing::version_str(self.version).as_bytes());
        dst.extend_from_slice(b"\r\n");

        if !self.headers.contains_key(HOST) {
            if let Some(authority) = authority {
                framing::write_header(dst, b"Host", authority.as_bytes());
            }
        }
        if !self.headers.contains_key(USER_AGENT) {
            if let Some(agent) = opts.user_agent {
                framing::write_header(dst, b"User-Agent", agent.as_bytes());
            }
        }
        framing::write_headers(dst, &self.headers);
        if opts.connection_close && !has_token(self.headers.get_all(CONNECTION), "close") {
            framing::write_header(dst, b"Connection", b"close");
        }
        if !self.body.is_empty() || [Method::POST, Method::PUT, Method::PATCH].contains(&self.method) {
            framing::write_content_length(dst, self.body.len());
        }
        dst.extend_from_slice(b"\r\n");
        dst.extend_from_slice(&self.body);
    }
}

/// Splits a request target into its authority (absolute form only) and
/// path. A bare query (`?q`) is returned as is; the encoder adds the slash.
pub(crate) fn split_target(target: &str) -> (Option<&str>, &str) {
    let rest = match target.find("://") {
        Some(pos) if !target[..pos].contains('/') => &target[pos + 3..],
        _ => return (None, if target.is_empty() { "/" } else { target }),
    };
    match rest.find(['/', '?']) {
        Some(pos) => (Some(&rest[..pos]), &rest[pos..]),
        None => (Some(rest), "/"),
    }
}
