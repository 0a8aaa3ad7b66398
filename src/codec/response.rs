//! HTTP/1.x responses.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_TYPE, SERVER};
use http::{HeaderMap, HeaderValue, StatusCode, Version};
use tokio::io::AsyncRead;

use super::framing::{self, BodyKind};
use super::{has_token, CodecError, Limits, MAX_HEADERS};

/// An HTTP/1.x response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// When set the body is neither written nor expected on the wire
    /// (responses to HEAD).
    pub skip_body: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            skip_body: false,
        }
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// A `text/plain` response with the given body.
    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut resp = Self::new(status);
        resp.set_body("text/plain; charset=utf-8", body);
        resp
    }

    pub fn set_body(&mut self, content_type: &'static str, body: impl Into<Bytes>) {
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.body = body.into();
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn connection_close(&self) -> bool {
        if has_token(self.headers.get_all(CONNECTION), "close") {
            return true;
        }
        self.version == Version::HTTP_10 && !has_token(self.headers.get_all(CONNECTION), "keep-alive")
    }

    pub fn set_connection_close(&mut self) {
        self.headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    /// Resets to an empty 200 response, keeping header map capacity.
    pub fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.body = Bytes::new();
        self.skip_body = false;
    }

    fn has_no_body(status: StatusCode) -> bool {
        status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
    }

    /// Reads a complete response. `skip_body` must be set for responses to
    /// HEAD requests. Informational responses other than `101` are skipped.
    pub async fn read_from<R>(
        reader: &mut R,
        buf: &mut BytesMut,
        limits: Limits,
        skip_body: bool,
    ) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            let mut resp = Self::read_head(reader, buf, limits.max_head).await?;
            if resp.status.is_informational() && resp.status != StatusCode::SWITCHING_PROTOCOLS {
                continue;
            }
            let kind = if skip_body || Self::has_no_body(resp.status) {
                BodyKind::Empty
            } else {
                framing::body_kind(&resp.headers, BodyKind::UntilClose)?
            };
            resp.body = framing::read_body(reader, buf, kind, limits.max_body).await?;
            resp.skip_body = skip_body;
            return Ok(resp);
        }
    }

    async fn read_head<R>(reader: &mut R, buf: &mut BytesMut, max_head: usize) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if !buf.is_empty() {
                let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut parsed = httparse::Response::new(&mut raw);
                if let httparse::Status::Complete(len) = parsed.parse(buf)? {
                    if len > max_head {
                        return Err(CodecError::HeaderTooLarge { limit: max_head });
                    }
                    let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
                        .map_err(|e| CodecError::Malformed(e.to_string()))?;
                    let resp = Self {
                        status,
                        version: framing::parsed_version(parsed.version),
                        headers: framing::parse_headers(parsed.headers)?,
                        body: Bytes::new(),
                        skip_body: false,
                    };
                    buf.advance(len);
                    return Ok(resp);
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

    /// Serializes the response into `dst`. `server_name` is sent as `Server`
    /// when the response carries none; the response itself is not modified.
    pub fn write_to(&self, dst: &mut BytesMut, server_name: Option<&HeaderValue>) {
        let reason = self.status.canonical_reason().unwrap_or("Unknown");
        dst.extend_from_slice(framing::version_str(self.version).as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(self.status.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(reason.as_bytes());
        dst.extend_from_slice(b"\r\n");

        if !self.headers.contains_key(SERVER) {
            if let Some(name) = server_name {
                framing::write_header(dst, b"Server", name.as_bytes());
            }
        }
        framing::write_headers(dst, &self.headers);
        let bodyless = Self::has_no_body(self.status);
        if !bodyless {
            framing::write_content_length(dst, self.body.len());
        }
        dst.extend_from_slice(b"\r\n");
        if !bodyless && !self.skip_body {
            dst.extend_from_slice(&self.body);
        }
    }
}
