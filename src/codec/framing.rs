//! Body framing shared by requests and responses.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{has_token, CodecError};

const READ_CHUNK: usize = 4096;

/// How the body of a message is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Empty,
    Fixed(usize),
    Chunked,
    UntilClose,
}

/// Determines body framing from headers. `Content-Length` wins over nothing,
/// `Transfer-Encoding: chunked` wins over `Content-Length`.
pub(crate) fn body_kind(headers: &HeaderMap, default: BodyKind) -> Result<BodyKind, CodecError> {
    if has_token(headers.get_all(TRANSFER_ENCODING), "chunked") {
        return Ok(BodyKind::Chunked);
    }
    match headers.get(CONTENT_LENGTH) {
        Some(value) => {
            let len = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| CodecError::Malformed("invalid content-length".into()))?;
            Ok(if len == 0 {
                BodyKind::Empty
            } else {
                BodyKind::Fixed(len)
            })
        }
        None => Ok(default),
    }
}

/// Reads more bytes into `buf`, returning how many arrived. 0 means EOF.
pub(crate) async fn read_more<R>(reader: &mut R, buf: &mut BytesMut) -> Result<usize, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if buf.capacity() - buf.len() < READ_CHUNK {
        buf.reserve(READ_CHUNK);
    }
    Ok(reader.read_buf(buf).await?)
}

fn check_limit(len: usize, max_body: usize) -> Result<(), CodecError> {
    if max_body > 0 && len > max_body {
        return Err(CodecError::BodyTooLarge { limit: max_body });
    }
    Ok(())
}

pub(crate) async fn read_body<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    kind: BodyKind,
    max_body: usize,
) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match kind {
        BodyKind::Empty => Ok(Bytes::new()),
        BodyKind::Fixed(len) => {
            check_limit(len, max_body)?;
            // the buffer grows with arriving bytes, never by the announced length
            while buf.len() < len {
                if read_more(reader, buf).await? == 0 {
                    return Err(CodecError::UnexpectedEof);
                }
            }
            Ok(buf.split_to(len).freeze())
        }
        BodyKind::Chunked => read_chunked(reader, buf, max_body).await,
        BodyKind::UntilClose => {
            while read_more(reader, buf).await? > 0 {
                check_limit(buf.len(), max_body)?;
            }
            Ok(buf.split().freeze())
        }
    }
}

/// Takes one CRLF terminated line off the front of `buf`, reading as needed.
async fn take_line<R>(reader: &mut R, buf: &mut BytesMut, max_line: usize) -> Result<BytesMut, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos);
            buf.advance(2);
            return Ok(line);
        }
        if buf.len() > max_line {
            return Err(CodecError::Malformed("chunk line too long".into()));
        }
        if read_more(reader, buf).await? == 0 {
            return Err(CodecError::UnexpectedEof);
        }
    }
}

async fn read_chunked<R>(reader: &mut R, buf: &mut BytesMut, max_body: usize) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    const MAX_LINE: usize = 4096;
    let mut body = BytesMut::new();
    loop {
        let line = take_line(reader, buf, MAX_LINE).await?;
        let size_field = line[..].split(|b| *b == b';').next().unwrap_or_default();
        let size_str = std::str::from_utf8(size_field)
            .map_err(|_| CodecError::Malformed("invalid chunk size".into()))?;
        let size = usize::from_str_radix(size_str.trim(), 16)
            .map_err(|_| CodecError::Malformed("invalid chunk size".into()))?;

        if size == 0 {
            // trailers end with an empty line
            loop {
                if take_line(reader, buf, MAX_LINE).await?.is_empty() {
                    return Ok(body.freeze());
                }
            }
        }

        let total = body
            .len()
            .checked_add(size)
            .ok_or_else(|| CodecError::Malformed("chunk size overflow".into()))?;
        check_limit(total, max_body)?;

        let mut remaining = size;
        while remaining > 0 {
            if buf.is_empty() && read_more(reader, buf).await? == 0 {
                return Err(CodecError::UnexpectedEof);
            }
            let n = remaining.min(buf.len());
            body.extend_from_slice(&buf[..n]);
            buf.advance(n);
            remaining -= n;
        }
        while buf.len() < 2 {
            if read_more(reader, buf).await? == 0 {
                return Err(CodecError::UnexpectedEof);
            }
        }
        if &buf[..2] != b"\r\n" {
            return Err(CodecError::Malformed("missing chunk terminator".into()));
        }
        buf.advance(2);
    }
}

/// Writes all headers except the framing ones, which the encoder owns.
pub(crate) fn write_headers(dst: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        write_header(dst, name.as_str().as_bytes(), value.as_bytes());
    }
}

pub(crate) fn write_header(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.extend_from_slice(name);
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value);
    dst.extend_from_slice(b"\r\n");
}

pub(crate) fn write_content_length(dst: &mut BytesMut, len: usize) {
    write_header(dst, b"Content-Length", len.to_string().as_bytes());
}

pub(crate) fn version_str(version: http::Version) -> &'static str {
    if version == http::Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

pub(crate) fn parsed_version(minor: Option<u8>) -> http::Version {
    match minor {
        Some(0) => http::Version::HTTP_10,
        _ => http::Version::HTTP_11,
    }
}

pub(crate) fn parse_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, CodecError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = http::HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let value =
            http::HeaderValue::from_bytes(header.value).map_err(|e| CodecError::Malformed(e.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunked_body_with_extension_and_trailer() {
        let mut wire: &[u8] = b"";
        let mut buf = BytesMut::from(&b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: a\r\n\r\nNEXT"[..]);
        let body = read_body(&mut wire, &mut buf, BodyKind::Chunked, 0).await.unwrap();
        assert_eq!(&body[..], b"Wikipedia");
        assert_eq!(&buf[..], b"NEXT");
    }

    #[tokio::test]
    async fn chunked_body_respects_limit() {
        let mut wire: &[u8] = b"";
        let mut buf = BytesMut::from(&b"a\r\n0123456789\r\n0\r\n\r\n"[..]);
        let err = read_body(&mut wire, &mut buf, BodyKind::Chunked, 4).await.unwrap_err();
        assert!(matches!(err, CodecError::BodyTooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn fixed_body_reads_across_chunks() {
        let mut wire: &[u8] = b"lo world";
        let mut buf = BytesMut::from(&b"hel"[..]);
        let body = read_body(&mut wire, &mut buf, BodyKind::Fixed(11), 0).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn fixed_body_truncated() {
        let mut wire: &[u8] = b"abc";
        let mut buf = BytesMut::new();
        let err = read_body(&mut wire, &mut buf, BodyKind::Fixed(10), 0).await.unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof));
    }

    #[tokio::test]
    async fn huge_content_length_fails_without_allocating_it() {
        let mut wire: &[u8] = b"only a few bytes";
        let mut buf = BytesMut::new();
        let err = read_body(&mut wire, &mut buf, BodyKind::Fixed(1 << 60), 0).await.unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof));
        assert!(buf.capacity() < 1 << 20);
    }

    #[tokio::test]
    async fn overflowing_chunk_size_is_malformed() {
        let mut wire: &[u8] = b"";
        let mut buf = BytesMut::from(&b"1\r\nx\r\nffffffffffffffff\r\n"[..]);
        let err = read_body(&mut wire, &mut buf, BodyKind::Chunked, 0).await.unwrap_err();
        assert!(matches!(err, CodecError::Malformed(ref msg) if msg == "chunk size overflow"), "got {err:?}");
    }

    #[tokio::test]
    async fn huge_chunk_is_read_incrementally() {
        let mut wire: &[u8] = b"partial data";
        let mut buf = BytesMut::from(&b"fffffffffffffff\r\n"[..]);
        let err = read_body(&mut wire, &mut buf, BodyKind::Chunked, 0).await.unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof));
        assert!(buf.capacity() < 1 << 20);
    }

    #[test]
    fn chunked_beats_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "5".parse().unwrap());
        headers.insert(TRANSFER_ENCODING, "gzip, chunked".parse().unwrap());
        assert_eq!(body_kind(&headers, BodyKind::Empty).unwrap(), BodyKind::Chunked);
    }
}
