//! Bounded, incremental reading of HTTP/1.x messages.
//!
//! # Responsibilities
//! - Accumulate bytes from a stream until a complete message is parsable
//! - Stop at end-of-stream or at the configured size bound
//! - Decode message body framing (`content-length`, chunked)

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ParseError, TunnelError};

/// Size of each individual read from the stream.
const READ_CHUNK: usize = 4096;

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    /// Responses without framing run until the peer closes.
    UntilEof,
}

/// Determine body framing from the header section.
pub fn body_framing(headers: &HeaderMap, is_request: bool) -> Result<BodyFraming, ParseError> {
    if let Some(te) = headers.get(header::TRANSFER_ENCODING) {
        let te = te.to_str().map_err(|e| ParseError::InvalidHeader {
            name: "transfer-encoding".into(),
            reason: e.to_string(),
        })?;
        let chunked = te
            .rsplit(',')
            .next()
            .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        return match (chunked, is_request) {
            (true, _) => Ok(BodyFraming::Chunked),
            (false, true) => Err(ParseError::InvalidHeader {
                name: "transfer-encoding".into(),
                reason: format!("unsupported coding {te:?}"),
            }),
            (false, false) => Ok(BodyFraming::UntilEof),
        };
    }

    match headers.get(header::CONTENT_LENGTH) {
        Some(value) => {
            let len = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| ParseError::InvalidHeader {
                    name: "content-length".into(),
                    reason: format!("{:?} is not a length", value),
                })?;
            Ok(if len == 0 { BodyFraming::Empty } else { BodyFraming::Length(len) })
        }
        None if is_request => Ok(BodyFraming::Empty),
        None => Ok(BodyFraming::UntilEof),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decode a chunked body.
///
/// Returns the decoded body and the number of bytes consumed, or `None`
/// when the terminating chunk has not arrived yet.
pub fn decode_chunked(buf: &[u8]) -> Result<Option<(Bytes, usize)>, ParseError> {
    let mut body = BytesMut::new();
    let mut pos = 0usize;

    loop {
        let Some(line_len) = find_crlf(&buf[pos..]) else {
            return Ok(None);
        };
        let line = &buf[pos..pos + line_len];
        let size_part = match line.iter().position(|b| *b == b';') {
            Some(ext) => &line[..ext],
            None => line,
        };
        let size_str = std::str::from_utf8(size_part)
            .map_err(|_| ParseError::InvalidChunk("chunk size is not ascii"))?
            .trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ParseError::InvalidChunk("chunk size is not hex"))?;
        pos += line_len + 2;

        if size == 0 {
            // Trailer section ends with an empty line.
            loop {
                let Some(trailer_len) = find_crlf(&buf[pos..]) else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body.freeze(), pos)));
                }
            }
        }

        let data_end = pos
            .checked_add(size)
            .ok_or(ParseError::InvalidChunk("chunk size overflows"))?;
        let Some(terminator) = data_end.checked_add(2).and_then(|end| buf.get(data_end..end)) else {
            return Ok(None);
        };
        if terminator != b"\r\n" {
            return Err(ParseError::InvalidChunk("missing chunk terminator"));
        }
        body.extend_from_slice(&buf[pos..data_end]);
        pos = data_end + 2;
    }
}

/// Read one message from `reader`.
///
/// `parse` is called after every read with the bytes so far and an
/// end-of-stream flag; it returns `Ok(None)` while the message is incomplete.
/// End-of-stream is not an error by itself: it is handed to `parse`, which
/// decides whether the buffered bytes form a message. Reading more than
/// `limit` bytes without completing a message is a [`ParseError::TooLarge`].
pub async fn read_message<R, T, F>(reader: &mut R, limit: usize, mut parse: F) -> Result<T, TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
    F: FnMut(&[u8], bool) -> Result<Option<T>, ParseError>,
{
    let mut buf = BytesMut::with_capacity(limit.min(READ_CHUNK));
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let room = limit.saturating_sub(buf.len());
        // At the bound, one more byte decides between end-of-stream and overflow.
        let want = room.clamp(1, chunk.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return match parse(&buf, true)? {
                Some(message) => Ok(message),
                None if buf.is_empty() => Err(ParseError::Empty.into()),
                None => Err(ParseError::Incomplete(buf.len()).into()),
            };
        }
        if room == 0 {
            return Err(ParseError::TooLarge(limit).into());
        }

        buf.extend_from_slice(&chunk[..n]);
        if let Some(message) = parse(&buf, false)? {
            return Ok(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::{InboundRequest, TunnelResponse};
    use http::HeaderValue;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn chunked_waits_for_terminator() {
        assert!(decode_chunked(b"5\r\nhel").unwrap().is_none());
        assert!(decode_chunked(b"5\r\nhello\r\n").unwrap().is_none());
        assert!(decode_chunked(b"5\r\nhello\r\n0\r\n").unwrap().is_none());

        let (body, used) = decode_chunked(b"5;ext=1\r\nhello\r\n0\r\nx-trailer: y\r\n\r\nextra")
            .unwrap()
            .unwrap();
        assert_eq!(&body[..], b"hello");
        assert_eq!(used, 35);
    }

    #[test]
    fn chunked_rejects_garbage() {
        assert!(matches!(decode_chunked(b"zz\r\n"), Err(ParseError::InvalidChunk(_))));
        assert!(matches!(decode_chunked(b"2\r\nabXY"), Err(ParseError::InvalidChunk(_))));
    }

    #[test]
    fn framing_prefers_transfer_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert_eq!(body_framing(&headers, true).unwrap(), BodyFraming::Length(10));

        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("gzip, chunked"));
        assert_eq!(body_framing(&headers, true).unwrap(), BodyFraming::Chunked);

        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("gzip"));
        assert!(body_framing(&headers, true).is_err());
        assert_eq!(body_framing(&headers, false).unwrap(), BodyFraming::UntilEof);
    }

    #[tokio::test]
    async fn reads_until_message_complete_without_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            client.write_all(b"Host: example.test\r\n\r\n").await.unwrap();
            // keep the write half open; the reader must not wait for EOF
            client
        });

        let req = read_message(&mut server, 4096, InboundRequest::parse).await.unwrap();
        assert_eq!(req.host(), Some("example.test"));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn empty_stream_is_a_parse_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_message(&mut server, 4096, InboundRequest::parse).await.unwrap_err();
        assert!(matches!(err, TunnelError::Parse(ParseError::Empty)));
    }

    #[tokio::test]
    async fn bound_is_enforced() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let _ = client.write_all(b"GET / HTTP/1.1\r\nX-Pad: ").await;
            let _ = client.write_all(&[b'a'; 200]).await;
        });
        let err = read_message(&mut server, 64, InboundRequest::parse).await.unwrap_err();
        assert!(matches!(err, TunnelError::Parse(ParseError::TooLarge(64))));
    }

    #[tokio::test]
    async fn message_of_exactly_the_bound_is_accepted() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nexactly";
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(raw).await.unwrap();
        drop(client);

        let resp = read_message(&mut server, raw.len(), |buf, eof| TunnelResponse::parse(buf, eof, false))
            .await
            .unwrap();
        assert_eq!(&resp.body[..], b"exactly");
    }

    #[tokio::test]
    async fn one_byte_past_the_bound_is_too_large() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nexactly!";
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(raw).await.unwrap();
        drop(client);

        let limit = raw.len() - 1;
        let err = read_message(&mut server, limit, |buf, eof| TunnelResponse::parse(buf, eof, false))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Parse(ParseError::TooLarge(l)) if l == limit));
    }

    #[tokio::test]
    async fn unframed_response_reads_to_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            client.write_all(b"HTTP/1.1 200 OK\r\n\r\npart one, ").await.unwrap();
            client.write_all(b"part two").await.unwrap();
        });
        let resp = read_message(&mut server, 1 << 16, |buf, eof| TunnelResponse::parse(buf, eof, false))
            .await
            .unwrap();
        assert_eq!(&resp.body[..], b"part one, part two");
    }
}
