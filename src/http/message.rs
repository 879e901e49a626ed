//! Request and response messages carried through the tunnel.
//!
//! # Responsibilities
//! - Parse HTTP/1.x requests and responses from buffered bytes
//! - Normalize an inbound request into the canonical outbound form
//! - Serialize messages back to HTTP/1.1 wire format
//!
//! # Design Decisions
//! - `OutboundRequest` has private fields and is only produced by
//!   `InboundRequest::normalize`, so a request cannot be forwarded before it
//!   was normalized and cannot be normalized twice
//! - Bodies are fully materialized as `Bytes`; logging and write-back read the
//!   same immutable buffer

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, Scheme, Uri};
use http::{Method, StatusCode, Version};

use crate::error::ParseError;
use crate::http::codec::{self, BodyFraming};

/// Response header carrying the egress protocol across the tunnel hop.
pub const TUNNEL_PROTOCOL_HEADER: &str = "x-tunnel-protocol";

/// Maximum number of headers accepted in one message.
pub const MAX_HEADERS: usize = 64;

/// Connection-scoped headers that never cross a hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Application protocol a message actually travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http3,
    Http2,
    Http11,
    Http10,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http3 => "HTTP/3",
            Protocol::Http2 => "HTTP/2",
            Protocol::Http11 => "HTTP/1.1",
            Protocol::Http10 => "HTTP/1.0",
        }
    }

    pub fn from_version(version: Version) -> Self {
        match version {
            Version::HTTP_3 => Protocol::Http3,
            Version::HTTP_2 => Protocol::Http2,
            Version::HTTP_10 | Version::HTTP_09 => Protocol::Http10,
            _ => Protocol::Http11,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "HTTP/3" => Ok(Protocol::Http3),
            "HTTP/2" => Ok(Protocol::Http2),
            "HTTP/1.1" => Ok(Protocol::Http11),
            "HTTP/1.0" => Ok(Protocol::Http10),
            other => Err(ParseError::InvalidHeader {
                name: TUNNEL_PROTOCOL_HEADER.to_string(),
                reason: format!("unknown protocol {:?}", other),
            }),
        }
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| ParseError::InvalidHeader {
            name: h.name.to_string(),
            reason: e.to_string(),
        })?;
        let value = HeaderValue::from_bytes(h.value).map_err(|e| ParseError::InvalidHeader {
            name: h.name.to_string(),
            reason: e.to_string(),
        })?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn version_from_minor(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

/// A request as read off a stream or local connection, before normalization.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub target: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    /// Parse a request from `buf`; `Ok(None)` means more bytes are needed.
    ///
    /// `eof` signals that no more bytes will arrive.
    pub fn parse(buf: &[u8], eof: bool) -> Result<Option<Self>, ParseError> {
        if buf.is_empty() {
            return if eof { Err(ParseError::Empty) } else { Ok(None) };
        }

        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw);
        let header_len = match req.parse(buf)? {
            httparse::Status::Partial => {
                return if eof {
                    Err(ParseError::Incomplete(buf.len()))
                } else {
                    Ok(None)
                };
            }
            httparse::Status::Complete(len) => len,
        };

        let method_str = req.method.unwrap_or_default();
        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|_| ParseError::InvalidMethod(method_str.to_string()))?;
        let path = req.path.unwrap_or_default();
        let target = Uri::from_str(path).map_err(|e| ParseError::InvalidTarget(format!("{path}: {e}")))?;
        let version = version_from_minor(req.version);
        let headers = collect_headers(req.headers)?;

        let rest = &buf[header_len..];
        let body = match codec::body_framing(&headers, true)? {
            BodyFraming::Empty | BodyFraming::UntilEof => Bytes::new(),
            BodyFraming::Length(len) => match rest.get(..len) {
                Some(body) => Bytes::copy_from_slice(body),
                None if eof => return Err(ParseError::Incomplete(buf.len())),
                None => return Ok(None),
            },
            BodyFraming::Chunked => match codec::decode_chunked(rest)? {
                Some((body, _consumed)) => body,
                None if eof => return Err(ParseError::Incomplete(buf.len())),
                None => return Ok(None),
            },
        };

        Ok(Some(Self {
            method,
            target,
            version,
            headers,
            body,
        }))
    }

    /// The declared Host header, if any.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }

    /// Rewrite into the canonical outbound form.
    ///
    /// The scheme becomes `https`, the authority comes from the absolute
    /// target or else the Host header, and the request line is reduced to
    /// origin-form.
    pub fn normalize(self) -> Result<OutboundRequest, ParseError> {
        if self.method == Method::CONNECT {
            return Err(ParseError::InvalidTarget("CONNECT tunnels are not forwarded".into()));
        }

        let authority_str = match self.target.authority() {
            Some(authority) => authority.as_str().to_string(),
            None => self.host().ok_or(ParseError::MissingHost)?.to_string(),
        };
        let authority = Authority::from_str(&authority_str)
            .map_err(|e| ParseError::InvalidTarget(format!("{authority_str}: {e}")))?;

        let path_and_query = self
            .target
            .path_and_query()
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/");

        let uri = Uri::builder()
            .scheme(Scheme::HTTPS.as_str())
            .authority(authority.as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ParseError::InvalidTarget(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers.iter() {
            if is_hop_by_hop(name) || *name == header::HOST || *name == header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        let host = HeaderValue::from_str(authority.as_str()).map_err(|e| ParseError::InvalidHeader {
            name: "host".into(),
            reason: e.to_string(),
        })?;
        headers.insert(header::HOST, host);

        Ok(OutboundRequest {
            method: self.method,
            uri,
            authority,
            headers,
            body: self.body,
        })
    }
}

/// A normalized request ready for egress or for the tunnel hop.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    uri: Uri,
    authority: Authority,
    headers: HeaderMap,
    body: Bytes,
}

impl OutboundRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Absolute `https` URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Headers without hop-by-hop entries; always includes `host`.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
    }

    /// Serialize as an HTTP/1.1 origin-form request.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path_and_query().as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in self.headers.iter() {
            push_header(&mut out, name.as_str(), value.as_bytes());
        }
        let sends_length = !self.body.is_empty()
            || matches!(self.method, Method::POST | Method::PUT | Method::PATCH);
        if sends_length {
            push_header(&mut out, "content-length", self.body.len().to_string().as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

/// Statuses whose responses never carry a body.
fn is_bodyless(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

/// A fully buffered response from the origin or from the tunnel.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub protocol: Protocol,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TunnelResponse {
    pub fn new(status: StatusCode, protocol: Protocol, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            reason: None,
            protocol,
            headers,
            body,
        }
    }

    /// Reason phrase as received, else the canonical one.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}", self.status.as_u16(), self.reason())
    }

    /// Lossy UTF-8 view of the first `max` body bytes, for logging.
    pub fn body_preview(&self, max: usize) -> Cow<'_, str> {
        let end = self.body.len().min(max);
        String::from_utf8_lossy(&self.body[..end])
    }

    /// Parse a response from `buf`; `Ok(None)` means more bytes are needed.
    ///
    /// `head` marks a response to a HEAD request, which never has a body.
    /// The tunnel protocol annotation, when present, is stripped and used as
    /// the response's protocol.
    pub fn parse(buf: &[u8], eof: bool, head: bool) -> Result<Option<Self>, ParseError> {
        if buf.is_empty() {
            return if eof { Err(ParseError::Empty) } else { Ok(None) };
        }

        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut raw);
        let header_len = match res.parse(buf)? {
            httparse::Status::Partial => {
                return if eof {
                    Err(ParseError::Incomplete(buf.len()))
                } else {
                    Ok(None)
                };
            }
            httparse::Status::Complete(len) => len,
        };

        let code = res.code.unwrap_or_default();
        let status = StatusCode::from_u16(code).map_err(|_| ParseError::InvalidStatus(code))?;
        let reason = res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned);
        let version = version_from_minor(res.version);
        let mut headers = collect_headers(res.headers)?;

        let protocol = match headers.remove(TUNNEL_PROTOCOL_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|e| ParseError::InvalidHeader {
                    name: TUNNEL_PROTOCOL_HEADER.into(),
                    reason: e.to_string(),
                })?
                .parse()?,
            None => Protocol::from_version(version),
        };

        let rest = &buf[header_len..];
        let framing = if head || is_bodyless(status) {
            BodyFraming::Empty
        } else {
            codec::body_framing(&headers, false)?
        };
        let body = match framing {
            BodyFraming::Empty => Bytes::new(),
            BodyFraming::Length(len) => match rest.get(..len) {
                Some(body) => Bytes::copy_from_slice(body),
                None if eof => return Err(ParseError::Incomplete(buf.len())),
                None => return Ok(None),
            },
            BodyFraming::Chunked => match codec::decode_chunked(rest)? {
                Some((body, _consumed)) => body,
                None if eof => return Err(ParseError::Incomplete(buf.len())),
                None => return Ok(None),
            },
            BodyFraming::UntilEof if eof => Bytes::copy_from_slice(rest),
            BodyFraming::UntilEof => return Ok(None),
        };

        Ok(Some(Self {
            status,
            reason,
            protocol,
            headers,
            body,
        }))
    }

    /// Serialize as an HTTP/1.1 response.
    ///
    /// Hop-by-hop headers are dropped and the body is re-framed with
    /// `content-length`. With `annotate` the egress protocol travels in
    /// [`TUNNEL_PROTOCOL_HEADER`].
    pub fn encode(&self, head: bool, annotate: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.status_line().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            if is_hop_by_hop(name)
                || *name == header::CONTENT_LENGTH
                || name.as_str() == TUNNEL_PROTOCOL_HEADER
            {
                continue;
            }
            push_header(&mut out, name.as_str(), value.as_bytes());
        }
        if annotate {
            push_header(&mut out, TUNNEL_PROTOCOL_HEADER, self.protocol.as_str().as_bytes());
        }

        let bodyless = is_bodyless(self.status);
        if !bodyless {
            // A HEAD response only repeats a length the origin declared.
            match (self.headers.get(header::CONTENT_LENGTH), head) {
                (Some(declared), true) => push_header(&mut out, "content-length", declared.as_bytes()),
                (None, true) => {}
                (_, false) => push_header(&mut out, "content-length", self.body.len().to_string().as_bytes()),
            }
        }
        out.extend_from_slice(b"\r\n");
        if !head && !bodyless {
            out.extend_from_slice(&self.body);
        }
        out
    }
}
