//! Error taxonomy for the tunnel pipeline.
//!
//! # Design Decisions
//! - Listener-level failures (`Listen`, fatal `Accept`) are the only errors that
//!   leave `run`; everything else terminates a single exchange
//! - `DeadlineExceeded` is distinct from `Forward` so the forwarder can decide
//!   whether a fallback attempt is warranted

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::egress::EgressError;

/// Errors produced while parsing HTTP/1.x framing off a stream.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The peer closed the stream without sending anything.
    #[error("empty message")]
    Empty,

    /// The peer closed the stream before a complete message arrived.
    #[error("incomplete message after {0} bytes")]
    Incomplete(usize),

    /// The buffered bytes exceeded the configured bound before the message completed.
    #[error("message exceeds {0} byte limit")]
    TooLarge(usize),

    /// The header section is not valid HTTP/1.x.
    #[error("malformed header section: {0}")]
    Malformed(#[from] httparse::Error),

    /// The method token could not be parsed.
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// The request target is not a valid URI.
    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    /// The status code is out of range.
    #[error("invalid status code: {0}")]
    InvalidStatus(u16),

    /// A header value could not be interpreted.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// A chunked body is malformed.
    #[error("invalid chunked body: {0}")]
    InvalidChunk(&'static str),

    /// Neither the request target nor the Host header names an authority.
    #[error("request has no host")]
    MissingHost,
}

/// Errors surfaced by the tunnel pipeline.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Binding a listening socket failed. Fatal at startup.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The listener stopped yielding connections.
    #[error("accept failed: {0}")]
    Accept(String),

    /// A read, write or forward did not finish in time.
    #[error("{operation} deadline of {timeout:?} exceeded")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },

    /// The request or response framing was invalid.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Every egress attempt failed.
    #[error("forward to {authority} failed: {source}")]
    Forward {
        authority: String,
        #[source]
        source: EgressError,
    },

    /// Establishing a QUIC connection to the remote tunnel failed.
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Opening, reading or writing a QUIC stream failed.
    #[error("stream error with {remote}: {reason}")]
    Stream { remote: SocketAddr, reason: String },

    /// TLS material or crypto configuration is unusable.
    #[error("TLS error: {0}")]
    Tls(String),

    /// `run` or `shutdown` was invoked more than once.
    #[error("shutdown error: {0}")]
    Shutdown(&'static str),

    /// Socket-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Short stable label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::Listen { .. } => "listen",
            TunnelError::Accept(_) => "accept",
            TunnelError::DeadlineExceeded { .. } => "deadline_exceeded",
            TunnelError::Parse(_) => "parse",
            TunnelError::Forward { .. } => "forward",
            TunnelError::Connect { .. } => "connect",
            TunnelError::Stream { .. } => "stream",
            TunnelError::Tls(_) => "tls",
            TunnelError::Shutdown(_) => "shutdown",
            TunnelError::Io(_) => "io",
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, TunnelError::DeadlineExceeded { .. })
    }
}
