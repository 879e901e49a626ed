//! Egress subsystem: executing requests against origins.
//!
//! # Data Flow
//! ```text
//! OutboundRequest (normalized, https)
//!     → forwarder.rs (shared deadline, fallback decision)
//!     → http3.rs (fast attempt: HTTP/3 over QUIC)
//!     → compat.rs (fallback: HTTP/2 or HTTP/1.1 over TLS)
//!     → TunnelResponse (status, headers, buffered body, protocol used)
//! ```
//!
//! # Design Decisions
//! - Clients are fields of the forwarder, fixed at construction; no globals
//! - Fallback happens on failure, never on deadline expiry
//! - Response bodies are buffered up to `max_response_bytes`

pub mod compat;
pub mod forwarder;
pub mod http3;

use std::future::Future;
use std::time::Duration;

use http::header::{self, HeaderMap};
use thiserror::Error;

use crate::config::EgressConfig;
use crate::error::TunnelError;
use crate::http::message::{OutboundRequest, TunnelResponse};

pub use compat::CompatClient;
pub use forwarder::Forwarder;
pub use http3::Http3Client;

/// The forwarder wired with the production clients.
pub type DefaultForwarder = Forwarder<Http3Client, CompatClient>;

/// Failures of a single egress attempt.
#[derive(Debug, Error)]
pub enum EgressError {
    /// The client cannot carry this request at all.
    #[error("{protocol} unsupported: {reason}")]
    Unsupported { protocol: &'static str, reason: String },

    /// Resolving or connecting to the origin failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// The request could not be sent or the response not received.
    #[error("request error: {0}")]
    Request(String),

    /// The origin's response body exceeded the configured bound.
    #[error("response body exceeds {0} bytes")]
    TooLarge(usize),

    /// Both attempts of the fallback chain failed.
    #[error("fast attempt: {fast}; compatible attempt: {compatible}")]
    Exhausted {
        fast: Box<EgressError>,
        compatible: Box<EgressError>,
    },

    /// The client was closed.
    #[error("egress client closed")]
    Closed,
}

/// One protocol-specific way of reaching an origin.
pub trait EgressClient: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    fn send(&self, request: &OutboundRequest) -> impl Future<Output = Result<TunnelResponse, EgressError>> + Send;

    /// Release pooled connections. Idempotent.
    fn close(&self);
}

/// Headers to send to the origin; authority travels in the URI.
pub(crate) fn origin_headers(request: &OutboundRequest) -> HeaderMap {
    let mut headers = request.headers().clone();
    headers.remove(header::HOST);
    headers
}

/// Build the production forwarder from the `[egress]` section.
pub fn build_forwarder(
    config: &EgressConfig,
    max_response_bytes: usize,
    timeout: Duration,
) -> Result<DefaultForwarder, TunnelError> {
    let fast = if config.enable_http3 {
        Http3Client::new(config.insecure_skip_verify, max_response_bytes)?
    } else {
        Http3Client::disabled()
    };
    let compatible = CompatClient::new(config.insecure_skip_verify, max_response_bytes)
        .map_err(|e| TunnelError::Tls(e.to_string()))?;
    Ok(Forwarder::new(fast, compatible, timeout))
}
