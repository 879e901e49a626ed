//! Single-exchange pipeline: read, parse, normalize, forward, write back.
//!
//! # Responsibilities
//! - Read one deadline-bounded request off a byte stream
//! - Normalize it and hand it to a [`RequestForwarder`]
//! - Serialize the response onto the same stream under a write deadline
//!
//! # Design Decisions
//! - Used on both sides of the tunnel: the server forwards to the egress
//!   forwarder, the client forwards to the tunnel dialer
//! - Each call owns its stream and buffers; nothing is shared between calls

use std::future::Future;
use std::sync::Arc;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, Instrument};
use uuid::Uuid;

use crate::error::TunnelError;
use crate::http::codec;
use crate::http::message::{InboundRequest, OutboundRequest, Protocol, TunnelResponse};
use crate::resilience::{with_timeout, Deadlines};

/// Number of body bytes included in trace-level response logs.
const BODY_PREVIEW_BYTES: usize = 256;

/// Something that turns a normalized request into a buffered response.
pub trait RequestForwarder: Send + Sync {
    fn forward(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<TunnelResponse, TunnelError>> + Send;
}

impl<T: RequestForwarder> RequestForwarder for Arc<T> {
    fn forward(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<TunnelResponse, TunnelError>> + Send {
        (**self).forward(request)
    }
}

/// Outcome of a successful exchange, for logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSummary {
    pub status: StatusCode,
    pub protocol: Protocol,
    pub body_bytes: usize,
}

/// Runs one request/response exchange over a byte stream.
#[derive(Debug, Clone)]
pub struct StreamProcessor {
    deadlines: Deadlines,
    max_request_bytes: usize,
    annotate_protocol: bool,
}

impl StreamProcessor {
    pub fn new(deadlines: Deadlines, max_request_bytes: usize) -> Self {
        Self {
            deadlines,
            max_request_bytes,
            annotate_protocol: false,
        }
    }

    /// Carry the egress protocol in the written response (tunnel server side).
    pub fn with_protocol_annotation(mut self, annotate: bool) -> Self {
        self.annotate_protocol = annotate;
        self
    }

    /// Process exactly one exchange on `stream`.
    ///
    /// The write half of `stream` is shut down after a successful write.
    pub async fn process<S, F>(&self, stream: &mut S, forwarder: &F) -> Result<ExchangeSummary, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
        F: RequestForwarder + ?Sized,
    {
        let exchange_id = Uuid::new_v4();
        self.run(stream, forwarder)
            .instrument(tracing::debug_span!("exchange", %exchange_id))
            .await
    }

    async fn run<S, F>(&self, stream: &mut S, forwarder: &F) -> Result<ExchangeSummary, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
        F: RequestForwarder + ?Sized,
    {
        let request = with_timeout(
            "read",
            self.deadlines.read,
            codec::read_message(stream, self.max_request_bytes, InboundRequest::parse),
        )
        .await?;

        let request = request.normalize()?;
        let head = request.is_head();
        debug!(method = %request.method(), uri = %request.uri(), "Forwarding request");

        let response = forwarder.forward(request).await?;
        info!(
            status = response.status.as_u16(),
            protocol = %response.protocol,
            headers = response.headers.len(),
            body_bytes = response.body.len(),
            "Received response"
        );
        trace!(body = %response.body_preview(BODY_PREVIEW_BYTES), "Response body");

        let wire = response.encode(head, self.annotate_protocol);
        with_timeout("write", self.deadlines.write, async {
            stream.write_all(&wire).await?;
            stream.flush().await?;
            stream.shutdown().await?;
            Ok::<(), TunnelError>(())
        })
        .await?;

        Ok(ExchangeSummary {
            status: response.status,
            protocol: response.protocol,
            body_bytes: response.body.len(),
        })
    }
}
