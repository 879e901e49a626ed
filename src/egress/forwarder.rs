//! Protocol fallback chain.
//!
//! # Responsibilities
//! - Run the fast client, then the compatible client, under one deadline
//! - Decide whether a failed fast attempt warrants a fallback
//!
//! # Design Decisions
//! - The deadline is computed once per request and shared by both attempts
//! - Deadline expiry ends the request; only other failures fall back
//! - The request is borrowed by both attempts, so the fallback sees the
//!   same method, URI, headers and body

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::egress::{EgressClient, EgressError};
use crate::error::TunnelError;
use crate::http::message::{OutboundRequest, TunnelResponse};
use crate::http::processor::RequestForwarder;
use crate::observability::metrics;
use crate::resilience::until_deadline;

#[derive(Debug)]
pub struct Forwarder<F, C> {
    fast: F,
    compatible: C,
    timeout: Duration,
    closed: AtomicBool,
}

impl<F: EgressClient, C: EgressClient> Forwarder<F, C> {
    pub fn new(fast: F, compatible: C, timeout: Duration) -> Self {
        Self {
            fast,
            compatible,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    fn deadline_exceeded(&self) -> TunnelError {
        TunnelError::DeadlineExceeded {
            operation: "forward",
            timeout: self.timeout,
        }
    }

    /// One attempt with `client`, bounded by the shared `deadline`.
    ///
    /// The outer error is deadline expiry; the inner one is the client's own failure.
    async fn attempt<E: EgressClient>(
        &self,
        client: &E,
        request: &OutboundRequest,
        deadline: Instant,
    ) -> Result<Result<TunnelResponse, EgressError>, TunnelError> {
        let url = request.uri();
        let result = until_deadline("forward", deadline, self.timeout, async {
            Ok::<_, TunnelError>(client.send(request).await)
        })
        .await;

        match &result {
            Ok(Ok(response)) => {
                metrics::record_egress_attempt(client.name(), "ok");
                info!(protocol = %response.protocol, url = %url, status = response.status.as_u16(), "Successfully sent request");
            }
            Ok(Err(EgressError::Unsupported { .. })) => metrics::record_egress_attempt(client.name(), "unsupported"),
            Ok(Err(_)) => metrics::record_egress_attempt(client.name(), "error"),
            Err(_) => {
                metrics::record_egress_attempt(client.name(), "deadline_exceeded");
                warn!(url = %url, "Request timed out");
            }
        }
        result
    }

    /// Execute `request` against its origin.
    pub async fn forward(&self, request: &OutboundRequest) -> Result<TunnelResponse, TunnelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Shutdown("forwarder is closed"));
        }

        let deadline = Instant::now() + self.timeout;
        let url = request.uri();

        let fast_error = match self.attempt(&self.fast, request, deadline).await? {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        if Instant::now() >= deadline {
            warn!(url = %url, error = %fast_error, "Request timed out");
            return Err(self.deadline_exceeded());
        }

        if let EgressError::Unsupported { .. } = fast_error {
            debug!(url = %url, reason = %fast_error, "Sending with HTTP/2 or HTTP/1.1");
        } else {
            warn!(url = %url, error = %fast_error, "HTTP/3 not available, falling back to HTTP/2 or HTTP/1.1");
            metrics::record_fallback();
        }

        match self.attempt(&self.compatible, request, deadline).await? {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to send request with HTTP/2 or HTTP/1.1");
                Err(TunnelError::Forward {
                    authority: request.authority().to_string(),
                    source: EgressError::Exhausted {
                        fast: Box::new(fast_error),
                        compatible: Box::new(e),
                    },
                })
            }
        }
    }

    /// Release both clients. Calling it again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fast.close();
        self.compatible.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<F: EgressClient, C: EgressClient> RequestForwarder for Forwarder<F, C> {
    async fn forward(&self, request: OutboundRequest) -> Result<TunnelResponse, TunnelError> {
        Forwarder::forward(self, &request).await
    }
}
