//! HTTP/2 and HTTP/1.1 egress client.
//!
//! # Responsibilities
//! - Send requests over TLS, negotiating `h2` or `http/1.1` via ALPN
//! - Buffer the response body up to the configured bound
//!
//! # Design Decisions
//! - Redirects are returned to the caller, not followed
//! - Bodies pass through undecoded

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;

use crate::egress::{origin_headers, EgressClient, EgressError};
use crate::http::message::{OutboundRequest, Protocol, TunnelResponse};

#[derive(Debug)]
pub struct CompatClient {
    client: reqwest::Client,
    max_response_bytes: usize,
    closed: AtomicBool,
}

impl CompatClient {
    pub fn new(insecure: bool, max_response_bytes: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(insecure)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            max_response_bytes,
            closed: AtomicBool::new(false),
        })
    }
}

fn classify(e: reqwest::Error) -> EgressError {
    if e.is_connect() {
        EgressError::Connect(e.to_string())
    } else {
        EgressError::Request(e.to_string())
    }
}

impl EgressClient for CompatClient {
    fn name(&self) -> &'static str {
        "compat"
    }

    async fn send(&self, request: &OutboundRequest) -> Result<TunnelResponse, EgressError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EgressError::Closed);
        }

        let mut response = self
            .client
            .request(request.method().clone(), request.uri().to_string())
            .headers(origin_headers(request))
            .body(request.body().clone())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let protocol = Protocol::from_version(response.version());
        let headers = std::mem::take(response.headers_mut());

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(EgressError::TooLarge(self.max_response_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(TunnelResponse::new(status, protocol, headers, body.freeze()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
