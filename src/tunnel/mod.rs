//! Tunnel endpoints.
//!
//! # Data Flow
//! ```text
//! local app → client.rs (ingress accept, StreamProcessor)
//!     → dialer.rs (pooled QUIC connection, one stream per exchange)
//!     → QUIC
//!     → server.rs (QuicListener, StreamProcessor)
//!     → egress::Forwarder → origin
//! ```
//!
//! # Design Decisions
//! - Both endpoints run the same StreamProcessor; only the forwarder differs
//! - `run` and `shutdown` may each be called once per endpoint

pub mod client;
pub mod dialer;
pub mod server;

use std::time::Duration;

use crate::config::TunnelConfig;
use crate::resilience::Deadlines;

pub use client::TunnelClient;
pub use dialer::TunnelDialer;
pub use server::TunnelServer;

/// Per-exchange settings shared by both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub deadlines: Deadlines,
    pub max_request_bytes: usize,
    pub max_response_bytes: usize,
    pub drain_timeout: Duration,
}

impl ExchangeOptions {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            deadlines: Deadlines::uniform(config.timeouts.operation()),
            max_request_bytes: config.limits.max_request_bytes,
            max_response_bytes: config.limits.max_response_bytes,
            drain_timeout: config.timeouts.drain(),
        }
    }
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self::from_config(&TunnelConfig::default())
    }
}
