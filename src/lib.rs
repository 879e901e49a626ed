//! QUIC HTTP tunnel library.
//!
//! Carries HTTP/1.x exchanges from local TCP clients over multiplexed QUIC
//! streams to a remote tunnel server, which forwards them to origins with
//! HTTP/3 and falls back to HTTP/2 or HTTP/1.1.

// Core subsystems
pub mod config;
pub mod egress;
pub mod error;
pub mod http;
pub mod net;
pub mod tunnel;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::TunnelConfig;
pub use error::{ParseError, TunnelError};
pub use lifecycle::Shutdown;
pub use tunnel::{TunnelClient, TunnelServer};
