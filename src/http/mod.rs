//! HTTP message handling subsystem.
//!
//! # Data Flow
//! ```text
//! Byte stream (QUIC stream or ingress TCP connection)
//!     → codec.rs (bounded incremental read, body framing)
//!     → message.rs (parse InboundRequest, normalize to OutboundRequest)
//!     → processor.rs (hand to a RequestForwarder, write TunnelResponse back)
//! ```
//!
//! # Design Decisions
//! - Only `InboundRequest::normalize` produces an `OutboundRequest`, so a
//!   request cannot be forwarded without being normalized exactly once
//! - Bodies are fully buffered as `Bytes` and can be re-read freely

pub mod codec;
pub mod message;
pub mod processor;

pub use message::{InboundRequest, OutboundRequest, Protocol, TunnelResponse, TUNNEL_PROTOCOL_HEADER};
pub use processor::{ExchangeSummary, RequestForwarder, StreamProcessor};
