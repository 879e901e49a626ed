//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Tunnel server:
//!     UDP datagrams
//!     → transport.rs (QUIC endpoint, connection and stream accept loops)
//!     → stream.rs (one TunnelStream per exchange)
//!     → StreamHandler (tunnel server)
//!
//! Tunnel client:
//!     Local TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → pool.rs (reuse or dial a QUIC connection) → stream.rs
//!
//! Both sides:
//!     tls.rs (certificates, ALPN, trust policy)
//!     connection.rs (in-flight exchange tracking for graceful shutdown)
//! ```
//!
//! # Design Decisions
//! - Bounded accept on the ingress side prevents resource exhaustion
//! - Each exchange tracked for graceful shutdown
//! - One stream carries exactly one exchange

pub mod connection;
pub mod listener;
pub mod pool;
pub mod stream;
pub mod tls;
pub mod transport;

pub use connection::{ExchangeGuard, ExchangeTracker};
pub use listener::{ConnectionPermit, IngressListener};
pub use pool::{ConnectionPool, Lease};
pub use stream::TunnelStream;
pub use transport::{
    client_endpoint, contain_stream_failure, dial, open_stream, QuicListener, ServeStats, StreamFailurePolicy,
    StreamHandler,
};
