//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Stream read / stream write / egress round-trip:
//!     → timeouts.rs (enforce per-operation deadline)
//!     → On expiry: TunnelError::DeadlineExceeded, exchange terminated
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Per-request deadlines fire regardless of process shutdown

pub mod timeouts;

pub use timeouts::{with_timeout, until_deadline, Deadlines};
