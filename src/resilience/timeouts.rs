//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap stream reads, stream writes and egress round-trips with a deadline
//! - Translate elapsed deadlines into `TunnelError::DeadlineExceeded`
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - A deadline is an absolute instant so a fallback attempt shares the
//!   budget of the attempt before it

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::error::TunnelError;

/// Per-operation deadlines for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub read: Duration,
    pub write: Duration,
}

impl Deadlines {
    /// Use the same duration for reads and writes.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            read: timeout,
            write: timeout,
        }
    }
}

impl Default for Deadlines {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(15))
    }
}

/// Run `fut` with a relative timeout.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, TunnelError>
where
    F: Future<Output = Result<T, TunnelError>>,
{
    match time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::DeadlineExceeded { operation, timeout }),
    }
}

/// Run `fut` until an absolute deadline. `budget` is only used for reporting.
pub async fn until_deadline<T, F>(
    operation: &'static str,
    deadline: Instant,
    budget: Duration,
    fut: F,
) -> Result<T, TunnelError>
where
    F: Future<Output = Result<T, TunnelError>>,
{
    match time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::DeadlineExceeded {
            operation,
            timeout: budget,
        }),
    }
}
