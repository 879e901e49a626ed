//! In-flight exchange tracking.
//!
//! # Responsibilities
//! - Count exchanges that are currently being processed
//! - Generate unique exchange sequence numbers for tracing
//! - Let shutdown wait (bounded) for in-flight exchanges to drain

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::observability::metrics;

/// Global atomic counter for exchange sequence numbers.
static EXCHANGE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Interval between drain checks.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Tracks active exchanges for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ExchangeTracker {
    active_count: Arc<AtomicU64>,
}

impl ExchangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active exchange. Returns a guard that decrements on drop.
    pub fn track(&self) -> ExchangeGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        metrics::exchange_started();
        ExchangeGuard {
            active_count: Arc::clone(&self.active_count),
            seq: EXCHANGE_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until no exchange is active or `timeout` elapses.
    ///
    /// Returns `true` when everything drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            while self.active_count.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Guard that tracks an exchange's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ExchangeGuard {
    active_count: Arc<AtomicU64>,
    seq: u64,
}

impl ExchangeGuard {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        metrics::exchange_finished();
        tracing::trace!(exchange_seq = self.seq, "Exchange finished");
    }
}
