//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define tunnel metrics (exchanges, latency, egress attempts, failures)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `tunnel_exchanges_total` (counter): finished exchanges by side, outcome
//! - `tunnel_exchange_duration_seconds` (histogram): exchange latency by side
//! - `tunnel_active_exchanges` (gauge): exchanges currently in flight
//! - `tunnel_egress_attempts_total` (counter): egress attempts by protocol client, outcome
//! - `tunnel_egress_fallbacks_total` (counter): requests that fell back to the compatible client
//! - `tunnel_stream_failures_total` (counter): handler failures contained by the transport
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Without an installed recorder every call is a no-op

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

/// Record one finished exchange. `outcome` is `"ok"` or an error kind.
pub fn record_exchange(side: &'static str, outcome: &'static str, start: Instant) {
    counter!("tunnel_exchanges_total", "side" => side, "outcome" => outcome).increment(1);
    histogram!("tunnel_exchange_duration_seconds", "side" => side).record(start.elapsed().as_secs_f64());
}

pub fn exchange_started() {
    gauge!("tunnel_active_exchanges").increment(1.0);
}

pub fn exchange_finished() {
    gauge!("tunnel_active_exchanges").decrement(1.0);
}

pub fn record_egress_attempt(client: &'static str, outcome: &'static str) {
    counter!("tunnel_egress_attempts_total", "client" => client, "outcome" => outcome).increment(1);
}

pub fn record_fallback() {
    counter!("tunnel_egress_fallbacks_total").increment(1);
}

pub fn record_stream_failure(kind: &'static str) {
    counter!("tunnel_stream_failures_total", "kind" => kind).increment(1);
}
