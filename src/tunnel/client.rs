//! Tunnel client: local ingress listener in front of the dialer.
//!
//! # Responsibilities
//! - Accept local TCP connections under the connection limit
//! - Run one exchange per local connection through the tunnel
//! - Shut down and drop each local connection when its exchange ends

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::http::processor::StreamProcessor;
use crate::lifecycle::Shutdown;
use crate::net::{client_endpoint, tls, ConnectionPermit, ConnectionPool, ExchangeTracker, IngressListener};
use crate::observability::metrics;
use crate::tunnel::{ExchangeOptions, TunnelDialer};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The local end of the tunnel.
pub struct TunnelClient {
    listener: IngressListener,
    dialer: Arc<TunnelDialer>,
    processor: StreamProcessor,
    tracker: ExchangeTracker,
    options: ExchangeOptions,
    shutdown: Shutdown,
    started: AtomicBool,
    stopped: AtomicBool,
}

fn parse_addr(field: &str) -> Result<SocketAddr, TunnelError> {
    field.parse().map_err(|e| TunnelError::Listen {
        addr: field.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })
}

/// Resolve the tunnel server's `host:port`.
async fn resolve_server(address: &str) -> Result<SocketAddr, TunnelError> {
    let connect_error = |reason: String| TunnelError::Connect {
        addr: address.to_string(),
        reason,
    };
    let addr = tokio::net::lookup_host(address)
        .await
        .map_err(|e| connect_error(format!("failed to resolve: {e}")))?
        .next()
        .ok_or_else(|| connect_error("no addresses found".into()))?;
    debug!(server_address = address, resolved = %addr, "Resolved tunnel server");
    Ok(addr)
}

impl TunnelClient {
    /// Bind the ingress listener and prepare the dialer.
    pub async fn bind(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let options = ExchangeOptions::from_config(config);
        let listen_addr = parse_addr(&config.client.listen_address)?;
        let server_addr = resolve_server(&config.client.server_address).await?;

        let pool = ConnectionPool::new(
            client_endpoint(server_addr)?,
            tls::client_config_from(config)?,
            config.client.tls_server_name(),
            options.deadlines.write,
            config.client.pool_connections,
        );
        let dialer = TunnelDialer::new(pool, server_addr, options.deadlines, options.max_response_bytes);
        let listener = IngressListener::bind(listen_addr, config.client.max_connections).await?;
        Ok(Self::new(listener, dialer, options))
    }

    pub fn new(listener: IngressListener, dialer: TunnelDialer, options: ExchangeOptions) -> Self {
        Self {
            listener,
            dialer: Arc::new(dialer),
            processor: StreamProcessor::new(options.deadlines, options.max_request_bytes),
            tracker: ExchangeTracker::new(),
            options,
            shutdown: Shutdown::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept local connections until `shutdown` fires or
    /// [`TunnelClient::shutdown`] is called.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), TunnelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::Shutdown("client is already running"));
        }
        info!(
            address = ?self.listener.local_addr().ok(),
            server_addr = %self.dialer.server_addr(),
            "Tunnel client running"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                _ = shutdown.triggered() => {
                    self.shutdown.trigger();
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, peer, permit)) => {
                    tokio::spawn(serve_local(
                        tcp,
                        peer,
                        permit,
                        Arc::clone(&self.dialer),
                        self.processor.clone(),
                        self.tracker.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!("Stopped accepting local connections");
        Ok(())
    }

    /// Stop accepting, drain in-flight exchanges (bounded), close tunnel connections.
    pub async fn shutdown(&self) -> Result<(), TunnelError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::Shutdown("client is already shut down"));
        }
        self.shutdown.trigger();

        if !self.tracker.wait_for_drain(self.options.drain_timeout).await {
            warn!(
                remaining = self.tracker.active_count(),
                "Drain timeout reached, closing remaining exchanges"
            );
        }
        self.dialer.close();
        info!("Tunnel client stopped");
        Ok(())
    }
}

async fn serve_local(
    mut tcp: TcpStream,
    peer: SocketAddr,
    _permit: ConnectionPermit,
    dialer: Arc<TunnelDialer>,
    processor: StreamProcessor,
    tracker: ExchangeTracker,
) {
    let _guard = tracker.track();
    let start = Instant::now();

    match processor.process(&mut tcp, dialer.as_ref()).await {
        Ok(summary) => {
            metrics::record_exchange("client", "ok", start);
            info!(
                peer_addr = %peer,
                status = summary.status.as_u16(),
                protocol = %summary.protocol,
                body_bytes = summary.body_bytes,
                "Exchange complete"
            );
        }
        Err(e) => {
            metrics::record_exchange("client", e.kind(), start);
            warn!(peer_addr = %peer, error = %e, kind = e.kind(), "Exchange failed");
        }
    }

    // One exchange per local connection.
    let _ = tcp.shutdown().await;
}
