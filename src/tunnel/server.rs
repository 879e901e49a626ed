//! Tunnel server: QUIC listener + stream processor + egress forwarder.
//!
//! # Responsibilities
//! - Accept tunnel streams and run one exchange per stream
//! - Forward each request to its origin through the fallback chain
//! - Drain in-flight exchanges on shutdown, then release egress clients

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::egress::{self, CompatClient, EgressClient, Forwarder, Http3Client};
use crate::error::TunnelError;
use crate::http::processor::StreamProcessor;
use crate::lifecycle::Shutdown;
use crate::net::{tls, ExchangeTracker, QuicListener, ServeStats, StreamHandler, TunnelStream};
use crate::observability::metrics;
use crate::tunnel::ExchangeOptions;

struct ServerHandler<F, C> {
    processor: StreamProcessor,
    forwarder: Arc<Forwarder<F, C>>,
    tracker: ExchangeTracker,
}

impl<F, C> StreamHandler for ServerHandler<F, C>
where
    F: EgressClient + 'static,
    C: EgressClient + 'static,
{
    async fn handle(&self, mut stream: TunnelStream) -> Result<(), TunnelError> {
        let _guard = self.tracker.track();
        let start = Instant::now();
        let remote = stream.remote_addr();

        let result = self.processor.process(&mut stream, self.forwarder.as_ref()).await;
        stream.close();

        match result {
            Ok(summary) => {
                metrics::record_exchange("server", "ok", start);
                debug!(
                    remote_addr = %remote,
                    status = summary.status.as_u16(),
                    protocol = %summary.protocol,
                    "Exchange complete"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_exchange("server", e.kind(), start);
                Err(e)
            }
        }
    }
}

/// The remote end of the tunnel.
pub struct TunnelServer<F = Http3Client, C = CompatClient> {
    listener: QuicListener,
    handler: Arc<ServerHandler<F, C>>,
    options: ExchangeOptions,
    shutdown: Shutdown,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl TunnelServer<Http3Client, CompatClient> {
    /// Bind the QUIC listener and build the production forwarder.
    pub fn bind(config: &TunnelConfig) -> Result<Self, TunnelError> {
        let addr: SocketAddr = config
            .server
            .listen_address
            .parse()
            .map_err(|e| TunnelError::Listen {
                addr: config.server.listen_address.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?;
        let options = ExchangeOptions::from_config(config);
        let listener = QuicListener::bind(addr, tls::server_config_from(config)?)?;
        let forwarder = egress::build_forwarder(&config.egress, options.max_response_bytes, options.deadlines.read)?;
        Ok(Self::new(listener, forwarder, options))
    }
}

impl<F, C> TunnelServer<F, C>
where
    F: EgressClient + 'static,
    C: EgressClient + 'static,
{
    pub fn new(listener: QuicListener, forwarder: Forwarder<F, C>, options: ExchangeOptions) -> Self {
        let processor =
            StreamProcessor::new(options.deadlines, options.max_request_bytes).with_protocol_annotation(true);
        Self {
            listener,
            handler: Arc::new(ServerHandler {
                processor,
                forwarder: Arc::new(forwarder),
                tracker: ExchangeTracker::new(),
            }),
            options,
            shutdown: Shutdown::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ServeStats> {
        self.listener.stats()
    }

    pub fn active_exchanges(&self) -> u64 {
        self.handler.tracker.active_count()
    }

    /// Serve until `shutdown` fires or [`TunnelServer::shutdown`] is called.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), TunnelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::Shutdown("server is already running"));
        }
        info!(address = %self.local_addr(), "Tunnel server running");

        let token = self.shutdown.subscribe();
        tokio::select! {
            result = self.listener.serve(Arc::clone(&self.handler), token) => result,
            _ = shutdown.triggered() => {
                self.shutdown.trigger();
                Ok(())
            }
        }
    }

    /// Stop accepting, drain in-flight exchanges (bounded), close egress clients.
    pub async fn shutdown(&self) -> Result<(), TunnelError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::Shutdown("server is already shut down"));
        }
        self.shutdown.trigger();
        self.listener.close();

        let tracker = &self.handler.tracker;
        if tracker.wait_for_drain(self.options.drain_timeout).await {
            info!("All exchanges drained");
        } else {
            warn!(
                remaining = tracker.active_count(),
                "Drain timeout reached, closing remaining exchanges"
            );
        }

        self.handler.forwarder.close();
        self.listener.close_connections();
        info!("Tunnel server stopped");
        Ok(())
    }
}
