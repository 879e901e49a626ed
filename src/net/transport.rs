//! QUIC transport: listening endpoint, accept loops and dial helpers.
//!
//! # Responsibilities
//! - Bind a QUIC endpoint and accept connections until shutdown
//! - Accept bidirectional streams per connection and hand each to a handler
//! - Contain handler failures so they never reach sibling streams
//! - Dial remote endpoints and open streams under a deadline
//!
//! # Data Flow
//! ```text
//! serve()
//!     → one task per connection (handshake, accept_bi loop)
//!     → one task per stream (StreamHandler::handle)
//!     → failure → contain_stream_failure (log, count, continue)
//! ```
//!
//! # Design Decisions
//! - Shutdown stops the accept loops only; in-flight stream tasks finish
//!   or hit their own deadlines
//! - Handshake and `accept_bi` failures end only their own connection task

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use quinn::{ConnectionError, VarInt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::net::stream::TunnelStream;
use crate::observability::metrics;
use crate::resilience::with_timeout;

/// Invoked once per accepted stream.
pub trait StreamHandler: Send + Sync + 'static {
    fn handle(&self, stream: TunnelStream) -> impl Future<Output = Result<(), TunnelError>> + Send;
}

/// What the transport does with an error returned by a [`StreamHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamFailurePolicy {
    /// Log with the remote address, count it, keep serving.
    #[default]
    LogAndContinue,
}

/// Counters describing what `serve` has done so far.
#[derive(Debug, Default)]
pub struct ServeStats {
    connections_accepted: AtomicU64,
    streams_accepted: AtomicU64,
    streams_completed: AtomicU64,
    streams_failed: AtomicU64,
    failures_by_kind: DashMap<&'static str, u64>,
}

impl ServeStats {
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn streams_accepted(&self) -> u64 {
        self.streams_accepted.load(Ordering::Relaxed)
    }

    pub fn streams_completed(&self) -> u64 {
        self.streams_completed.load(Ordering::Relaxed)
    }

    pub fn streams_failed(&self) -> u64 {
        self.streams_failed.load(Ordering::Relaxed)
    }

    /// Failed streams whose error had the given [`TunnelError::kind`].
    pub fn streams_failed_with(&self, kind: &str) -> u64 {
        self.failures_by_kind.get(kind).map_or(0, |count| *count)
    }
}

/// Apply `policy` to a failed stream.
pub fn contain_stream_failure(policy: StreamFailurePolicy, remote: SocketAddr, error: &TunnelError, stats: &ServeStats) {
    match policy {
        StreamFailurePolicy::LogAndContinue => {
            stats.streams_failed.fetch_add(1, Ordering::Relaxed);
            *stats.failures_by_kind.entry(error.kind()).or_insert(0) += 1;
            metrics::record_stream_failure(error.kind());
            warn!(remote_addr = %remote, error = %error, kind = error.kind(), "Stream failed");
        }
    }
}

/// A bound QUIC server endpoint.
#[derive(Debug)]
pub struct QuicListener {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    stats: Arc<ServeStats>,
    policy: StreamFailurePolicy,
    closed: AtomicBool,
}

impl QuicListener {
    /// Bind the UDP socket and start the endpoint.
    pub fn bind(addr: SocketAddr, config: quinn::ServerConfig) -> Result<Self, TunnelError> {
        let endpoint = quinn::Endpoint::server(config, addr).map_err(|source| TunnelError::Listen {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = endpoint.local_addr()?;

        info!(address = %local_addr, "QUIC listener bound");

        Ok(Self {
            endpoint,
            local_addr,
            stats: Arc::new(ServeStats::default()),
            policy: StreamFailurePolicy::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServeStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections and streams until `shutdown` fires.
    ///
    /// Returns `Ok(())` on shutdown and `TunnelError::Accept` when the
    /// endpoint stops yielding connections on its own.
    pub async fn serve<H: StreamHandler>(&self, handler: Arc<H>, shutdown: CancellationToken) -> Result<(), TunnelError> {
        loop {
            let incoming = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(address = %self.local_addr, "Stopped accepting connections");
                    return Ok(());
                }
                incoming = self.endpoint.accept() => incoming,
            };

            let Some(incoming) = incoming else {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                return Err(TunnelError::Accept(format!("endpoint {} is closed", self.local_addr)));
            };

            tokio::spawn(serve_connection(
                incoming,
                Arc::clone(&handler),
                Arc::clone(&self.stats),
                self.policy,
                shutdown.clone(),
            ));
        }
    }

    /// Stop accepting new connections. Open connections are left alone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.endpoint.set_server_config(None);
        debug!(address = %self.local_addr, "Listener closed");
    }

    /// Close every connection on the endpoint immediately.
    pub fn close_connections(&self) {
        self.close();
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}

async fn serve_connection<H: StreamHandler>(
    incoming: quinn::Incoming,
    handler: Arc<H>,
    stats: Arc<ServeStats>,
    policy: StreamFailurePolicy,
    shutdown: CancellationToken,
) {
    let remote = incoming.remote_address();
    let connection = match incoming.await {
        Ok(connection) => connection,
        Err(e) => {
            debug!(remote_addr = %remote, error = %e, "Handshake failed");
            return;
        }
    };
    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
    debug!(remote_addr = %remote, "Connection established");

    loop {
        let (send, recv) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = connection.accept_bi() => match accepted {
                Ok(pair) => pair,
                Err(ConnectionError::ApplicationClosed(_))
                | Err(ConnectionError::LocallyClosed)
                | Err(ConnectionError::TimedOut) => {
                    debug!(remote_addr = %remote, "Connection closed");
                    break;
                }
                Err(e) => {
                    warn!(remote_addr = %remote, error = %e, "Connection lost");
                    break;
                }
            },
        };
        stats.streams_accepted.fetch_add(1, Ordering::Relaxed);

        let handler = Arc::clone(&handler);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let stream = TunnelStream::new(send, recv, remote);
            match handler.handle(stream).await {
                Ok(()) => {
                    stats.streams_completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => contain_stream_failure(policy, remote, &e, &stats),
            }
        });
    }
}

/// Create a client-only endpoint suitable for reaching `remote`.
pub fn client_endpoint(remote: SocketAddr) -> Result<quinn::Endpoint, TunnelError> {
    let bind: SocketAddr = if remote.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    quinn::Endpoint::client(bind).map_err(|source| TunnelError::Listen {
        addr: bind.to_string(),
        source,
    })
}

/// Establish a connection, bounded by `timeout`.
pub async fn dial(
    endpoint: &quinn::Endpoint,
    config: &quinn::ClientConfig,
    addr: SocketAddr,
    server_name: &str,
    timeout: Duration,
) -> Result<quinn::Connection, TunnelError> {
    let connect_error = |reason: String| TunnelError::Connect {
        addr: addr.to_string(),
        reason,
    };
    let connecting = endpoint
        .connect_with(config.clone(), addr, server_name)
        .map_err(|e| connect_error(e.to_string()))?;

    let connection = with_timeout("connect", timeout, async {
        connecting.await.map_err(|e| connect_error(e.to_string()))
    })
    .await?;

    debug!(remote_addr = %addr, server_name, "Connected to tunnel server");
    Ok(connection)
}

/// Open a bidirectional stream on `connection`, bounded by `timeout`.
pub async fn open_stream(connection: &quinn::Connection, timeout: Duration) -> Result<TunnelStream, TunnelError> {
    let remote = connection.remote_address();
    with_timeout("open_stream", timeout, async {
        let (send, recv) = connection.open_bi().await.map_err(|e| TunnelError::Stream {
            remote,
            reason: e.to_string(),
        })?;
        Ok::<_, TunnelError>(TunnelStream::new(send, recv, remote))
    })
    .await
}
