//! Client-side QUIC connection reuse.
//!
//! # Responsibilities
//! - Hand out a live connection to the tunnel server per request
//! - Reuse pooled connections until QUIC reports them closed
//! - Fall back to a per-request connection when pooling is disabled
//!
//! # Design Decisions
//! - Keyed by remote address in a sharded map; no lock is held across a dial
//! - A pooled connection is never closed while handed out; it is evicted only
//!   once closed (idle timeout, peer close) or at shutdown
//! - A dedicated (non-pooled) connection is closed when its lease drops

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use quinn::VarInt;
use tracing::debug;

use crate::error::TunnelError;
use crate::net::stream::TunnelStream;
use crate::net::transport::{dial, open_stream};

/// A connection handed out for one exchange.
#[derive(Debug)]
pub struct Lease {
    connection: quinn::Connection,
    dedicated: bool,
}

impl Lease {
    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.dedicated {
            self.connection.close(VarInt::from_u32(0), b"done");
        }
    }
}

pub struct ConnectionPool {
    endpoint: quinn::Endpoint,
    config: quinn::ClientConfig,
    server_name: String,
    connect_timeout: Duration,
    pooled: bool,
    connections: DashMap<SocketAddr, quinn::Connection>,
}

impl ConnectionPool {
    pub fn new(
        endpoint: quinn::Endpoint,
        config: quinn::ClientConfig,
        server_name: impl Into<String>,
        connect_timeout: Duration,
        pooled: bool,
    ) -> Self {
        Self {
            endpoint,
            config,
            server_name: server_name.into(),
            connect_timeout,
            pooled,
            connections: DashMap::new(),
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Number of connections currently held for reuse.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Obtain a connection to `addr`, reusing a live pooled one if possible.
    pub async fn acquire(&self, addr: SocketAddr) -> Result<Lease, TunnelError> {
        if !self.pooled {
            let connection = self.dial(addr).await?;
            return Ok(Lease {
                connection,
                dedicated: true,
            });
        }

        if let Some(connection) = self.cached(addr) {
            return Ok(Lease {
                connection,
                dedicated: false,
            });
        }

        let connection = self.dial(addr).await?;
        self.connections.insert(addr, connection.clone());
        Ok(Lease {
            connection,
            dedicated: false,
        })
    }

    /// Obtain a connection and open one stream on it.
    ///
    /// A pooled connection that fails to open a stream is evicted and the
    /// open is retried once on a fresh connection.
    pub async fn open(&self, addr: SocketAddr) -> Result<(Lease, TunnelStream), TunnelError> {
        let lease = self.acquire(addr).await?;
        match open_stream(lease.connection(), self.connect_timeout).await {
            Ok(stream) => Ok((lease, stream)),
            Err(e) if !lease.is_dedicated() => {
                debug!(remote_addr = %addr, error = %e, "Pooled connection unusable, redialing");
                self.evict(addr, lease.connection());
                drop(lease);
                let lease = self.acquire(addr).await?;
                let stream = open_stream(lease.connection(), self.connect_timeout).await?;
                Ok((lease, stream))
            }
            Err(e) => Err(e),
        }
    }

    /// Close and forget every pooled connection.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close(VarInt::from_u32(0), b"shutdown");
        }
        self.connections.clear();
    }

    fn cached(&self, addr: SocketAddr) -> Option<quinn::Connection> {
        let connection = self.connections.get(&addr).map(|entry| entry.value().clone())?;
        if connection.close_reason().is_none() {
            return Some(connection);
        }
        debug!(remote_addr = %addr, "Evicting closed connection");
        self.evict(addr, &connection);
        None
    }

    fn evict(&self, addr: SocketAddr, connection: &quinn::Connection) {
        let id = connection.stable_id();
        self.connections.remove_if(&addr, |_, pooled| pooled.stable_id() == id);
    }

    async fn dial(&self, addr: SocketAddr) -> Result<quinn::Connection, TunnelError> {
        dial(&self.endpoint, &self.config, addr, &self.server_name, self.connect_timeout).await
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server_name", &self.server_name)
            .field("pooled", &self.pooled)
            .field("connections", &self.connections.len())
            .finish()
    }
}
