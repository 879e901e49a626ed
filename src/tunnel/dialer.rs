//! Tunnel client dialer: carries one request per QUIC stream.
//!
//! # Responsibilities
//! - Obtain a connection to the tunnel server (pooled or fresh)
//! - Write the request, half-close, read the response under deadlines
//!
//! # Design Decisions
//! - The stream is closed on every exit path; a fresh non-pooled connection
//!   is closed with its lease

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::TunnelError;
use crate::http::codec;
use crate::http::message::{OutboundRequest, TunnelResponse};
use crate::http::processor::RequestForwarder;
use crate::net::ConnectionPool;
use crate::resilience::{with_timeout, Deadlines};

#[derive(Debug)]
pub struct TunnelDialer {
    pool: ConnectionPool,
    server_addr: SocketAddr,
    deadlines: Deadlines,
    max_response_bytes: usize,
}

impl TunnelDialer {
    pub fn new(pool: ConnectionPool, server_addr: SocketAddr, deadlines: Deadlines, max_response_bytes: usize) -> Self {
        Self {
            pool,
            server_addr,
            deadlines,
            max_response_bytes,
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Send `request` through the tunnel and read the response.
    pub async fn send(&self, request: &OutboundRequest) -> Result<TunnelResponse, TunnelError> {
        let head = request.is_head();
        let (_lease, mut stream) = self.pool.open(self.server_addr).await?;

        let wire = request.encode();
        with_timeout("write", self.deadlines.write, async {
            stream.write_all(&wire).await?;
            stream.flush().await?;
            stream.finish()?;
            Ok::<(), TunnelError>(())
        })
        .await?;

        let response = with_timeout(
            "read",
            self.deadlines.read,
            codec::read_message(&mut stream, self.max_response_bytes, |buf, eof| {
                TunnelResponse::parse(buf, eof, head)
            }),
        )
        .await?;
        stream.close();

        debug!(
            status = response.status.as_u16(),
            protocol = %response.protocol,
            "Response received through tunnel"
        );
        Ok(response)
    }

    /// Close every pooled connection.
    pub fn close(&self) {
        self.pool.close_all();
    }
}

impl RequestForwarder for TunnelDialer {
    async fn forward(&self, request: OutboundRequest) -> Result<TunnelResponse, TunnelError> {
        self.send(&request).await
    }
}
