//! One bidirectional QUIC stream carrying one exchange.
//!
//! # Responsibilities
//! - Expose the send/recv halves as one `AsyncRead + AsyncWrite` value
//! - Half-close (FIN) the send side once a message is written
//! - Close both directions exactly once, on every exit path
//!
//! # Design Decisions
//! - `close` is idempotent and also runs on drop
//! - Closing a stream never closes its connection

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use quinn::VarInt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Application error code used when abandoning the receive side.
const STREAM_DONE: VarInt = VarInt::from_u32(0);

#[derive(Debug)]
pub struct TunnelStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    remote: SocketAddr,
    closed: bool,
}

impl TunnelStream {
    pub fn new(send: quinn::SendStream, recv: quinn::RecvStream, remote: SocketAddr) -> Self {
        Self {
            send,
            recv,
            remote,
            closed: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn id(&self) -> quinn::StreamId {
        self.send.id()
    }

    /// Signal end of the outgoing message. The receive side stays open.
    pub fn finish(&mut self) -> io::Result<()> {
        self.send
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e))
    }

    /// Close both directions. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Either side may already be finished or reset by the peer.
        let _ = self.send.finish();
        let _ = self.recv.stop(STREAM_DONE);
        tracing::trace!(remote_addr = %self.remote, stream_id = %self.send.id(), "Stream closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}
