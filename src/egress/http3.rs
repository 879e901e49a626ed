//! HTTP/3 egress client.
//!
//! # Responsibilities
//! - Resolve the origin and open (or reuse) an HTTP/3 connection to it
//! - Send one request and buffer the response
//!
//! # Design Decisions
//! - One QUIC endpoint per client, bound once
//! - Connections are cached per authority and reused only while QUIC
//!   reports them open; a cached connection found closed is redialed once
//! - Closed entries for any authority are pruned whenever a new connection
//!   is cached
//! - A disabled client reports every request as unsupported

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use h3::client::SendRequest;
use quinn::VarInt;
use tracing::debug;

use crate::egress::{origin_headers, EgressClient, EgressError};
use crate::error::TunnelError;
use crate::http::message::{OutboundRequest, Protocol, TunnelResponse};
use crate::net::tls::{client_config, ClientTrust};

const ALPN_H3: &str = "h3";
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Sender = SendRequest<h3_quinn::OpenStreams, Bytes>;

/// An HTTP/3 session: the QUIC connection and its request handle.
#[derive(Clone)]
struct Session {
    connection: quinn::Connection,
    sender: Sender,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }
}

struct State {
    endpoint: quinn::Endpoint,
    config: quinn::ClientConfig,
    sessions: DashMap<String, Session>,
}

pub struct Http3Client {
    state: Option<State>,
    max_response_bytes: usize,
    closed: AtomicBool,
}

impl Http3Client {
    /// Bind a client endpoint. Must be called within a Tokio runtime.
    pub fn new(insecure: bool, max_response_bytes: usize) -> Result<Self, TunnelError> {
        let trust = if insecure { ClientTrust::Insecure } else { ClientTrust::WebPki };
        let config = client_config(&trust, ALPN_H3, IDLE_TIMEOUT)?;
        let endpoint = bind_endpoint()?;

        Ok(Self {
            state: Some(State {
                endpoint,
                config,
                sessions: DashMap::new(),
            }),
            max_response_bytes,
            closed: AtomicBool::new(false),
        })
    }

    /// A client that never attempts HTTP/3.
    pub fn disabled() -> Self {
        Self {
            state: None,
            max_response_bytes: 0,
            closed: AtomicBool::new(false),
        }
    }

    /// A cached open session for `key`, evicting it if QUIC closed it.
    fn cached(state: &State, key: &str) -> Option<Session> {
        let session = state.sessions.get(key).map(|entry| entry.value().clone())?;
        if session.is_open() {
            return Some(session);
        }
        debug!(authority = key, "Evicting closed HTTP/3 connection");
        Self::evict(state, key, &session);
        None
    }

    /// Remove `session` from the cache unless it was already replaced.
    fn evict(state: &State, key: &str, session: &Session) {
        let id = session.connection.stable_id();
        state.sessions.remove_if(key, |_, cached| cached.connection.stable_id() == id);
    }

    async fn connect(&self, state: &State, request: &OutboundRequest) -> Result<Session, EgressError> {
        let key = request.authority().as_str();
        let host = request.authority().host();
        let port = request.authority().port_u16().unwrap_or(443);
        let addr = resolve(host, port).await?;

        let connection = state
            .endpoint
            .connect_with(state.config.clone(), addr, host.trim_start_matches('[').trim_end_matches(']'))
            .map_err(|e| EgressError::Connect(e.to_string()))?
            .await
            .map_err(|e| EgressError::Connect(e.to_string()))?;

        let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(connection.clone()))
            .await
            .map_err(|e| EgressError::Connect(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = std::future::poll_fn(|cx| driver.poll_close(cx)).await {
                debug!(error = %e, "HTTP/3 connection closed");
            }
        });

        debug!(authority = key, remote_addr = %addr, "HTTP/3 connection established");
        let session = Session { connection, sender };
        state.sessions.retain(|_, cached| cached.is_open());
        state.sessions.insert(key.to_string(), session.clone());
        Ok(session)
    }

    /// Send on a fresh session and drop it from the cache if it fails.
    async fn send_fresh(&self, state: &State, request: &OutboundRequest) -> Result<TunnelResponse, EgressError> {
        let session = self.connect(state, request).await?;
        let result = self.round_trip(session.sender.clone(), request).await;
        if result.is_err() {
            Self::evict(state, request.authority().as_str(), &session);
        }
        result
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.sessions.len())
    }

    async fn round_trip(&self, mut sender: Sender, request: &OutboundRequest) -> Result<TunnelResponse, EgressError> {
        let mut builder = http::Request::builder()
            .method(request.method().clone())
            .uri(request.uri().clone());
        if let Some(headers) = builder.headers_mut() {
            *headers = origin_headers(request);
        }
        let outbound = builder.body(()).map_err(|e| EgressError::Request(e.to_string()))?;

        let request_error = |e: h3::Error| EgressError::Request(e.to_string());
        let mut stream = sender.send_request(outbound).await.map_err(request_error)?;
        if !request.body().is_empty() {
            stream.send_data(request.body().clone()).await.map_err(request_error)?;
        }
        stream.finish().await.map_err(request_error)?;

        let response = stream.recv_response().await.map_err(request_error)?;
        let mut body = BytesMut::new();
        while let Some(mut chunk) = stream.recv_data().await.map_err(request_error)? {
            if body.len() + chunk.remaining() > self.max_response_bytes {
                return Err(EgressError::TooLarge(self.max_response_bytes));
            }
            while chunk.has_remaining() {
                let part = chunk.chunk();
                let len = part.len();
                body.extend_from_slice(part);
                chunk.advance(len);
            }
        }

        let (parts, ()) = response.into_parts();
        Ok(TunnelResponse::new(parts.status, Protocol::Http3, parts.headers, body.freeze()))
    }
}

impl EgressClient for Http3Client {
    fn name(&self) -> &'static str {
        "http3"
    }

    async fn send(&self, request: &OutboundRequest) -> Result<TunnelResponse, EgressError> {
        let Some(state) = &self.state else {
            return Err(EgressError::Unsupported {
                protocol: "HTTP/3",
                reason: "disabled by configuration".into(),
            });
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(EgressError::Closed);
        }

        let key = request.authority().as_str();
        let Some(session) = Self::cached(state, key) else {
            return self.send_fresh(state, request).await;
        };

        match self.round_trip(session.sender.clone(), request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                Self::evict(state, key, &session);
                if session.is_open() {
                    return Err(e);
                }
                // The connection went away between the liveness check and the request.
                debug!(authority = key, error = %e, "Cached HTTP/3 connection closed, redialing");
                self.send_fresh(state, request).await
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(state) = &self.state {
            state.sessions.clear();
            state.endpoint.close(VarInt::from_u32(0), b"closing");
        }
    }
}

impl std::fmt::Debug for Http3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http3Client")
            .field("enabled", &self.state.is_some())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn bind_endpoint() -> Result<quinn::Endpoint, TunnelError> {
    let v6: SocketAddr = SocketAddr::from(([0u16; 8], 0));
    match quinn::Endpoint::client(v6) {
        Ok(endpoint) => Ok(endpoint),
        Err(_) => {
            let v4 = SocketAddr::from(([0, 0, 0, 0], 0));
            quinn::Endpoint::client(v4).map_err(|source| TunnelError::Listen {
                addr: v4.to_string(),
                source,
            })
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, EgressError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| EgressError::Connect(format!("failed to resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| EgressError::Connect(format!("no addresses for {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::InboundRequest;
    use crate::net::tls::{load_certs, load_private_key, server_config};
    use std::path::Path;
    use tokio::sync::mpsc;

    /// HTTP/3 origin on loopback answering every request with `body`.
    /// Each accepted connection is reported on the returned channel.
    fn spawn_origin(body: &'static [u8]) -> (SocketAddr, mpsc::UnboundedReceiver<quinn::Connection>) {
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        let certs = load_certs(&fixtures.join("localhost.crt")).unwrap();
        let key = load_private_key(&fixtures.join("localhost.key")).unwrap();
        let config = server_config(certs, key, ALPN_H3, IDLE_TIMEOUT).unwrap();
        let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = endpoint.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let Ok(connection) = incoming.await else { continue };
                let _ = tx.send(connection.clone());
                tokio::spawn(async move {
                    let Ok(mut conn) = h3::server::Connection::<_, Bytes>::new(h3_quinn::Connection::new(connection)).await
                    else {
                        return;
                    };
                    while let Ok(Some((_request, mut stream))) = conn.accept().await {
                        let response = http::Response::builder().status(200).body(()).unwrap();
                        if stream.send_response(response).await.is_err() {
                            break;
                        }
                        let _ = stream.send_data(Bytes::from_static(body)).await;
                        let _ = stream.finish().await;
                    }
                });
            }
        });
        (addr, rx)
    }

    fn request_to(addr: SocketAddr) -> OutboundRequest {
        let raw = format!("GET /h3 HTTP/1.1\r\nHost: {addr}\r\n\r\n");
        InboundRequest::parse(raw.as_bytes(), false).unwrap().unwrap().normalize().unwrap()
    }

    fn cached_connection(client: &Http3Client, request: &OutboundRequest) -> quinn::Connection {
        let state = client.state.as_ref().unwrap();
        let entry = state.sessions.get(request.authority().as_str()).unwrap();
        entry.value().connection.clone()
    }

    /// Close the origin side of a connection and wait until the client sees it.
    async fn close_from_origin(origin_side: quinn::Connection, client_side: quinn::Connection) {
        origin_side.close(VarInt::from_u32(0), b"idle");
        tokio::time::timeout(Duration::from_secs(5), client_side.closed())
            .await
            .unwrap();
        assert!(client_side.close_reason().is_some());
    }

    #[tokio::test]
    async fn closed_cached_connection_is_redialed_over_http3() {
        let (addr, mut accepted) = spawn_origin(b"from h3");
        let client = Http3Client::new(true, 1 << 16).unwrap();
        let request = request_to(addr);

        let first = client.send(&request).await.unwrap();
        assert_eq!(first.protocol, Protocol::Http3);
        assert_eq!(&first.body[..], b"from h3");
        assert_eq!(client.session_count(), 1);

        // Same effect as the QUIC idle timeout expiring between requests.
        let origin_side = accepted.recv().await.unwrap();
        close_from_origin(origin_side, cached_connection(&client, &request)).await;

        let second = client.send(&request).await.unwrap();
        assert_eq!(second.protocol, Protocol::Http3);
        assert_eq!(&second.body[..], b"from h3");
        assert!(accepted.recv().await.is_some());
        assert_eq!(client.session_count(), 1);
        assert!(cached_connection(&client, &request).close_reason().is_none());
        client.close();
    }

    #[tokio::test]
    async fn open_cached_connection_is_reused() {
        let (addr, mut accepted) = spawn_origin(b"again");
        let client = Http3Client::new(true, 1 << 16).unwrap();
        let request = request_to(addr);

        client.send(&request).await.unwrap();
        let first_id = cached_connection(&client, &request).stable_id();
        client.send(&request).await.unwrap();

        assert_eq!(cached_connection(&client, &request).stable_id(), first_id);
        assert!(accepted.recv().await.is_some());
        assert!(accepted.try_recv().is_err());
        client.close();
    }

    #[tokio::test]
    async fn closed_sessions_of_other_authorities_are_pruned() {
        let (first_addr, mut first_accepted) = spawn_origin(b"one");
        let (second_addr, _second_accepted) = spawn_origin(b"two");
        let client = Http3Client::new(true, 1 << 16).unwrap();
        let first = request_to(first_addr);

        client.send(&first).await.unwrap();
        let origin_side = first_accepted.recv().await.unwrap();
        close_from_origin(origin_side, cached_connection(&client, &first)).await;

        let second = request_to(second_addr);
        assert_eq!(&client.send(&second).await.unwrap().body[..], b"two");
        assert_eq!(client.session_count(), 1);
        cached_connection(&client, &second);
        client.close();
    }

    #[tokio::test]
    async fn disabled_client_reports_unsupported() {
        let client = Http3Client::disabled();
        let request = InboundRequest::parse(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n", false)
            .unwrap()
            .unwrap()
            .normalize()
            .unwrap();

        let err = client.send(&request).await.unwrap_err();
        assert!(matches!(err, EgressError::Unsupported { .. }));
        client.close();
        client.close();
    }

    #[tokio::test]
    async fn closed_client_refuses_requests() {
        let client = Http3Client::new(false, 1024).unwrap();
        client.close();
        let request = InboundRequest::parse(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n", false)
            .unwrap()
            .unwrap()
            .normalize()
            .unwrap();
        assert!(matches!(client.send(&request).await, Err(EgressError::Closed)));
    }
}
