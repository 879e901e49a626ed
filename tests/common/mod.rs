//! Shared utilities for tunnel integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use quic_tunnel::egress::{EgressClient, EgressError, Forwarder};
use quic_tunnel::error::TunnelError;
use quic_tunnel::http::{OutboundRequest, Protocol, TunnelResponse};
use quic_tunnel::lifecycle::Shutdown;
use quic_tunnel::net::tls::{self, ClientTrust};
use quic_tunnel::net::{client_endpoint, ConnectionPool, IngressListener, QuicListener};
use quic_tunnel::resilience::Deadlines;
use quic_tunnel::tunnel::{ExchangeOptions, TunnelClient, TunnelDialer, TunnelServer};

pub const ALPN: &str = "quic-tunnel";
pub const SERVER_NAME: &str = "localhost";

pub fn fixture(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

pub fn options(timeout: Duration) -> ExchangeOptions {
    ExchangeOptions {
        deadlines: Deadlines::uniform(timeout),
        max_request_bytes: 4096,
        max_response_bytes: 1 << 20,
        drain_timeout: Duration::from_secs(2),
    }
}

pub fn server_config() -> quinn::ServerConfig {
    let certs = tls::load_certs(&fixture("localhost.crt")).unwrap();
    let key = tls::load_private_key(&fixture("localhost.key")).unwrap();
    tls::server_config(certs, key, ALPN, Duration::from_secs(30)).unwrap()
}

pub fn pinned_trust() -> ClientTrust {
    ClientTrust::Pinned(tls::load_certs(&fixture("localhost.crt")).unwrap())
}

pub fn client_config() -> quinn::ClientConfig {
    tls::client_config(&pinned_trust(), ALPN, Duration::from_secs(30)).unwrap()
}

/// What a [`FakeEgress`] does when asked to send.
#[derive(Clone)]
pub enum Behavior {
    Respond {
        status: StatusCode,
        protocol: Protocol,
        body: Bytes,
    },
    Fail,
    Hang(Duration),
}

impl Behavior {
    pub fn ok(body: &'static [u8], protocol: Protocol) -> Self {
        Behavior::Respond {
            status: StatusCode::OK,
            protocol,
            body: Bytes::from_static(body),
        }
    }
}

/// Egress client double with call counters shared with the test.
#[derive(Clone)]
pub struct FakeEgress {
    behavior: Behavior,
    pub calls: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl FakeEgress {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EgressClient for FakeEgress {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn send(&self, request: &OutboundRequest) -> Result<TunnelResponse, EgressError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.uri().to_string());
        match &self.behavior {
            Behavior::Respond { status, protocol, body } => {
                let mut headers = HeaderMap::new();
                headers.insert("content-type", HeaderValue::from_static("application/octet-stream"));
                Ok(TunnelResponse::new(*status, *protocol, headers, body.clone()))
            }
            Behavior::Fail => Err(EgressError::Connect("connection refused".into())),
            Behavior::Hang(d) => {
                tokio::time::sleep(*d).await;
                Err(EgressError::Request("gave up".into()))
            }
        }
    }

    fn close(&self) {}
}

pub struct RunningServer {
    pub server: Arc<TunnelServer<FakeEgress, FakeEgress>>,
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), TunnelError>>,
}

/// Start a tunnel server on loopback with fake egress clients.
pub fn start_server(fast: FakeEgress, compatible: FakeEgress, opts: ExchangeOptions) -> RunningServer {
    let listener = QuicListener::bind("127.0.0.1:0".parse().unwrap(), server_config()).unwrap();
    let forwarder = Forwarder::new(fast, compatible, opts.deadlines.read);
    let server = Arc::new(TunnelServer::new(listener, forwarder, opts));
    let addr = server.local_addr();
    let shutdown = Shutdown::new();

    let task = {
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    RunningServer {
        server,
        addr,
        shutdown,
        task,
    }
}

pub fn dialer(server_addr: SocketAddr, pooled: bool, opts: ExchangeOptions) -> TunnelDialer {
    let pool = ConnectionPool::new(
        client_endpoint(server_addr).unwrap(),
        client_config(),
        SERVER_NAME,
        opts.deadlines.write,
        pooled,
    );
    TunnelDialer::new(pool, server_addr, opts.deadlines, opts.max_response_bytes)
}

pub struct RunningClient {
    pub client: Arc<TunnelClient>,
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
}

/// Start a tunnel client whose ingress listens on an ephemeral loopback port.
pub async fn start_client(server_addr: SocketAddr, pooled: bool, opts: ExchangeOptions) -> RunningClient {
    let listener = IngressListener::bind("127.0.0.1:0".parse().unwrap(), 64).await.unwrap();
    let client = Arc::new(TunnelClient::new(listener, dialer(server_addr, pooled, opts), opts));
    let addr = client.local_addr().unwrap();
    let shutdown = Shutdown::new();

    {
        let client = Arc::clone(&client);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(shutdown).await });
    }

    RunningClient {
        client,
        addr,
        shutdown,
    }
}

/// Write `request` to a fresh local connection and read until the peer closes.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("response within 10s")
        .unwrap();
    response
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
