//! End-to-end tests over real QUIC on loopback with fake egress clients.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::StatusCode;
use tokio::io::AsyncReadExt;

use quic_tunnel::error::{ParseError, TunnelError};
use quic_tunnel::http::{InboundRequest, Protocol, TunnelResponse};
use quic_tunnel::net::tls::{self, ClientTrust};
use quic_tunnel::net::{client_endpoint, dial, open_stream};

mod common;
use common::{Behavior, FakeEgress};

fn parse_response(raw: &[u8]) -> TunnelResponse {
    TunnelResponse::parse(raw, true, false).unwrap().unwrap()
}

#[tokio::test]
async fn get_through_tunnel_returns_origin_body() {
    let fast = FakeEgress::new(Behavior::ok(b"hello", Protocol::Http3));
    let compat = FakeEgress::new(Behavior::Fail);
    let server = common::start_server(fast.clone(), compat.clone(), common::options(Duration::from_secs(5)));
    let client = common::start_client(server.addr, true, common::options(Duration::from_secs(5))).await;

    // Absolute-form target with a plain-http scheme, as a proxy-aware client sends it.
    let raw = common::send_raw(client.addr, b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n").await;
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(!text.to_ascii_lowercase().contains("x-tunnel-protocol"), "{text}");
    let response = parse_response(&raw);
    assert_eq!(&response.body[..], b"hello");

    assert_eq!(fast.calls(), 1);
    assert_eq!(compat.calls(), 0);
    assert_eq!(fast.seen.lock().unwrap()[0], "https://example.test/");
}

#[tokio::test]
async fn origin_form_target_is_normalized_from_host() {
    let fast = FakeEgress::new(Behavior::ok(b"hello", Protocol::Http3));
    let server = common::start_server(fast.clone(), FakeEgress::new(Behavior::Fail), common::options(Duration::from_secs(5)));
    let client = common::start_client(server.addr, true, common::options(Duration::from_secs(5))).await;

    let raw = common::send_raw(client.addr, b"GET /greeting?lang=en HTTP/1.1\r\nHost: example.test:8443\r\n\r\n").await;
    assert!(raw.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(fast.seen.lock().unwrap()[0], "https://example.test:8443/greeting?lang=en");
}

#[tokio::test]
async fn failed_fast_attempt_falls_back() {
    let fast = FakeEgress::new(Behavior::Fail);
    let compat = FakeEgress::new(Behavior::Respond {
        status: StatusCode::NO_CONTENT,
        protocol: Protocol::Http2,
        body: Bytes::new(),
    });
    let server = common::start_server(fast.clone(), compat.clone(), common::options(Duration::from_secs(5)));
    let dialer = common::dialer(server.addr, true, common::options(Duration::from_secs(5)));

    let request = InboundRequest::parse(b"DELETE /item/7 HTTP/1.1\r\nHost: example.test\r\n\r\n", false)
        .unwrap()
        .unwrap()
        .normalize()
        .unwrap();
    let response = dialer.send(&request).await.unwrap();

    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(response.protocol, Protocol::Http2);
    assert!(response.body.is_empty());
    assert_eq!(fast.calls(), 1);
    assert_eq!(compat.calls(), 1);
    assert_eq!(fast.seen.lock().unwrap()[0], compat.seen.lock().unwrap()[0]);
}

#[tokio::test]
async fn empty_stream_fails_only_that_stream() {
    let fast = FakeEgress::new(Behavior::ok(b"still serving", Protocol::Http3));
    let server = common::start_server(
        fast.clone(),
        FakeEgress::new(Behavior::Fail),
        common::options(Duration::from_secs(5)),
    );

    let endpoint = client_endpoint(server.addr).unwrap();
    let connection = dial(
        &endpoint,
        &common::client_config(),
        server.addr,
        common::SERVER_NAME,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let mut stream = open_stream(&connection, Duration::from_secs(5)).await.unwrap();
    stream.finish().unwrap();
    let mut reply = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply)).await;
    assert!(reply.is_empty());

    let stats = server.server.stats();
    assert!(common::eventually(Duration::from_secs(5), || stats.streams_failed() == 1).await);
    assert_eq!(stats.streams_failed_with("parse"), 1);
    assert_eq!(fast.calls(), 0);

    // The same connection keeps carrying exchanges.
    let dialer_request = b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n";
    let mut stream = open_stream(&connection, Duration::from_secs(5)).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, dialer_request).await.unwrap();
    stream.finish().unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    let response = parse_response(&reply);
    assert_eq!(&response.body[..], b"still serving");
    assert_eq!(response.protocol, Protocol::Http3);
    assert!(common::eventually(Duration::from_secs(5), || stats.streams_completed() == 1).await);
}

#[tokio::test]
async fn slow_origin_hits_deadline_without_fallback() {
    let fast = FakeEgress::new(Behavior::Hang(Duration::from_secs(30)));
    let compat = FakeEgress::new(Behavior::ok(b"too late", Protocol::Http2));
    let server = common::start_server(fast.clone(), compat.clone(), common::options(Duration::from_millis(200)));
    let dialer = common::dialer(server.addr, false, common::options(Duration::from_secs(5)));

    let request = InboundRequest::parse(b"GET /slow HTTP/1.1\r\nHost: example.test\r\n\r\n", false)
        .unwrap()
        .unwrap()
        .normalize()
        .unwrap();

    let started = Instant::now();
    let err = dialer.send(&request).await.unwrap_err();
    let elapsed = started.elapsed();

    // The server closes the stream without a response.
    assert!(matches!(err, TunnelError::Parse(ParseError::Empty)), "{err:?}");
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(fast.calls(), 1);
    assert_eq!(compat.calls(), 0);

    let stats = server.server.stats();
    assert!(common::eventually(Duration::from_secs(2), || stats.streams_failed() == 1).await);
    assert_eq!(stats.streams_failed_with("deadline_exceeded"), 1);
    assert_eq!(stats.streams_completed(), 0);

    // Nothing stays open on either side.
    assert!(common::eventually(Duration::from_secs(2), || server.server.active_exchanges() == 0).await);
    assert!(dialer.pool().is_empty());
}

#[tokio::test]
async fn binary_body_crosses_both_hops_unchanged() {
    let payload: &'static [u8] = b"\x00\x01\x02\r\n\r\nnot a header\xff\xfe";
    let fast = FakeEgress::new(Behavior::ok(payload, Protocol::Http3));
    let server = common::start_server(
        fast,
        FakeEgress::new(Behavior::Fail),
        common::options(Duration::from_secs(5)),
    );
    let client = common::start_client(server.addr, false, common::options(Duration::from_secs(5))).await;

    let raw = common::send_raw(
        client.addr,
        b"POST /upload HTTP/1.1\r\nHost: example.test\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
    )
    .await;
    let response = parse_response(&raw);
    assert_eq!(&response.body[..], payload);
}

#[tokio::test]
async fn pooled_dialer_reuses_one_connection() {
    let server = common::start_server(
        FakeEgress::new(Behavior::ok(b"ok", Protocol::Http3)),
        FakeEgress::new(Behavior::Fail),
        common::options(Duration::from_secs(5)),
    );
    let dialer = common::dialer(server.addr, true, common::options(Duration::from_secs(5)));
    let request = InboundRequest::parse(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n", false)
        .unwrap()
        .unwrap()
        .normalize()
        .unwrap();

    for _ in 0..3 {
        dialer.send(&request).await.unwrap();
    }

    assert_eq!(server.server.stats().connections_accepted(), 1);
    assert_eq!(dialer.pool().len(), 1);

    dialer.close();
    assert!(dialer.pool().is_empty());
}

#[tokio::test]
async fn unpooled_dialer_dials_per_request() {
    let server = common::start_server(
        FakeEgress::new(Behavior::ok(b"ok", Protocol::Http3)),
        FakeEgress::new(Behavior::Fail),
        common::options(Duration::from_secs(5)),
    );
    let dialer = common::dialer(server.addr, false, common::options(Duration::from_secs(5)));
    let request = InboundRequest::parse(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n", false)
        .unwrap()
        .unwrap()
        .normalize()
        .unwrap();

    dialer.send(&request).await.unwrap();
    dialer.send(&request).await.unwrap();

    assert_eq!(server.server.stats().connections_accepted(), 2);
    assert!(dialer.pool().is_empty());
}

#[tokio::test]
async fn trust_policy_decides_handshake() {
    let server = common::start_server(
        FakeEgress::new(Behavior::Fail),
        FakeEgress::new(Behavior::Fail),
        common::options(Duration::from_secs(5)),
    );
    let addr = server.addr;
    let endpoint = client_endpoint(addr).unwrap();
    let connect = |trust: ClientTrust| {
        let config = tls::client_config(&trust, common::ALPN, Duration::from_secs(30)).unwrap();
        let endpoint = endpoint.clone();
        async move {
            dial(&endpoint, &config, addr, common::SERVER_NAME, Duration::from_secs(5)).await
        }
    };

    assert!(connect(common::pinned_trust()).await.is_ok());
    assert!(connect(ClientTrust::Insecure).await.is_ok());
    let err = connect(ClientTrust::WebPki).await.unwrap_err();
    assert!(matches!(err, TunnelError::Connect { .. }), "{err:?}");

    let wrong_alpn = tls::client_config(&ClientTrust::Insecure, "h3", Duration::from_secs(30)).unwrap();
    let err = dial(&endpoint, &wrong_alpn, addr, common::SERVER_NAME, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Connect { .. }), "{err:?}");
}

#[tokio::test]
async fn stream_close_is_idempotent() {
    let server = common::start_server(
        FakeEgress::new(Behavior::Fail),
        FakeEgress::new(Behavior::Fail),
        common::options(Duration::from_secs(5)),
    );
    let endpoint = client_endpoint(server.addr).unwrap();
    let connection = dial(
        &endpoint,
        &common::client_config(),
        server.addr,
        common::SERVER_NAME,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let mut stream = open_stream(&connection, Duration::from_secs(5)).await.unwrap();
    assert!(!stream.is_closed());
    stream.close();
    stream.close();
    assert!(stream.is_closed());
    drop(stream);

    // Closing a stream leaves its connection usable.
    assert!(connection.close_reason().is_none());
    open_stream(&connection, Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn run_and_shutdown_are_single_use() {
    let server = common::start_server(
        FakeEgress::new(Behavior::Fail),
        FakeEgress::new(Behavior::Fail),
        common::options(Duration::from_secs(5)),
    );

    // Wait for the spawned run to claim the server.
    tokio::task::yield_now().await;
    let second = tokio::time::timeout(
        Duration::from_secs(1),
        server.server.run(quic_tunnel::Shutdown::new()),
    )
    .await;
    assert!(matches!(second, Ok(Err(TunnelError::Shutdown(_)))));

    server.server.shutdown().await.unwrap();
    assert!(matches!(server.server.shutdown().await, Err(TunnelError::Shutdown(_))));

    let result = tokio::time::timeout(Duration::from_secs(2), server.task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn external_shutdown_stops_client_and_server() {
    let server = common::start_server(
        FakeEgress::new(Behavior::ok(b"ok", Protocol::Http3)),
        FakeEgress::new(Behavior::Fail),
        common::options(Duration::from_secs(5)),
    );
    let client = common::start_client(server.addr, true, common::options(Duration::from_secs(5))).await;

    let raw = common::send_raw(client.addr, b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n").await;
    assert!(raw.starts_with(b"HTTP/1.1 200 OK\r\n"));

    client.shutdown.trigger();
    server.shutdown.trigger();
    client.client.shutdown().await.unwrap();
    server.server.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), server.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(server.server.active_exchanges(), 0);
}
