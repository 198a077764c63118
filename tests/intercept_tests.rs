//! End-to-end interception through `InterceptSession`

mod common;

use common::{
    proxy_context, read_tunnel_reply, tcp_pair, tls_get, TestCa, TestOrigin, ORIGIN_RESPONSE,
};
use interpose::mitm::{
    verify_issued_by, InterceptError, ProxyContext, SessionOutcome, SessionState, StoreStats,
};
use interpose::InterceptSession;
use rustls::pki_types::{IpAddr as PkiIpAddr, ServerName};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use SessionState::{Active, AwaitingHostname, Closed, HandshakeReady};

type SessionRun = (Result<SessionOutcome, InterceptError>, Vec<SessionState>);

/// Run one session in the background, returning its result and state history
fn spawn_session(
    id: u64,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    stream: TcpStream,
) -> JoinHandle<SessionRun> {
    tokio::spawn(async move {
        let mut session = InterceptSession::new(id, Some(peer), ctx);
        let result = session.run(stream).await;
        assert_eq!(session.state(), Closed);
        (result, session.history().to_vec())
    })
}

#[tokio::test]
async fn test_tunnel_request_end_to_end() {
    let ca = TestCa::new();
    let origin = TestOrigin::start().await;
    let (ctx, store) = proxy_context(&ca, 443);

    let (mut client, server, peer) = tcp_pair().await;
    let proxy = spawn_session(1, peer, ctx, server);

    let target = format!("localhost:{}", origin.port());
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    client.write_all(connect.as_bytes()).await.unwrap();

    let reply = read_tunnel_reply(&mut client).await;
    assert_eq!(
        String::from_utf8(reply).unwrap(),
        format!("HTTP/1.1 200 Connection Established\r\nhost: {target}\r\n\r\n")
    );

    let response = tls_get(client, &ca, "localhost").await;
    assert_eq!(response, ORIGIN_RESPONSE);

    let (result, states) = proxy.await.unwrap();
    assert_eq!(states, [AwaitingHostname, HandshakeReady, Active, Closed]);
    match result.unwrap() {
        SessionOutcome::Completed {
            host,
            port,
            response_bytes,
            ..
        } => {
            assert_eq!(host, "localhost");
            assert_eq!(port, origin.port());
            assert_eq!(response_bytes, ORIGIN_RESPONSE.len());
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // The fetch connection doubles as the relay connection
    assert_eq!(origin.connection_count(), 1);
    let requests = origin.received_requests();
    assert_eq!(requests.len(), 1);
    let relayed = String::from_utf8_lossy(&requests[0]).to_lowercase();
    assert!(relayed.starts_with("get / http/1.1\r\n"));
    assert!(relayed.contains("connection: close"));
    assert!(!relayed.contains("keep-alive"));

    assert_eq!(store.stats(), StoreStats { hits: 0, forged: 1 });
    let cached = store.load_cached("localhost").await.unwrap().unwrap();
    verify_issued_by(&cached, ca.cert.der()).unwrap();
    assert!(ca.cache_dir().join("localhost").exists());
}

#[tokio::test]
async fn test_sni_discovery_end_to_end() {
    let ca = TestCa::new();
    let origin = TestOrigin::start().await;
    // Transparent clients name no port; the origin's port stands in for 443
    let (ctx, store) = proxy_context(&ca, origin.port());

    let (client, server, peer) = tcp_pair().await;
    let proxy = spawn_session(2, peer, ctx, server);

    let response = tls_get(client, &ca, "localhost").await;
    assert_eq!(response, ORIGIN_RESPONSE);

    let (result, states) = proxy.await.unwrap();
    assert_eq!(states, [AwaitingHostname, HandshakeReady, Active, Closed]);
    assert!(matches!(result.unwrap(), SessionOutcome::Completed { ref host, .. } if host == "localhost"));
    assert_eq!(origin.connection_count(), 1);
    assert_eq!(store.stats().forged, 1);
}

#[tokio::test]
async fn test_connection_without_hostname_is_dropped() {
    let ca = TestCa::new();
    let (ctx, store) = proxy_context(&ca, 443);

    let (mut client, server, peer) = tcp_pair().await;
    let proxy = spawn_session(3, peer, ctx, server);

    // An IP server name produces a ClientHello without SNI
    let config = ca.client_config();
    let name = ServerName::IpAddress(PkiIpAddr::from(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    let mut conn = rustls::ClientConnection::new(config, name).unwrap();
    let mut hello = Vec::new();
    conn.write_tls(&mut hello).unwrap();
    client.write_all(&hello).await.unwrap();

    let (result, states) = proxy.await.unwrap();
    assert_eq!(result.unwrap(), SessionOutcome::Dropped);
    assert_eq!(states, [AwaitingHostname, Closed]);

    let mut received = Vec::new();
    let _ = client.read_to_end(&mut received).await;
    assert!(received.is_empty(), "no handshake bytes may be sent");
    assert_eq!(store.stats(), StoreStats::default());
}

#[tokio::test]
async fn test_malformed_tunnel_request_fails_closed() {
    let ca = TestCa::new();
    let (ctx, _store) = proxy_context(&ca, 443);

    let (mut client, server, peer) = tcp_pair().await;
    let proxy = spawn_session(4, peer, ctx, server);

    client
        .write_all(b"CONNECT localhost:notaport HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (result, states) = proxy.await.unwrap();
    assert_eq!(result.unwrap_err().kind(), interpose::mitm::ErrorKind::Protocol);
    assert_eq!(states, [AwaitingHostname, Closed]);

    let mut received = Vec::new();
    let _ = client.read_to_end(&mut received).await;
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_failed_handshake_after_certificate_install() {
    let ca = TestCa::new();
    let origin = TestOrigin::start().await;
    let (ctx, store) = proxy_context(&ca, 443);

    let (mut client, server, peer) = tcp_pair().await;
    let proxy = spawn_session(5, peer, ctx, server);

    let target = format!("localhost:{}", origin.port());
    let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    client.write_all(connect.as_bytes()).await.unwrap();
    let reply = read_tunnel_reply(&mut client).await;
    assert!(reply.starts_with(b"HTTP/1.1 200 Connection Established\r\n"));

    // A ClientHello record with an empty body
    client
        .write_all(&[0x16, 0x03, 0x01, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00])
        .await
        .unwrap();

    let (result, states) = proxy.await.unwrap();
    assert_eq!(result.unwrap_err().kind(), interpose::mitm::ErrorKind::Tls);
    assert_eq!(states, [AwaitingHostname, HandshakeReady, Closed]);

    // The certificate was forged and cached even though the client went away
    assert_eq!(store.stats(), StoreStats { hits: 0, forged: 1 });
    assert!(store.load_cached("localhost").await.unwrap().is_some());
    assert!(origin.received_requests().is_empty());
}

#[tokio::test]
async fn test_tunnel_hostname_case_shares_cache_with_sni() {
    let ca = TestCa::new();
    let origin = TestOrigin::start().await;
    let (ctx, store) = proxy_context(&ca, origin.port());

    let (mut client, server, peer) = tcp_pair().await;
    let proxy = spawn_session(6, peer, ctx.clone(), server);
    let connect = format!("CONNECT LocalHost:{} HTTP/1.1\r\n\r\n", origin.port());
    client.write_all(connect.as_bytes()).await.unwrap();
    read_tunnel_reply(&mut client).await;
    assert_eq!(tls_get(client, &ca, "localhost").await, ORIGIN_RESPONSE);
    proxy.await.unwrap().0.unwrap();

    let (client, server, peer) = tcp_pair().await;
    let proxy = spawn_session(7, peer, ctx, server);
    assert_eq!(tls_get(client, &ca, "localhost").await, ORIGIN_RESPONSE);
    proxy.await.unwrap().0.unwrap();

    assert_eq!(store.stats(), StoreStats { hits: 1, forged: 1 });
    assert!(ca.cache_dir().join("localhost").exists());
    assert!(!ca.cache_dir().join("LocalHost").exists());
}

#[tokio::test]
async fn test_cached_certificate_is_reused() {
    let ca = TestCa::new();
    let origin = TestOrigin::start().await;
    let (ctx, store) = proxy_context(&ca, origin.port());

    for session_id in 0..2 {
        let (client, server, peer) = tcp_pair().await;
        let ctx = ctx.clone();
        let proxy = spawn_session(session_id, peer, ctx, server);
        assert_eq!(tls_get(client, &ca, "localhost").await, ORIGIN_RESPONSE);
        let (result, states) = proxy.await.unwrap();
        result.unwrap();
        assert_eq!(states, [AwaitingHostname, HandshakeReady, Active, Closed]);
    }

    // Second session hit the cache and opened its relay connection lazily
    assert_eq!(store.stats(), StoreStats { hits: 1, forged: 1 });
    assert_eq!(origin.connection_count(), 2);

    // A cache hit never touches the origin, even an unreachable one
    let served = store.certificate_for("localhost", 1).await.unwrap();
    assert!(served.origin.is_none());
    assert_eq!(store.stats().hits, 2);
}
