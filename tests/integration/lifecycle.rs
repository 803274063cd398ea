//! Lifecycle integration tests: inactivity reaping, inspector mirroring and
//! shutdown

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxy_forwarder::tunnel::ADDRESS_PREFIX_LEN;
use proxy_forwarder::{InspectorConfig, UpstreamParams};

use super::common::{
    closed_port, eventually, is_closed, socks5_connect, spawn_echo, test_config, Harness,
    MockGateway, CONNECT_OK,
};

const PUBLIC_TARGET: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);

// ============================================================================
// Inactivity Reaper
// ============================================================================

#[tokio::test]
async fn test_idle_entry_point_is_reaped() {
    let gateway = MockGateway::accepting().await;
    let mut config = test_config(gateway.port());
    config.registry.inactivity_timeout_secs = 1;
    let harness = Harness::start(config).await;
    harness
        .forwarder
        .create_entry_point("alice", "pw", UpstreamParams::default(), None, None)
        .unwrap();

    let forwarder = &harness.forwarder;
    assert!(eventually(Duration::from_secs(5), || !forwarder.exists_entry_point("alice")).await);

    harness.stop().await;
}

#[tokio::test]
async fn test_tunnel_traffic_keeps_entry_point_alive() {
    let gateway = MockGateway::accepting().await;
    let echo = spawn_echo().await;
    let mut config = test_config(gateway.port());
    config.registry.inactivity_timeout_secs = 1;
    let harness = Harness::start(config).await;
    harness
        .forwarder
        .create_entry_point("alice", "pw", UpstreamParams::default(), None, None)
        .unwrap();

    let (mut socks, _) = socks5_connect(harness.socks5_addr, "alice", "pw", echo)
        .await
        .connected();

    let mut buf = [0u8; 4];
    for _ in 0..10 {
        socks.write_all(b"beat").await.unwrap();
        socks.read_exact(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert!(harness.forwarder.exists_entry_point("alice"));

    // Once traffic stops the reaper removes the entry point and its tunnel
    let forwarder = &harness.forwarder;
    assert!(eventually(Duration::from_secs(5), || !forwarder.exists_entry_point("alice")).await);
    assert!(is_closed(&mut socks).await);

    harness.stop().await;
}

// ============================================================================
// Inspector Mirroring
// ============================================================================

struct Mirrored {
    outgoing: Vec<u8>,
    incoming: Vec<u8>,
}

/// Read frames until the peer closes
async fn read_frames(stream: &mut TcpStream) -> Mirrored {
    let mut mirrored = Mirrored {
        outgoing: Vec::new(),
        incoming: Vec::new(),
    };
    let mut header = [0u8; 5];
    while stream.read_exact(&mut header).await.is_ok() {
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        match header[4] {
            1 => mirrored.outgoing.extend_from_slice(&payload),
            0 => mirrored.incoming.extend_from_slice(&payload),
            other => panic!("unexpected direction flag {other}"),
        }
    }
    mirrored
}

async fn mirrored_session(
    filters: Vec<ipnet::Ipv4Net>,
    early: &'static [u8],
) -> (Vec<u8>, Mirrored) {
    let mut gateway = MockGateway::start(CONNECT_OK, early).await;
    let inspector_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let inspector = InspectorConfig {
        address: "127.0.0.1".into(),
        port: inspector_listener.local_addr().unwrap().port(),
        filters,
    };

    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "pw", UpstreamParams::default(), None, Some(inspector))
        .unwrap();

    let (mut socks, _) = socks5_connect(harness.socks5_addr, "alice", "pw", PUBLIC_TARGET)
        .await
        .connected();
    let mut target = gateway.next_tunnel().await;
    let (mut inspector_conn, _) = tokio::time::timeout(
        Duration::from_secs(5),
        inspector_listener.accept(),
    )
    .await
    .unwrap()
    .unwrap();

    let mut buf = vec![0u8; early.len()];
    socks.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, early);

    let request = b"GET / HTTP/1.0\r\n\r\n";
    socks.write_all(request).await.unwrap();
    let mut buf = vec![0u8; request.len()];
    target.read_exact(&mut buf).await.unwrap();

    let response = b"HTTP/1.0 204 No Content\r\n\r\n";
    target.write_all(response).await.unwrap();
    let mut buf = vec![0u8; response.len()];
    socks.read_exact(&mut buf).await.unwrap();

    drop(socks);
    drop(target);

    let mut prefix = vec![0u8; ADDRESS_PREFIX_LEN];
    inspector_conn.read_exact(&mut prefix).await.unwrap();
    let mirrored = tokio::time::timeout(Duration::from_secs(5), read_frames(&mut inspector_conn))
        .await
        .unwrap();

    harness.stop().await;
    (prefix, mirrored)
}

#[tokio::test]
async fn test_inspector_receives_mirrored_traffic() {
    let (prefix, mirrored) = mirrored_session(Vec::new(), b"").await;

    assert_eq!(&prefix, b"93.184.216.34     ");
    assert_eq!(mirrored.outgoing, b"GET / HTTP/1.0\r\n\r\n");
    assert_eq!(mirrored.incoming, b"HTTP/1.0 204 No Content\r\n\r\n");
}

#[tokio::test]
async fn test_inspector_receives_bytes_after_gateway_header() {
    let (_, mirrored) = mirrored_session(Vec::new(), b"220 banner\r\n").await;

    assert_eq!(mirrored.outgoing, b"GET / HTTP/1.0\r\n\r\n");
    assert_eq!(mirrored.incoming, b"220 banner\r\nHTTP/1.0 204 No Content\r\n\r\n");
}

#[tokio::test]
async fn test_inspector_filters_exclude_other_destinations() {
    let (prefix, mirrored) =
        mirrored_session(vec!["10.0.0.0/8".parse().unwrap()], b"banner").await;

    assert_eq!(&prefix, b"93.184.216.34     ");
    assert!(mirrored.outgoing.is_empty());
    assert!(mirrored.incoming.is_empty());
}

#[tokio::test]
async fn test_unreachable_inspector_does_not_block_tunnel() {
    let mut gateway = MockGateway::accepting().await;
    let inspector = InspectorConfig {
        address: "127.0.0.1".into(),
        port: closed_port().await,
        filters: Vec::new(),
    };
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "pw", UpstreamParams::default(), None, Some(inspector))
        .unwrap();

    let (mut socks, _) = socks5_connect(harness.socks5_addr, "alice", "pw", PUBLIC_TARGET)
        .await
        .connected();
    let mut target = gateway.next_tunnel().await;

    socks.write_all(b"still works").await.unwrap();
    let mut buf = [0u8; 11];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still works");

    harness.stop().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_closes_open_tunnels() {
    let gateway = MockGateway::accepting().await;
    let echo = spawn_echo().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "pw", UpstreamParams::default(), None, None)
        .unwrap();

    let (mut socks, _) = socks5_connect(harness.socks5_addr, "alice", "pw", echo)
        .await
        .connected();
    socks.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    socks.read_exact(&mut buf).await.unwrap();

    let forwarder = std::sync::Arc::clone(&harness.forwarder);
    harness.stop().await;

    assert!(forwarder.registry().is_empty());
    assert!(is_closed(&mut socks).await);
}
