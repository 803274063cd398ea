//! SOCKS5 front door integration tests
//!
//! # Test Categories
//!
//! 1. **Tunnel Tests**: CONNECT through the gateway and direct bypass
//! 2. **Refusal Tests**: every failed check produces the same refusal
//! 3. **Gateway Failure Tests**: upstream rejection reaches the client

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use proxy_forwarder::UpstreamParams;

use super::common::{
    domain_request, is_closed, read_up_to, socks5_connect, socks5_negotiate, socks5_transcript,
    spawn_echo, test_config, Harness, MockGateway, REFUSAL,
};

const PUBLIC_TARGET: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443);

fn sticky_params() -> UpstreamParams {
    UpstreamParams {
        country: Some("au".into()),
        session: Some("abcdFG12".into()),
        duration: Some("30m".into()),
    }
}

// ============================================================================
// Tunnel Tests
// ============================================================================

#[tokio::test]
async fn test_connect_through_gateway() {
    let mut gateway = MockGateway::accepting().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "s3cret", sticky_params(), None, None)
        .unwrap();

    let (mut client, reply) = socks5_connect(harness.socks5_addr, "alice", "s3cret", PUBLIC_TARGET)
        .await
        .connected();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

    let mut target = gateway.next_tunnel().await;
    let head = gateway.requests.lock()[0].clone();
    let credentials = BASE64_STANDARD.encode(
        "gw-user:gw-pass_country-au_session-abcdFG12_lifetime-30m_skipispstatic-1",
    );
    assert!(head.starts_with("CONNECT 93.184.216.34:443 HTTP/1.1\r\n"));
    assert!(head.contains(&format!("Proxy-Authorization: Basic {credentials}\r\n")));

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    target.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    let entry = harness.forwarder.registry().get("alice").unwrap();
    assert_eq!(entry.tunnel_count(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_local_target_bypasses_gateway() {
    let gateway = MockGateway::accepting().await;
    let echo = spawn_echo().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "s3cret", UpstreamParams::default(), None, None)
        .unwrap();

    let (mut client, _) = socks5_connect(harness.socks5_addr, "alice", "s3cret", echo)
        .await
        .connected();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    assert_eq!(gateway.accepted.load(Ordering::SeqCst), 0);
    harness.stop().await;
}

#[tokio::test]
async fn test_domain_name_target() {
    let gateway = MockGateway::accepting().await;
    let echo = spawn_echo().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "s3cret", UpstreamParams::default(), None, None)
        .unwrap();

    let (mut client, _) = socks5_negotiate(
        harness.socks5_addr,
        &[0x05, 0x01, 0x02],
        "alice",
        "s3cret",
        &domain_request("localhost", echo.port()),
    )
    .await
    .connected();
    client.write_all(b"via name").await.unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"via name");

    harness.stop().await;
}

// ============================================================================
// Refusal Tests
// ============================================================================

#[tokio::test]
async fn test_single_field_mismatch_is_refused() {
    let gateway = MockGateway::accepting().await;
    let echo = spawn_echo().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    let forwarder = &harness.forwarder;
    forwarder
        .create_entry_point("alice", "s3cret", UpstreamParams::default(), None, None)
        .unwrap();
    forwarder
        .create_entry_point(
            "bob",
            "hunter2",
            UpstreamParams::default(),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))),
            None,
        )
        .unwrap();

    let cases = [
        ("mallory", "s3cret"),
        ("alice", "wrong"),
        ("alice", "s3cret "),
        ("bob", "hunter2"),
    ];
    for (username, password) in cases {
        let outcome = socks5_connect(harness.socks5_addr, username, password, echo).await;
        assert_eq!(outcome.refusal(), REFUSAL, "{username}/{password}");
    }

    let (_client, _) = socks5_connect(harness.socks5_addr, "alice", "s3cret", echo)
        .await
        .connected();

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_host_refused_without_reading() {
    let gateway = MockGateway::accepting().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point(
            "alice",
            "s3cret",
            UpstreamParams::default(),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))),
            None,
        )
        .unwrap();

    let mut stream = TcpStream::connect(harness.socks5_addr).await.unwrap();
    assert_eq!(read_up_to(&mut stream, 2).await, REFUSAL);
    assert!(is_closed(&mut stream).await);

    harness.stop().await;
}

#[tokio::test]
async fn test_password_method_required() {
    let gateway = MockGateway::accepting().await;
    let echo = spawn_echo().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "s3cret", UpstreamParams::default(), None, None)
        .unwrap();

    let outcome = socks5_negotiate(
        harness.socks5_addr,
        &[0x05, 0x01, 0x00],
        "alice",
        "s3cret",
        &super::common::ipv4_request(echo),
    )
    .await;
    assert_eq!(outcome.refusal(), REFUSAL);

    harness.stop().await;
}

#[tokio::test]
async fn test_bind_command_refused() {
    let gateway = MockGateway::accepting().await;
    let echo = spawn_echo().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "s3cret", UpstreamParams::default(), None, None)
        .unwrap();

    let mut request = super::common::ipv4_request(echo);
    request[1] = 0x02;
    let outcome = socks5_negotiate(
        harness.socks5_addr,
        &[0x05, 0x01, 0x02],
        "alice",
        "s3cret",
        &request,
    )
    .await;
    assert_eq!(outcome.refusal(), REFUSAL);

    harness.stop().await;
}

#[tokio::test]
async fn test_denied_destination_never_reaches_gateway() {
    let gateway = MockGateway::accepting().await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "s3cret", UpstreamParams::default(), None, None)
        .unwrap();

    let denied = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
    let outcome = socks5_connect(harness.socks5_addr, "alice", "s3cret", denied).await;
    assert_eq!(outcome.refusal(), REFUSAL);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.accepted.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.forwarder.registry().get("alice").unwrap().tunnel_count(),
        0
    );

    harness.stop().await;
}

// ============================================================================
// Gateway Failure Tests
// ============================================================================

#[tokio::test]
async fn test_gateway_rejection_refuses_client() {
    let gateway =
        MockGateway::start("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n", b"").await;
    let harness = Harness::start(test_config(gateway.port())).await;
    harness
        .forwarder
        .create_entry_point("alice", "s3cret", UpstreamParams::default(), None, None)
        .unwrap();

    // Success reply is sent before the gateway status is read
    let transcript =
        socks5_transcript(harness.socks5_addr, "alice", "s3cret", PUBLIC_TARGET).await;
    assert_eq!(transcript.len(), 12, "{transcript:?}");
    assert_eq!(&transcript[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&transcript[10..], &REFUSAL);
    assert_eq!(gateway.accepted.load(Ordering::SeqCst), 1);

    let entry = harness.forwarder.registry().get("alice").unwrap();
    assert_eq!(entry.tunnel_count(), 0);
    assert_eq!(entry.usage(), (0, 0));

    harness.stop().await;
}

#[tokio::test]
async fn test_unreachable_gateway_refuses_client() {
    let harness = Harness::start(test_config(super::common::closed_port().await)).await;
    harness
        .forwarder
        .create_entry_point("alice", "s3cret", UpstreamParams::default(), None, None)
        .unwrap();

    let outcome = socks5_connect(harness.socks5_addr, "alice", "s3cret", PUBLIC_TARGET).await;
    assert_eq!(outcome.refusal(), REFUSAL);
    assert!(harness.forwarder.exists_entry_point("alice"));

    harness.stop().await;
}
