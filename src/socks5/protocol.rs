//! SOCKS5 wire constants and reply encoding (RFC 1928, RFC 1929)
//!
//! Only the subset the front door speaks: username/password authentication,
//! the CONNECT command and IPv4 or domain-name destinations.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// Username/password authentication method (RFC 1929)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;

/// Username/password sub-negotiation version
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// Sub-negotiation success status
pub const AUTH_STATUS_SUCCESS: u8 = 0x00;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// IPv4 address (4 bytes)
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name (1 byte length + N bytes name)
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address (16 bytes, never accepted)
pub const ATYP_IPV6: u8 = 0x04;

/// Succeeded
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Two-byte failure reply sent on every refusal: status version byte then
/// the generic failure code.
pub const REFUSAL: [u8; 2] = [0x01, 0xFF];

/// Encode a CONNECT reply carrying the bound address
///
/// IPv6 bound addresses are reported as `0.0.0.0` since only IPv4 is spoken.
#[must_use]
pub fn encode_reply(status: u8, bound: SocketAddr) -> [u8; 10] {
    let ip = match bound.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    };
    let [a, b, c, d] = ip.octets();
    let [p0, p1] = bound.port().to_be_bytes();
    [SOCKS5_VERSION, status, 0x00, ATYP_IPV4, a, b, c, d, p0, p1]
}

/// Refuse a connection: send the failure reply and shut the stream down
///
/// Errors from an already-closed peer are ignored.
pub async fn refuse<S>(stream: &mut S, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    debug!(reason = %reason, "Refusing connection");
    let _ = stream.write_all(&REFUSAL).await;
    let _ = stream.shutdown().await;
}
