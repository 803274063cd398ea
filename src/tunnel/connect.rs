//! Outbound connection setup
//!
//! Direct connects for bypassed destinations and HTTP CONNECT negotiation with
//! the upstream gateway for everything else.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::trace;

use crate::error::TunnelError;

/// Largest gateway response header accepted
pub const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Status line prefix the gateway must answer with
pub const CONNECT_OK_PREFIX: &[u8] = b"HTTP/1.1 200";

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Connect to `addr`, giving up after `connect_timeout`
///
/// # Errors
///
/// Returns `TunnelError::Timeout` or `TunnelError::ConnectFailed`.
pub async fn connect_with_timeout(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            trace!(addr = %addr, "Connected");
            Ok(stream)
        }
        Ok(Err(e)) => Err(TunnelError::connect_failed(addr, e.to_string())),
        Err(_) => Err(TunnelError::Timeout {
            addr,
            timeout_secs: connect_timeout.as_secs(),
        }),
    }
}

/// Resolve the gateway host
///
/// # Errors
///
/// Returns `TunnelError::IoError` if the name does not resolve.
pub async fn resolve_gateway(host: &str, port: u16) -> Result<SocketAddr, TunnelError> {
    lookup_host((host, port)).await?.next().ok_or_else(|| {
        TunnelError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("gateway {host}:{port} did not resolve"),
        ))
    })
}

/// Render the CONNECT request for `target`
#[must_use]
pub fn connect_request(target: SocketAddr, authorization: &str) -> String {
    format!("CONNECT {target} HTTP/1.1\r\nProxy-Authorization: Basic {authorization}\r\n\r\n")
}

/// Send the CONNECT request
///
/// # Errors
///
/// Returns `TunnelError::IoError` if the write fails.
pub async fn send_connect<S>(
    stream: &mut S,
    target: SocketAddr,
    authorization: &str,
) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(connect_request(target, authorization).as_bytes())
        .await?;
    Ok(())
}

/// Read the gateway's response header and require a 200 status
///
/// Returns any bytes received past the end of the header; they belong to the
/// tunnelled stream.
///
/// # Errors
///
/// Returns `TunnelError::UpstreamRejected` for a non-200 status, a closed
/// connection or an oversized header.
pub async fn read_connect_response<S>(
    stream: &mut S,
    target: SocketAddr,
) -> Result<Vec<u8>, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEADER {
            return Err(rejected(target, "response header too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.starts_with(CONNECT_OK_PREFIX) {
                break buf.len();
            }
            return Err(rejected(target, status_line(&buf).unwrap_or("connection closed")));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if !buf.starts_with(CONNECT_OK_PREFIX) {
        return Err(rejected(target, status_line(&buf).unwrap_or("malformed response")));
    }

    Ok(buf.split_off(header_end))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|pos| pos + HEADER_END.len())
}

fn status_line(buf: &[u8]) -> Option<&str> {
    let line = buf.split(|&b| b == b'\r' || b == b'\n').next()?;
    std::str::from_utf8(line).ok().filter(|l| !l.is_empty())
}

fn rejected(target: SocketAddr, status: &str) -> TunnelError {
    TunnelError::UpstreamRejected {
        target,
        status: status.to_string(),
    }
}
