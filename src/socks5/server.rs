//! SOCKS5 front door
//!
//! Accepts public connections, authenticates them against the entry point
//! registry and hands CONNECT requests to the tunnel engine.
//!
//! # Connection states
//!
//! ```text
//! ACCEPTED --unknown host--------------------------------> REFUSED
//!    |
//! NEGOTIATING --no username/password method--------------> REFUSED
//!    |
//! AUTHENTICATING --bad username, password or host--------> REFUSED
//!    |
//! REQUESTING --not CONNECT, bad address, denied----------> REFUSED
//!    |
//! Tunnel::open --connect or gateway failure--------------> REFUSED
//!    |
//! ESTABLISHED (relay runs in the connection task)
//! ```
//!
//! Every refusal looks the same on the wire so a client cannot tell which
//! check failed.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::protocol::{
    refuse, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_METHOD_PASSWORD, AUTH_PASSWORD_VERSION,
    AUTH_STATUS_SUCCESS, CMD_CONNECT, SOCKS5_VERSION,
};
use crate::config::{ListenConfig, TunnelConfig};
use crate::error::Socks5Error;
use crate::registry::{EntryPoint, Registry};
use crate::tunnel::Tunnel;

/// Statistics for the SOCKS5 front door
#[derive(Debug, Default)]
pub struct Socks5ServerStats {
    /// Connections accepted
    pub connections_accepted: AtomicU64,
    /// Connections refused during the handshake
    pub connections_refused: AtomicU64,
    /// Tunnels that could not be opened
    pub tunnel_errors: AtomicU64,
    /// Tunnels established
    pub tunnels_established: AtomicU64,
}

impl Socks5ServerStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> Socks5ServerStatsSnapshot {
        Socks5ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            tunnel_errors: self.tunnel_errors.load(Ordering::Relaxed),
            tunnels_established: self.tunnels_established.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of SOCKS5 front door statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Socks5ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub tunnel_errors: u64,
    pub tunnels_established: u64,
}

/// Parsed and authorized CONNECT request
#[derive(Debug)]
pub struct ConnectRequest {
    /// Entry point the client authenticated as
    pub entry: Arc<EntryPoint>,
    /// Destination (domain names already resolved)
    pub address: Ipv4Addr,
    /// Destination port
    pub port: u16,
}

struct Context {
    registry: Arc<Registry>,
    listen: ListenConfig,
    tunnel: Arc<TunnelConfig>,
    stats: Arc<Socks5ServerStats>,
}

/// SOCKS5 listener
pub struct Socks5Server {
    listener: TcpListener,
    context: Arc<Context>,
}

impl Socks5Server {
    /// Bind the public listener
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(
        listen: ListenConfig,
        tunnel: Arc<TunnelConfig>,
        registry: Arc<Registry>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(listen.address).await?;
        Ok(Self {
            listener,
            context: Arc::new(Context {
                registry,
                listen,
                tunnel,
                stats: Arc::new(Socks5ServerStats::default()),
            }),
        })
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get server statistics
    pub fn stats(&self) -> &Arc<Socks5ServerStats> {
        &self.context.stats
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "SOCKS5 front door started");

        if *shutdown.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            self.context.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                handle_connection(stream, peer, context).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("SOCKS5 front door shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, context: Arc<Context>) {
    let peer_ip = peer.ip().to_canonical();
    let _ = stream.set_nodelay(true);

    if !context.registry.has_host(peer_ip) {
        let e = Socks5Error::UnknownHost(peer_ip);
        context.stats.connections_refused.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, error = %e, "SOCKS5 connection refused");
        refuse(&mut stream, &e.to_string()).await;
        return;
    }

    let handshake = timeout(
        context.listen.handshake_timeout(),
        socks5_handshake(&mut stream, peer_ip, &context.registry, &context.listen.deny_list),
    )
    .await
    .unwrap_or(Err(Socks5Error::Timeout));

    let request = match handshake {
        Ok(request) => request,
        Err(e) => {
            context.stats.connections_refused.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %peer, error = %e, "SOCKS5 handshake refused");
            refuse(&mut stream, &e.to_string()).await;
            return;
        }
    };

    let username = request.entry.username().to_string();
    let tunnel = match Tunnel::open(
        &request.entry,
        request.address,
        request.port,
        stream,
        &context.tunnel,
    )
    .await
    {
        Ok(tunnel) => tunnel,
        Err(e) => {
            context.stats.tunnel_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer = %peer,
                username = %username,
                remote = %SocketAddr::from((request.address, request.port)),
                error = %e,
                "Failed to open tunnel"
            );
            return;
        }
    };
    drop(request);

    context.stats.tunnels_established.fetch_add(1, Ordering::Relaxed);
    let (bytes_out, bytes_in) = tunnel.watch().await;

    debug!(
        peer = %peer,
        username = %username,
        remote = %tunnel.remote_address(),
        bytes_out,
        bytes_in,
        "Tunnel finished"
    );
}

/// Run negotiation, authentication and request parsing
///
/// # Errors
///
/// Returns `Socks5Error` describing the first failed step.
pub async fn socks5_handshake<S>(
    stream: &mut S,
    peer_ip: IpAddr,
    registry: &Registry,
    deny_list: &[Ipv4Addr],
) -> Result<ConnectRequest, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation: VER NMETHODS METHODS
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::Protocol(format!(
            "invalid SOCKS version: {}",
            header[0]
        )));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_METHOD_PASSWORD) {
        return Err(Socks5Error::Protocol(
            "username/password method not offered".into(),
        ));
    }
    stream
        .write_all(&[SOCKS5_VERSION, AUTH_METHOD_PASSWORD])
        .await?;

    // RFC 1929: VER ULEN UNAME PLEN PASSWD
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != AUTH_PASSWORD_VERSION {
        return Err(Socks5Error::Protocol(format!(
            "invalid auth version: {}",
            version[0]
        )));
    }
    let username = read_string(stream).await?;
    let password = read_string(stream).await?;

    let entry = registry
        .authenticate(&username, &password, peer_ip)
        .ok_or(Socks5Error::AuthFailed { username })?;
    stream
        .write_all(&[AUTH_PASSWORD_VERSION, AUTH_STATUS_SUCCESS])
        .await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let [version, command, _reserved, atyp] = request;
    if version != SOCKS5_VERSION {
        return Err(Socks5Error::Protocol(format!(
            "invalid SOCKS version in request: {version}"
        )));
    }
    if command != CMD_CONNECT {
        discard_destination(stream, atyp).await;
        return Err(Socks5Error::UnsupportedCommand(command));
    }

    let address = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets)
        }
        ATYP_DOMAIN => {
            let domain = read_string(stream).await?;
            resolve_ipv4(&domain).await?
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    if deny_list.contains(&address) {
        return Err(Socks5Error::Denied(address));
    }

    Ok(ConnectRequest {
        entry,
        address,
        port: u16::from_be_bytes(port),
    })
}

/// Consume DST.ADDR and DST.PORT of a request that will be refused
///
/// Unread request bytes would turn the refusal into a connection reset.
async fn discard_destination<S>(stream: &mut S, atyp: u8)
where
    S: AsyncRead + Unpin,
{
    let len = match atyp {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            if stream.read_exact(&mut len).await.is_err() {
                return;
            }
            usize::from(len[0]) + 2
        }
        _ => return,
    };
    let mut rest = vec![0u8; len];
    let _ = stream.read_exact(&mut rest).await;
}

/// Read a one-byte length followed by that many bytes of UTF-8
async fn read_string<S>(stream: &mut S) -> Result<String, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; len[0] as usize];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| Socks5Error::Protocol("field is not valid UTF-8".into()))
}

/// Resolve a domain name to its first IPv4 address
async fn resolve_ipv4(domain: &str) -> Result<Ipv4Addr, Socks5Error> {
    let addrs = lookup_host((domain, 0))
        .await
        .map_err(|e| Socks5Error::Resolve(format!("{domain}: {e}")))?;

    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Socks5Error::Resolve(format!("{domain}: no IPv4 address")))
}
