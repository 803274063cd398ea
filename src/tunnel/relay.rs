//! Tunnel construction and the relay loop

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::classify::{classify, BypassReason};
use super::connect::{connect_with_timeout, read_connect_response, resolve_gateway, send_connect};
use super::mirror::{Direction, Mirror};
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::registry::EntryPoint;
use crate::socks5::protocol::{encode_reply, refuse, REPLY_SUCCEEDED};

struct Sockets {
    client: TcpStream,
    upstream: TcpStream,
    mirror: Option<Mirror>,
}

/// One relayed connection between a SOCKS5 client and a remote destination
///
/// Owns both sockets until [`Tunnel::watch`] takes them. [`Tunnel::close`]
/// signals the relay to drop them; a tunnel that was never watched has its
/// sockets dropped by `close` directly.
pub struct Tunnel {
    remote_address: Ipv4Addr,
    remote_port: u16,
    bypass_reason: Option<BypassReason>,
    created_at: Instant,
    updated_at: Mutex<Instant>,
    is_active: AtomicBool,
    closed: AtomicBool,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    buffer_size: usize,
    close_tx: watch::Sender<bool>,
    sockets: Mutex<Option<Sockets>>,
    owner: Weak<EntryPoint>,
}

impl Tunnel {
    /// Open a tunnel for an authenticated CONNECT request
    ///
    /// Bypassed destinations are connected directly; everything else goes
    /// through the owner's upstream gateway with an HTTP CONNECT. The client
    /// receives the SOCKS5 success reply once the outbound socket is up. On
    /// any failure the client is refused and the error returned.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` if the outbound connection or the gateway
    /// negotiation fails, or the owner was deleted meanwhile.
    pub async fn open(
        owner: &Arc<EntryPoint>,
        remote_address: Ipv4Addr,
        remote_port: u16,
        mut client: TcpStream,
        config: &TunnelConfig,
    ) -> Result<Arc<Self>, TunnelError> {
        let bypass_reason = classify(remote_address, &config.known_infra_ranges);
        let target = SocketAddr::from((remote_address, remote_port));

        let established = establish(owner, target, bypass_reason, &mut client, config).await;
        let (upstream, leftover) = match established {
            Ok(established) => established,
            Err(e) => {
                refuse(&mut client, &e.to_string()).await;
                return Err(e);
            }
        };

        let now = Instant::now();
        let (close_tx, _) = watch::channel(false);
        let early_bytes = leftover.len() as u64;
        let tunnel = Arc::new(Self {
            remote_address,
            remote_port,
            bypass_reason,
            created_at: now,
            updated_at: Mutex::new(now),
            is_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            bytes_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(if bypass_reason.is_none() { early_bytes } else { 0 }),
            buffer_size: config.buffer_size,
            close_tx,
            sockets: Mutex::new(Some(Sockets {
                client,
                upstream,
                mirror: None,
            })),
            owner: Arc::downgrade(owner),
        });
        tunnel.is_active.store(true, Ordering::Release);

        if let Some(inspector) = owner.inspector() {
            match Mirror::attach(
                inspector,
                remote_address,
                config.mirror_queue_capacity,
                config.connect_timeout(),
            )
            .await
            {
                Ok(mut mirror) => {
                    if !leftover.is_empty() {
                        mirror.offer(Direction::Incoming, &leftover);
                    }
                    if let Some(sockets) = tunnel.sockets.lock().as_mut() {
                        sockets.mirror = Some(mirror);
                    }
                }
                Err(e) => warn!(
                    username = %owner.username(),
                    inspector = %format!("{}:{}", inspector.address, inspector.port),
                    error = %e,
                    "Inspector unavailable, tunnel not mirrored"
                ),
            }
        }

        if !owner.attach(Arc::clone(&tunnel)) {
            let taken = tunnel.sockets.lock().take();
            tunnel.close();
            if let Some(mut sockets) = taken {
                refuse(&mut sockets.client, "entry point closed").await;
            }
            return Err(TunnelError::EntryPointClosed(owner.username().to_string()));
        }

        info!(
            username = %owner.username(),
            remote = %target,
            bypass = ?bypass_reason.map(BypassReason::as_str),
            "Tunnel opened"
        );

        Ok(tunnel)
    }

    /// Relay bytes until either side closes or the tunnel is closed
    ///
    /// Always closes the tunnel on exit and returns its final usage.
    pub async fn watch(self: &Arc<Self>) -> (u64, u64) {
        let taken = self.sockets.lock().take();
        let Some(Sockets {
            mut client,
            mut upstream,
            mut mirror,
        }) = taken
        else {
            return self.finish();
        };

        let owner = self.owner.upgrade();
        let mut closed_rx = self.close_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return self.finish();
        }

        let mut client_buf = vec![0u8; self.buffer_size];
        let mut upstream_buf = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                _ = closed_rx.changed() => break,
                result = client.read(&mut client_buf) => {
                    let n = match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let written = tokio::select! {
                        r = upstream.write_all(&client_buf[..n]) => r.is_ok(),
                        _ = closed_rx.changed() => false,
                    };
                    if !written {
                        break;
                    }
                    self.account(Direction::Outgoing, &client_buf[..n], mirror.as_mut());
                }
                result = upstream.read(&mut upstream_buf) => {
                    let n = match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let written = tokio::select! {
                        r = client.write_all(&upstream_buf[..n]) => r.is_ok(),
                        _ = closed_rx.changed() => false,
                    };
                    if !written {
                        break;
                    }
                    self.account(Direction::Incoming, &upstream_buf[..n], mirror.as_mut());
                }
            }

            *self.updated_at.lock() = Instant::now();
            if let Some(owner) = &owner {
                owner.touch();
            }
        }

        if let Some(mirror) = &mirror {
            if mirror.dropped() > 0 || mirror.is_disabled() {
                debug!(
                    remote = %self.remote_address,
                    dropped = mirror.dropped(),
                    disabled = mirror.is_disabled(),
                    "Mirror incomplete"
                );
            }
        }

        drop(client);
        drop(upstream);
        self.finish()
    }

    /// Close the tunnel
    ///
    /// Idempotent. Returns the proxy-attributed `(bytes_out, bytes_in)`, which
    /// is `(0, 0)` for bypassed tunnels.
    pub fn close(&self) -> (u64, u64) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.is_active.store(false, Ordering::Release);
            let _ = self.close_tx.send(true);
            drop(self.sockets.lock().take());
            debug!(
                remote = %self.remote_address,
                port = self.remote_port,
                "Tunnel closed"
            );
        }
        self.usage()
    }

    /// Proxy-attributed `(bytes_out, bytes_in)` so far
    #[must_use]
    pub fn usage(&self) -> (u64, u64) {
        if self.bypass_reason.is_some() {
            return (0, 0);
        }
        (
            self.bytes_out.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed),
        )
    }

    /// Destination address
    #[must_use]
    pub const fn remote_address(&self) -> Ipv4Addr {
        self.remote_address
    }

    /// Destination port
    #[must_use]
    pub const fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Why the gateway is skipped, if it is
    #[must_use]
    pub const fn bypass_reason(&self) -> Option<BypassReason> {
        self.bypass_reason
    }

    /// Whether the tunnel is established and not yet closed
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// When the tunnel was established
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When bytes last moved
    #[must_use]
    pub fn updated_at(&self) -> Instant {
        *self.updated_at.lock()
    }

    fn account(&self, direction: Direction, chunk: &[u8], mirror: Option<&mut Mirror>) {
        if self.bypass_reason.is_none() {
            let counter = match direction {
                Direction::Outgoing => &self.bytes_out,
                Direction::Incoming => &self.bytes_in,
            };
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        if let Some(mirror) = mirror {
            mirror.offer(direction, chunk);
        }
    }

    fn finish(self: &Arc<Self>) -> (u64, u64) {
        let (bytes_out, bytes_in) = self.close();
        if let Some(owner) = self.owner.upgrade() {
            owner.retire(self, bytes_out, bytes_in);
        }
        (bytes_out, bytes_in)
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("remote_address", &self.remote_address)
            .field("remote_port", &self.remote_port)
            .field("bypass_reason", &self.bypass_reason)
            .field("is_active", &self.is_active())
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

/// Connect the outbound side and confirm the CONNECT to the client
///
/// Returns the outbound socket and the tunnelled bytes the gateway sent along
/// with its response header, already forwarded to the client.
async fn establish(
    owner: &EntryPoint,
    target: SocketAddr,
    bypass_reason: Option<BypassReason>,
    client: &mut TcpStream,
    config: &TunnelConfig,
) -> Result<(TcpStream, Vec<u8>), TunnelError> {
    let connect_timeout = config.connect_timeout();

    if bypass_reason.is_some() {
        let upstream = connect_with_timeout(target, connect_timeout).await?;
        client
            .write_all(&encode_reply(REPLY_SUCCEEDED, upstream.local_addr()?))
            .await?;
        return Ok((upstream, Vec::new()));
    }

    let spec = owner.upstream();
    let gateway = resolve_gateway(spec.host(), spec.port()).await?;
    let mut upstream = connect_with_timeout(gateway, connect_timeout).await?;

    send_connect(&mut upstream, target, &spec.basic_authorization()).await?;
    client
        .write_all(&encode_reply(REPLY_SUCCEEDED, upstream.local_addr()?))
        .await?;

    let leftover = tokio::time::timeout(
        connect_timeout,
        read_connect_response(&mut upstream, target),
    )
    .await
    .map_err(|_| TunnelError::Timeout {
        addr: gateway,
        timeout_secs: connect_timeout.as_secs(),
    })??;

    if !leftover.is_empty() {
        client.write_all(&leftover).await?;
    }

    Ok((upstream, leftover))
}
