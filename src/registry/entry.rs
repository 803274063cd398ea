//! Entry point: a registered virtual proxy identity

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::tunnel::Tunnel;
use crate::upstream::UpstreamProxySpec;

/// Side channel receiving a mirrored copy of tunnel traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InspectorConfig {
    /// Inspector host
    pub address: String,

    /// Inspector port
    pub port: u16,

    /// Only mirror tunnels whose remote address is in one of these ranges.
    /// Empty means mirror everything.
    #[serde(default)]
    pub filters: Vec<Ipv4Net>,
}

impl InspectorConfig {
    /// Whether traffic to `remote` passes the filter list
    #[must_use]
    pub fn matches(&self, remote: Ipv4Addr) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|net| net.contains(&remote))
    }
}

/// Totals reported when an entry point is torn down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelUsage {
    /// Tunnels force-closed by the teardown
    pub closed: usize,
    /// Proxy-attributed bytes sent to remote destinations
    pub bytes_out: u64,
    /// Proxy-attributed bytes received from remote destinations
    pub bytes_in: u64,
}

#[derive(Default)]
struct TunnelSet {
    closed: bool,
    by_destination: HashMap<String, Vec<Arc<Tunnel>>>,
}

/// A registered virtual proxy identity
///
/// Owns every tunnel opened through it. Tunnels are keyed by their
/// `address:port` destination; one destination may have several live tunnels.
pub struct EntryPoint {
    username: String,
    password: String,
    generation: u64,
    upstream: Arc<UpstreamProxySpec>,
    client_host: IpAddr,
    inspector: Option<InspectorConfig>,
    created_at: f64,
    last_activity: Mutex<Instant>,
    tunnels: Mutex<TunnelSet>,
    retired_out: AtomicU64,
    retired_in: AtomicU64,
}

impl EntryPoint {
    pub(crate) fn new(
        username: String,
        password: String,
        generation: u64,
        upstream: UpstreamProxySpec,
        client_host: IpAddr,
        inspector: Option<InspectorConfig>,
        created_at: f64,
    ) -> Self {
        Self {
            username,
            password,
            generation,
            upstream: Arc::new(upstream),
            client_host,
            inspector,
            created_at,
            last_activity: Mutex::new(Instant::now()),
            tunnels: Mutex::new(TunnelSet::default()),
            retired_out: AtomicU64::new(0),
            retired_in: AtomicU64::new(0),
        }
    }

    /// Unique username
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Registration sequence number, distinct for every created entry point
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Upstream proxy credentials shared by all tunnels
    #[must_use]
    pub fn upstream(&self) -> &Arc<UpstreamProxySpec> {
        &self.upstream
    }

    /// The only source address allowed to authenticate
    #[must_use]
    pub const fn client_host(&self) -> IpAddr {
        self.client_host
    }

    /// Optional traffic mirror target
    #[must_use]
    pub fn inspector(&self) -> Option<&InspectorConfig> {
        self.inspector.as_ref()
    }

    /// Creation time as Unix seconds
    #[must_use]
    pub const fn created_at(&self) -> f64 {
        self.created_at
    }

    /// Check credentials and source address
    ///
    /// The password comparison runs in constant time.
    #[must_use]
    pub fn verify(&self, password: &str, peer: IpAddr) -> bool {
        let password_ok: bool = self.password.as_bytes().ct_eq(password.as_bytes()).into();
        password_ok && self.client_host == peer
    }

    /// Record activity now
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last relayed byte (or creation)
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether the entry point has been idle longer than `timeout`
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    /// Number of live tunnels
    #[must_use]
    pub fn tunnel_count(&self) -> usize {
        self.tunnels
            .lock()
            .by_destination
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Proxy-attributed usage so far, live and finished tunnels included
    #[must_use]
    pub fn usage(&self) -> (u64, u64) {
        let (mut out, mut inn) = (
            self.retired_out.load(Ordering::Relaxed),
            self.retired_in.load(Ordering::Relaxed),
        );
        for tunnel in self.tunnels.lock().by_destination.values().flatten() {
            let (o, i) = tunnel.usage();
            out += o;
            inn += i;
        }
        (out, inn)
    }

    /// Register a freshly opened tunnel
    ///
    /// Returns `false` if the entry point has already been torn down; the
    /// caller then owns closing the tunnel.
    pub(crate) fn attach(&self, tunnel: Arc<Tunnel>) -> bool {
        let mut set = self.tunnels.lock();
        if set.closed {
            return false;
        }
        set.by_destination
            .entry(destination_key(tunnel.remote_address(), tunnel.remote_port()))
            .or_default()
            .push(tunnel);
        true
    }

    /// Remove a tunnel whose relay loop has finished, keeping its usage
    ///
    /// The retired totals are updated under the set lock so a concurrent
    /// [`close_all`](Self::close_all) sees either the live tunnel or its bytes.
    pub(crate) fn retire(&self, tunnel: &Arc<Tunnel>, bytes_out: u64, bytes_in: u64) {
        let key = destination_key(tunnel.remote_address(), tunnel.remote_port());
        let mut set = self.tunnels.lock();
        let Some(list) = set.by_destination.get_mut(&key) else {
            return;
        };
        let before = list.len();
        list.retain(|t| !Arc::ptr_eq(t, tunnel));
        let removed = list.len() != before;
        if list.is_empty() {
            set.by_destination.remove(&key);
        }

        if removed {
            self.retired_out.fetch_add(bytes_out, Ordering::Relaxed);
            self.retired_in.fetch_add(bytes_in, Ordering::Relaxed);
        }
    }

    /// Force-close every owned tunnel and refuse new ones
    pub(crate) fn close_all(&self) -> TunnelUsage {
        let (drained, mut usage) = {
            let mut set = self.tunnels.lock();
            set.closed = true;
            let drained: Vec<Arc<Tunnel>> =
                set.by_destination.drain().flat_map(|(_, v)| v).collect();
            let usage = TunnelUsage {
                closed: drained.len(),
                bytes_out: self.retired_out.load(Ordering::Relaxed),
                bytes_in: self.retired_in.load(Ordering::Relaxed),
            };
            (drained, usage)
        };

        for tunnel in drained {
            let (out, inn) = tunnel.close();
            usage.bytes_out += out;
            usage.bytes_in += inn;
        }

        debug!(
            username = %self.username,
            closed = usage.closed,
            bytes_out = usage.bytes_out,
            bytes_in = usage.bytes_in,
            "Entry point tunnels closed"
        );

        usage
    }
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("username", &self.username)
            .field("generation", &self.generation)
            .field("client_host", &self.client_host)
            .field("upstream", &self.upstream)
            .field("inspector", &self.inspector)
            .finish_non_exhaustive()
    }
}

fn destination_key(remote: Ipv4Addr, port: u16) -> String {
    format!("{remote}:{port}")
}
