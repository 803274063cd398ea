//! Entry point registry
//!
//! Holds the username map and the client-host index under one lock so that
//! check-then-act sequences (create-if-absent, delete-if-stale) are atomic and
//! the two maps never disagree.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tracing::{debug, info};

use super::entry::{EntryPoint, InspectorConfig};
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::upstream::{UpstreamParams, UpstreamProxySpec};

/// Result of a create request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CreateOutcome {
    /// Registered; carries the creation time as Unix seconds
    Created { created_at: f64 },
    /// The username is already taken; nothing was changed
    AlreadyExists,
}

/// Usage totals returned by a delete
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeleteSummary {
    /// Tunnels force-closed by this delete
    pub closed_tunnel_count: usize,
    /// Proxy-attributed bytes sent over the entry point's lifetime
    pub total_bytes_out: u64,
    /// Proxy-attributed bytes received over the entry point's lifetime
    pub total_bytes_in: u64,
    /// Deletion time as Unix seconds
    pub timestamp: f64,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, Arc<EntryPoint>>,
    hosts: HashMap<IpAddr, HashSet<String>>,
}

impl RegistryInner {
    fn remove(&mut self, username: &str) -> Option<Arc<EntryPoint>> {
        let entry = self.entries.remove(username)?;
        let host = entry.client_host();
        if let Some(names) = self.hosts.get_mut(&host) {
            names.remove(username);
            if names.is_empty() {
                self.hosts.remove(&host);
            }
        }
        Some(entry)
    }
}

/// Set of live entry points
pub struct Registry {
    gateway: UpstreamConfig,
    inner: RwLock<RegistryInner>,
    next_generation: AtomicU64,
}

impl Registry {
    /// Create an empty registry for entry points behind `gateway`
    #[must_use]
    pub fn new(gateway: UpstreamConfig) -> Self {
        Self {
            gateway,
            inner: RwLock::new(RegistryInner::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register a new entry point
    ///
    /// `client_host` defaults to loopback. An existing username is reported as
    /// [`CreateOutcome::AlreadyExists`] without touching the stored entry.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` if the upstream parameters fail validation.
    pub fn create(
        &self,
        username: &str,
        password: &str,
        params: UpstreamParams,
        client_host: Option<IpAddr>,
        inspector: Option<InspectorConfig>,
    ) -> Result<CreateOutcome, UpstreamError> {
        let client_host = client_host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let mut inner = self.inner.write();
        if inner.entries.contains_key(username) {
            debug!(username = %username, "Entry point already exists");
            return Ok(CreateOutcome::AlreadyExists);
        }

        let upstream = UpstreamProxySpec::build(&self.gateway, params)?;
        let created_at = unix_timestamp();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let entry = EntryPoint::new(
            username.to_string(),
            password.to_string(),
            generation,
            upstream,
            client_host,
            inspector,
            created_at,
        );

        inner.entries.insert(username.to_string(), Arc::new(entry));
        inner
            .hosts
            .entry(client_host)
            .or_default()
            .insert(username.to_string());
        drop(inner);

        info!(username = %username, client_host = %client_host, "Entry point created");
        Ok(CreateOutcome::Created { created_at })
    }

    /// Remove an entry point, force-closing its tunnels
    ///
    /// Returns `None` if no entry point has this username.
    pub fn delete(&self, username: &str) -> Option<DeleteSummary> {
        let entry = self.inner.write().remove(username)?;
        let summary = teardown(&entry);
        info!(
            username = %username,
            closed = summary.closed_tunnel_count,
            bytes_out = summary.total_bytes_out,
            bytes_in = summary.total_bytes_in,
            "Entry point deleted"
        );
        Some(summary)
    }

    /// Remove an entry point only if it is still the same registration and
    /// still idle past `timeout`
    pub fn delete_if_stale(
        &self,
        username: &str,
        generation: u64,
        timeout: Duration,
    ) -> Option<DeleteSummary> {
        let entry = {
            let mut inner = self.inner.write();
            let current = inner.entries.get(username)?;
            if current.generation() != generation || !current.is_stale(timeout) {
                return None;
            }
            inner.remove(username)?
        };
        Some(teardown(&entry))
    }

    /// Remove every entry point
    pub fn delete_all(&self) -> Vec<(String, DeleteSummary)> {
        let drained: Vec<Arc<EntryPoint>> = {
            let mut inner = self.inner.write();
            inner.hosts.clear();
            inner.entries.drain().map(|(_, e)| e).collect()
        };

        drained
            .iter()
            .map(|entry| (entry.username().to_string(), teardown(entry)))
            .collect()
    }

    /// Whether an entry point with this username is registered
    #[must_use]
    pub fn exists(&self, username: &str) -> bool {
        self.inner.read().entries.contains_key(username)
    }

    /// Look up an entry point
    #[must_use]
    pub fn get(&self, username: &str) -> Option<Arc<EntryPoint>> {
        self.inner.read().entries.get(username).cloned()
    }

    /// Record activity on an entry point
    pub fn touch(&self, username: &str) {
        if let Some(entry) = self.inner.read().entries.get(username) {
            entry.touch();
        }
    }

    /// Whether any entry point may connect from `host`
    #[must_use]
    pub fn has_host(&self, host: IpAddr) -> bool {
        self.inner.read().hosts.contains_key(&host)
    }

    /// Validate SOCKS5 credentials against the registry
    ///
    /// Username, password and source address must all match.
    #[must_use]
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        peer: IpAddr,
    ) -> Option<Arc<EntryPoint>> {
        let entry = self.get(username)?;
        entry.verify(password, peer).then_some(entry)
    }

    /// Number of registered entry points
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Registered usernames
    #[must_use]
    pub fn usernames(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    /// Usernames registered for one client host
    #[must_use]
    pub fn usernames_for_host(&self, host: IpAddr) -> Vec<String> {
        self.inner
            .read()
            .hosts
            .get(&host)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete every entry point idle longer than `timeout`
    ///
    /// Candidates are collected under the read lock and each is deleted only
    /// if its generation still matches, so a re-created entry point with the
    /// same name survives a scan that saw its predecessor.
    pub fn reap_inactive(&self, timeout: Duration) -> Vec<(String, DeleteSummary)> {
        let candidates: Vec<(String, u64, Duration)> = self
            .inner
            .read()
            .entries
            .values()
            .filter(|e| e.is_stale(timeout))
            .map(|e| (e.username().to_string(), e.generation(), e.idle_for()))
            .collect();

        let mut reaped = Vec::with_capacity(candidates.len());
        for (username, generation, idle) in candidates {
            if let Some(summary) = self.delete_if_stale(&username, generation, timeout) {
                info!(
                    username = %username,
                    idle_secs = idle.as_secs(),
                    closed = summary.closed_tunnel_count,
                    "Entry point reaped: inactive longer than {}s",
                    timeout.as_secs()
                );
                reaped.push((username, summary));
            }
        }
        reaped
    }

    /// Run the inactivity reaper until shutdown is signalled
    ///
    /// The period equals the inactivity timeout.
    pub async fn run_reaper(
        self: Arc<Self>,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval_at(TokioInstant::now() + timeout, timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(timeout_secs = timeout.as_secs(), "Inactivity reaper started");

        if *shutdown.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.reap_inactive(timeout);
                    if !reaped.is_empty() {
                        debug!(count = reaped.len(), "Reaper cycle finished");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Inactivity reaper stopped");
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

fn teardown(entry: &EntryPoint) -> DeleteSummary {
    let usage = entry.close_all();
    DeleteSummary {
        closed_tunnel_count: usage.closed,
        total_bytes_out: usage.bytes_out,
        total_bytes_in: usage.bytes_in,
        timestamp: unix_timestamp(),
    }
}

/// Current time as fractional Unix seconds
#[must_use]
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
