//! Top-level forwarder
//!
//! Owns the entry point registry and runs the SOCKS5 front door, the control
//! plane and the inactivity reaper against it. All three stop on one shared
//! shutdown signal, raised only after every entry point has been deleted.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Config, TunnelConfig};
use crate::error::{ForwarderError, UpstreamError};
use crate::registry::{CreateOutcome, DeleteSummary, InspectorConfig, Registry};
use crate::rpc::RpcServer;
use crate::socks5::Socks5Server;
use crate::upstream::UpstreamParams;

/// The long-lived forwarder process state
pub struct ProxyForwarder {
    config: Config,
    registry: Arc<Registry>,
    tunnel: Arc<TunnelConfig>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

/// Bound listeners, ready to serve
pub struct Listeners {
    /// Public SOCKS5 listener
    pub socks5: Socks5Server,
    /// Loopback control-plane listener
    pub rpc: RpcServer,
}

impl Listeners {
    /// SOCKS5 listener address
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket address cannot be read.
    pub fn socks5_addr(&self) -> std::io::Result<SocketAddr> {
        self.socks5.local_addr()
    }

    /// Control-plane listener address
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket address cannot be read.
    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.rpc.local_addr()
    }
}

impl ProxyForwarder {
    /// Create a forwarder from a validated configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Arc::new(Registry::new(config.upstream.clone())),
            tunnel: Arc::new(config.tunnel.clone()),
            shutdown_tx: Arc::new(shutdown_tx),
            config,
        }
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Entry point registry
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register an entry point
    ///
    /// Returns the creation timestamp, or `None` if the username is taken.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` if the upstream parameters are invalid.
    pub fn create_entry_point(
        &self,
        username: &str,
        password: &str,
        params: UpstreamParams,
        client_host: Option<IpAddr>,
        inspector: Option<InspectorConfig>,
    ) -> Result<Option<f64>, UpstreamError> {
        let outcome = self
            .registry
            .create(username, password, params, client_host, inspector)?;
        Ok(match outcome {
            CreateOutcome::Created { created_at } => Some(created_at),
            CreateOutcome::AlreadyExists => None,
        })
    }

    /// Delete an entry point and close its tunnels
    pub fn delete_entry_point(&self, username: &str) -> Option<DeleteSummary> {
        self.registry.delete(username)
    }

    /// Whether an entry point exists
    #[must_use]
    pub fn exists_entry_point(&self, username: &str) -> bool {
        self.registry.exists(username)
    }

    /// Delete every entry point, then stop the listeners and the reaper
    pub fn shutdown(&self) {
        shutdown(&self.registry, &self.shutdown_tx);
    }

    /// Start [`shutdown`](Self::shutdown) in the background
    pub fn terminate(&self) {
        let registry = Arc::clone(&self.registry);
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        tokio::spawn(async move {
            shutdown(&registry, &shutdown_tx);
        });
    }

    /// Whether shutdown has been signalled
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Receiver for the shutdown signal
    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Bind the configured SOCKS5 and control-plane addresses
    ///
    /// # Errors
    ///
    /// Returns `ForwarderError` if either address cannot be bound.
    pub async fn bind(self: &Arc<Self>) -> Result<Listeners, ForwarderError> {
        self.bind_to(self.config.listen.address, self.config.control.address())
            .await
    }

    /// Bind explicit addresses
    ///
    /// # Errors
    ///
    /// Returns `ForwarderError` if either address cannot be bound.
    pub async fn bind_to(
        self: &Arc<Self>,
        socks5_addr: SocketAddr,
        control_addr: SocketAddr,
    ) -> Result<Listeners, ForwarderError> {
        let mut listen = self.config.listen.clone();
        listen.address = socks5_addr;

        let socks5 = Socks5Server::bind(
            listen,
            Arc::clone(&self.tunnel),
            Arc::clone(&self.registry),
        )
        .await?;
        let rpc = RpcServer::bind(
            control_addr,
            self.config.control.max_message_size,
            Arc::clone(self),
        )
        .await?;

        Ok(Listeners { socks5, rpc })
    }

    /// Serve until shutdown
    pub async fn serve(self: Arc<Self>, listeners: Listeners) {
        let Listeners { socks5, rpc } = listeners;

        let reaper = tokio::spawn(Arc::clone(&self.registry).run_reaper(
            self.config.registry.inactivity_timeout(),
            self.subscribe_shutdown(),
        ));

        tokio::join!(
            socks5.run(self.subscribe_shutdown()),
            rpc.run(self.subscribe_shutdown()),
        );

        if let Err(e) = reaper.await {
            warn!(error = %e, "Reaper task failed");
        }

        info!("Forwarder stopped");
    }

    /// Bind the configured addresses and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns `ForwarderError` if binding fails.
    pub async fn run(self: Arc<Self>) -> Result<(), ForwarderError> {
        let listeners = self.bind().await?;
        info!(
            socks5 = %listeners.socks5_addr()?,
            control = %listeners.control_addr()?,
            gateway = %format!("{}:{}", self.config.upstream.host, self.config.upstream.port),
            "Forwarder started"
        );
        self.serve(listeners).await;
        Ok(())
    }
}

impl std::fmt::Debug for ProxyForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyForwarder")
            .field("registry", &self.registry)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

fn shutdown(registry: &Registry, shutdown_tx: &watch::Sender<bool>) {
    let deleted = registry.delete_all();
    info!(entry_points = deleted.len(), "All entry points deleted, stopping listeners");
    shutdown_tx.send_replace(true);
}
