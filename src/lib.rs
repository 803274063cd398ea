//! proxy-forwarder: multi-tenant SOCKS5 front door for a rotating upstream
//! HTTP proxy gateway
//!
//! Each tenant gets an *entry point*: a username/password pair, the host it
//! may connect from and an upstream spec (country, sticky session, session
//! lifetime). Clients speak SOCKS5 to the forwarder; every CONNECT is relayed
//! through the gateway with credentials derived from the entry point, and the
//! bytes are accounted per entry point.
//!
//! # Architecture
//!
//! ```text
//! Client --SOCKS5--> Socks5Server --> Tunnel --HTTP CONNECT--> Gateway --> Destination
//!                        |               |
//!                     Registry        Mirror --> Inspector (optional)
//!                        ^
//!   API --RPC--> RpcServer
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use proxy_forwarder::config::load_config_with_env;
//! use proxy_forwarder::ProxyForwarder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config_with_env("/etc/proxy-forwarder/config.json")?;
//! let forwarder = Arc::new(ProxyForwarder::new(config));
//! forwarder.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`forwarder`]: Process-level wiring and shutdown
//! - [`registry`]: Entry points and the inactivity reaper
//! - [`rpc`]: Control-plane protocol, server and client
//! - [`socks5`]: SOCKS5 front door
//! - [`tunnel`]: Gateway CONNECT, relay and inspector mirroring
//! - [`upstream`]: Upstream credential derivation

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod forwarder;
pub mod registry;
pub mod rpc;
pub mod socks5;
pub mod tunnel;
pub mod upstream;

pub use config::{Config, ListenConfig, UpstreamConfig};
pub use error::{
    ConfigError, ForwarderError, Result, RpcError, Socks5Error, TunnelError, UpstreamError,
};
pub use forwarder::{Listeners, ProxyForwarder};
pub use registry::{DeleteSummary, EntryPoint, InspectorConfig, Registry};
pub use rpc::{RpcClient, RpcServer};
pub use socks5::Socks5Server;
pub use tunnel::Tunnel;
pub use upstream::{UpstreamParams, UpstreamProxySpec};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
