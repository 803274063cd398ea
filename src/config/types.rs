//! Configuration types for proxy-forwarder
//!
//! This module defines all configuration structures used by the forwarder.
//! Configuration is loaded from JSON files and validated at startup.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Public SOCKS5 listener
    #[serde(default)]
    pub listen: ListenConfig,

    /// Loopback control-plane listener
    #[serde(default)]
    pub control: ControlConfig,

    /// Upstream proxy gateway credentials
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Tunnel and relay settings
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Entry point registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;
        self.control.validate()?;
        self.upstream.validate()?;
        self.tunnel.validate()?;
        self.registry.validate()?;

        let listen_ip = self.listen.address.ip();
        if self.listen.address.port() == self.control.port
            && (listen_ip.is_loopback() || listen_ip.is_unspecified())
        {
            return Err(ConfigError::ValidationError(format!(
                "SOCKS5 listener and control plane both use port {}",
                self.control.port
            )));
        }

        Ok(())
    }
}

/// Public SOCKS5 listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Listen address (e.g., "127.0.0.1:1080")
    pub address: SocketAddr,

    /// Time allowed for negotiation, authentication and request parsing
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Destinations that are always refused
    #[serde(default = "default_deny_list")]
    pub deny_list: Vec<Ipv4Addr>,
}

impl ListenConfig {
    /// Validate listen configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "handshake_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get handshake timeout as Duration
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1080),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            deny_list: default_deny_list(),
        }
    }
}

/// Control-plane RPC configuration
///
/// The listener always binds to the loopback interface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Loopback port
    pub port: u16,

    /// Maximum accepted frame payload
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl ControlConfig {
    /// Validate control configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "control port must be greater than 0".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Loopback address the control plane binds to
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.port)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: 38900,
            max_message_size: default_max_message_size(),
        }
    }
}

/// Upstream proxy gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Gateway host
    pub host: String,

    /// Gateway port
    pub port: u16,

    /// Account username
    pub username: String,

    /// Account password that rotation parameters are appended to
    pub base_password: String,
}

impl UpstreamConfig {
    /// Validate upstream configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "upstream host must not be empty".into(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "upstream port must be greater than 0".into(),
            ));
        }
        if self.username.contains(':') {
            return Err(ConfigError::ValidationError(
                "upstream username must not contain ':'".into(),
            ));
        }
        Ok(())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            username: String::new(),
            base_password: String::new(),
        }
    }
}

/// Tunnel and relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Relay chunk size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Connect timeout for the gateway or a bypassed target, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Destinations reached directly instead of through the gateway
    #[serde(default = "default_known_infra_ranges")]
    pub known_infra_ranges: Vec<Ipv4Net>,

    /// Chunks buffered per tunnel for the inspector mirror
    #[serde(default = "default_mirror_queue_capacity")]
    pub mirror_queue_capacity: usize,
}

impl TunnelConfig {
    /// Validate tunnel configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_size must be greater than 0".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.mirror_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "mirror_queue_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            known_infra_ranges: default_known_infra_ranges(),
            mirror_queue_capacity: default_mirror_queue_capacity(),
        }
    }
}

/// Entry point registry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Inactivity timeout in seconds, also the reaper period
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
}

impl RegistryConfig {
    /// Validate registry configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inactivity_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "inactivity_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get inactivity timeout as Duration
    #[must_use]
    pub const fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("text" or "json")
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include the event target in output
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

const fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_deny_list() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(8, 8, 8, 8)]
}

const fn default_max_message_size() -> usize {
    1024 * 1024
}

const fn default_buffer_size() -> usize {
    4096
}

const fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_known_infra_ranges() -> Vec<Ipv4Net> {
    [
        "64.233.160.0/19",
        "66.102.0.0/20",
        "74.125.0.0/16",
        "108.177.0.0/17",
        "142.250.0.0/15",
        "172.217.0.0/16",
        "173.194.0.0/16",
        "209.85.128.0/17",
        "216.58.192.0/19",
    ]
    .iter()
    .filter_map(|cidr| cidr.parse().ok())
    .collect()
}

const fn default_mirror_queue_capacity() -> usize {
    256
}

const fn default_inactivity_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
