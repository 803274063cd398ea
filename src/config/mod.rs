//! Configuration module for proxy-forwarder
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use proxy_forwarder::config::load_config_with_env;
//!
//! let config = load_config_with_env("/etc/proxy-forwarder/config.json").unwrap();
//! println!("SOCKS5 listener: {}", config.listen.address);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, ControlConfig, ListenConfig, LogConfig, RegistryConfig, TunnelConfig, UpstreamConfig,
};
