//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: socks5={}, control=127.0.0.1:{}, gateway={}:{}",
        config.listen.address, config.control.port, config.upstream.host, config.upstream.port
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// A missing file is not an error here: defaults are used and the
/// environment is expected to supply the deployment values.
///
/// Environment variables:
/// - `FORWARDER_PUBLIC_PROXY_PORT`: SOCKS5 listen port
/// - `FORWARDER_INSIDE_SOCKET_PORT`: control-plane port
/// - `FORWARDER_PROXY_HOST` / `FORWARDER_PROXY_PORT`: gateway address
/// - `FORWARDER_PROXY_USERNAME` / `FORWARDER_PROXY_BASE_PASSWORD`: gateway credentials
/// - `FORWARDER_INACTIVE_TIMEOUT`: inactivity timeout in seconds
/// - `FORWARDER_BUFFER_SIZE`: relay chunk size
/// - `FORWARDER_LOG_LEVEL`: log level
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        load_config(path)?
    } else {
        debug!("No configuration file at {:?}, using defaults", path);
        Config::default()
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    config.validate()?;

    Ok(config)
}

/// Apply overrides from a variable lookup function
///
/// Split out from [`load_config_with_env`] so overrides can be tested without
/// touching the process environment.
pub(crate) fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = parse_env::<u16>(&lookup, "FORWARDER_PUBLIC_PROXY_PORT")? {
        config.listen.address.set_port(port);
        debug!("SOCKS5 port overridden to {}", port);
    }

    if let Some(port) = parse_env::<u16>(&lookup, "FORWARDER_INSIDE_SOCKET_PORT")? {
        config.control.port = port;
        debug!("Control port overridden to {}", port);
    }

    if let Some(host) = lookup("FORWARDER_PROXY_HOST") {
        config.upstream.host = host;
    }

    if let Some(port) = parse_env::<u16>(&lookup, "FORWARDER_PROXY_PORT")? {
        config.upstream.port = port;
    }

    if let Some(username) = lookup("FORWARDER_PROXY_USERNAME") {
        config.upstream.username = username;
    }

    if let Some(password) = lookup("FORWARDER_PROXY_BASE_PASSWORD") {
        config.upstream.base_password = password;
    }

    if let Some(secs) = parse_env::<u64>(&lookup, "FORWARDER_INACTIVE_TIMEOUT")? {
        config.registry.inactivity_timeout_secs = secs;
        debug!("Inactivity timeout overridden to {}s", secs);
    }

    if let Some(size) = parse_env::<usize>(&lookup, "FORWARDER_BUFFER_SIZE")? {
        config.tunnel.buffer_size = size;
    }

    if let Some(level) = lookup("FORWARDER_LOG_LEVEL") {
        config.log.level = level;
    }

    Ok(())
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::EnvError {
            name: name.into(),
            reason: format!("Invalid value: {raw}"),
        }),
    }
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
