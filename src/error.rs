//! Error types for proxy-forwarder
//!
//! This module defines the error hierarchy for the forwarder. Errors are
//! grouped by subsystem and carry recovery hints where it matters.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;

use crate::rpc::RemoteError;

/// Top-level error type for proxy-forwarder
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Upstream proxy spec errors
    #[error("Upstream proxy error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Tunnel construction and relay errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Control-plane errors
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ForwarderError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Upstream(_) => false,
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Rpc(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Upstream proxy spec validation errors
///
/// All variants map to the `InvalidParameter` kind on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// Country code is not in the supported set
    #[error("Country `{0}` not supported")]
    UnsupportedCountry(String),

    /// Duration string is malformed or out of bounds
    #[error("Invalid duration `{value}`: {reason}")]
    InvalidDuration { value: String, reason: String },

    /// Compact proxy ident cannot be parsed
    #[error("Invalid proxy ident `{ident}`: {reason}")]
    InvalidIdent { ident: String, reason: String },
}

impl UpstreamError {
    /// Create an invalid duration error
    pub fn duration(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid ident error
    pub fn ident(ident: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdent {
            ident: ident.into(),
            reason: reason.into(),
        }
    }
}

/// SOCKS5 front door errors
///
/// Every variant ends in the same refusal on the wire; the distinction only
/// exists for logging.
#[derive(Debug, Error)]
pub enum Socks5Error {
    /// Peer address has no registered entry point
    #[error("Unknown client host: {0}")]
    UnknownHost(std::net::IpAddr),

    /// Malformed or unsupported handshake
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Credentials or source host did not match
    #[error("Authentication failed for `{username}`")]
    AuthFailed { username: String },

    /// Command other than CONNECT
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// Address type other than IPv4 or domain name
    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Domain name could not be resolved to an IPv4 address
    #[error("Failed to resolve `{0}`")]
    Resolve(String),

    /// Destination is on the deny list
    #[error("Destination {0} is not allowed")]
    Denied(Ipv4Addr),

    /// Handshake did not finish in time
    #[error("Handshake timed out")]
    Timeout,

    /// I/O error
    #[error("SOCKS5 I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Tunnel construction and relay errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Connection to the target or the proxy gateway failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    /// Connection attempt timed out
    #[error("Connection to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: SocketAddr, timeout_secs: u64 },

    /// Proxy gateway did not confirm the CONNECT request
    #[error("Proxy did not confirm the connection to {target}: {status}")]
    UpstreamRejected { target: SocketAddr, status: String },

    /// Owning entry point was deleted while the tunnel was opening
    #[error("Entry point `{0}` is closed")]
    EntryPointClosed(String),

    /// I/O error
    #[error("Tunnel I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } | Self::Timeout { .. } => true,
            Self::UpstreamRejected { .. } => true,
            Self::EntryPointClosed(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connect failed error
    pub fn connect_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr,
            reason: reason.into(),
        }
    }
}

/// Control-plane communication errors
#[derive(Debug, Error)]
pub enum RpcError {
    /// Listener is down (connection refused)
    #[error("Control plane unreachable at {addr}")]
    ServerUnreachable { addr: SocketAddr },

    /// Failed to bind the control listener
    #[error("Failed to bind control listener to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Frame exceeds the configured maximum
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Protocol error (invalid frame contents)
    #[error("RPC protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("RPC serialization error: {0}")]
    SerializationError(String),

    /// Error raised by the remote method, reconstructed locally
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// I/O error
    #[error("RPC I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl RpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ServerUnreachable { .. } => true,
            Self::BindError { .. } => false,
            Self::FrameTooLarge { .. } => false,
            Self::ProtocolError(_) => true,
            Self::SerializationError(_) => false,
            Self::Remote(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Type alias for Result with ForwarderError
pub type Result<T> = std::result::Result<T, ForwarderError>;
