//! Integration tests for proxy-forwarder
//!
//! Every test runs a real forwarder on ephemeral loopback ports against mock
//! gateways, targets and inspectors; no external network access is needed.
//!
//! # Test Organization
//!
//! - `common`: forwarder harness, SOCKS5 client and mock servers
//! - `socks5_integration`: handshake refusals and successful tunnels
//! - `accounting`: byte counts reported by deletes
//! - `control_plane`: RPC round trips, unknown methods and termination
//! - `lifecycle`: inactivity reaping and inspector mirroring

pub mod common;
pub mod lifecycle;
pub mod socks5_integration;
