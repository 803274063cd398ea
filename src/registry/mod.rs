//! Entry point registry and lifecycle
//!
//! Entry points are created and deleted through the control plane, looked up
//! by the SOCKS5 front door during authentication, and reaped once idle past
//! the inactivity timeout.

mod entry;
mod manager;

pub use entry::{EntryPoint, InspectorConfig, TunnelUsage};
pub use manager::{unix_timestamp, CreateOutcome, DeleteSummary, Registry};
