//! Path selection: direct connection or through the upstream gateway

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Why a tunnel skips the upstream gateway
///
/// Bypassed traffic is never counted as usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Private, loopback or link-local destination
    LocalNetwork,
    /// Destination inside a configured infrastructure range
    KnownInfraRange,
}

impl BypassReason {
    /// Human-readable reason
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalNetwork => "local network",
            Self::KnownInfraRange => "known infra range",
        }
    }
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide whether `remote` is reached directly
#[must_use]
pub fn classify(remote: Ipv4Addr, infra_ranges: &[Ipv4Net]) -> Option<BypassReason> {
    if is_local(remote) {
        return Some(BypassReason::LocalNetwork);
    }
    if infra_ranges.iter().any(|net| net.contains(&remote)) {
        return Some(BypassReason::KnownInfraRange);
    }
    None
}

fn is_local(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}
