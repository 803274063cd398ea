//! Tunnel and relay engine
//!
//! One [`Tunnel`] per accepted CONNECT request. A tunnel either connects to
//! its destination directly (local networks and known infrastructure ranges)
//! or through the owning entry point's upstream gateway, then relays bytes
//! both ways while counting proxied usage and optionally mirroring traffic
//! to an inspector.
//!
//! # Relay
//!
//! ```text
//! SOCKS5 client <--> Tunnel::watch <--> gateway (HTTP CONNECT) --> remote
//!                        |
//!                        +--> bounded queue --> mirror worker --> inspector
//! ```

mod classify;
mod connect;
mod mirror;
mod relay;

pub use classify::{classify, BypassReason};
pub use connect::{connect_request, CONNECT_OK_PREFIX, MAX_RESPONSE_HEADER};
pub use mirror::{address_prefix, encode_frame, Direction, Mirror, ADDRESS_PREFIX_LEN};
pub use relay::Tunnel;
