//! SOCKS5 front door (username/password, CONNECT, IPv4 and domain names)

pub mod protocol;
mod server;

pub use protocol::{refuse, REFUSAL};
pub use server::{
    socks5_handshake, ConnectRequest, Socks5Server, Socks5ServerStats, Socks5ServerStatsSnapshot,
};
