//! Inspector mirror
//!
//! Copies relayed chunks to an external inspector. On attach the remote
//! address is sent as an 18-byte space-padded prefix; every mirrored chunk is
//! then framed as a 4-byte big-endian length, a direction byte and the payload.
//!
//! Frames go through a bounded per-tunnel queue drained by one worker task, so
//! a slow inspector never stalls the relay. When the queue is full the chunk
//! is dropped for the mirror only.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::registry::InspectorConfig;

/// Width of the remote address prefix
pub const ADDRESS_PREFIX_LEN: usize = 18;

/// Frame header: 4-byte length + 1-byte direction
pub const FRAME_HEADER_LEN: usize = 5;

/// Relay direction of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to remote
    Outgoing,
    /// Remote to client
    Incoming,
}

impl Direction {
    /// Direction flag on the wire
    #[must_use]
    pub const fn flag(self) -> u8 {
        match self {
            Self::Outgoing => 1,
            Self::Incoming => 0,
        }
    }
}

/// Space-padded remote address sent when the mirror attaches
#[must_use]
pub fn address_prefix(remote: Ipv4Addr) -> [u8; ADDRESS_PREFIX_LEN] {
    let mut prefix = [b' '; ADDRESS_PREFIX_LEN];
    let text = remote.to_string();
    let len = text.len().min(ADDRESS_PREFIX_LEN);
    prefix[..len].copy_from_slice(&text.as_bytes()[..len]);
    prefix
}

/// Frame one chunk for the inspector
#[must_use]
pub fn encode_frame(direction: Direction, chunk: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + chunk.len());
    buf.put_u32(chunk.len() as u32);
    buf.put_u8(direction.flag());
    buf.put_slice(chunk);
    buf.freeze()
}

/// Mirror side channel of one tunnel
#[derive(Debug)]
pub struct Mirror {
    tx: mpsc::Sender<Bytes>,
    matches: bool,
    disabled: bool,
    dropped: u64,
}

impl Mirror {
    /// Connect to the inspector, send the address prefix and start the worker
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` if the inspector cannot be reached in time or the
    /// prefix cannot be written.
    pub async fn attach(
        inspector: &InspectorConfig,
        remote: Ipv4Addr,
        capacity: usize,
        connect_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let connect = TcpStream::connect((inspector.address.as_str(), inspector.port));
        let mut stream = timeout(connect_timeout, connect).await.map_err(|_| {
            TunnelError::IoError(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "inspector {}:{} did not answer in {}s",
                    inspector.address,
                    inspector.port,
                    connect_timeout.as_secs()
                ),
            ))
        })??;

        stream.write_all(&address_prefix(remote)).await?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(forward_frames(stream, rx, remote));

        Ok(Self {
            tx,
            matches: inspector.matches(remote),
            disabled: false,
            dropped: 0,
        })
    }

    /// Queue a copy of a relayed chunk
    pub fn offer(&mut self, direction: Direction, chunk: &[u8]) {
        if !self.matches || self.disabled {
            return;
        }
        match self.tx.try_send(encode_frame(direction, chunk)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.dropped += 1,
            Err(TrySendError::Closed(_)) => {
                debug!("Mirror worker gone, mirroring disabled");
                self.disabled = true;
            }
        }
    }

    /// Chunks dropped because the queue was full
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Whether mirroring has been switched off after a failure
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled
    }
}

async fn forward_frames(mut stream: TcpStream, mut rx: mpsc::Receiver<Bytes>, remote: Ipv4Addr) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = stream.write_all(&frame).await {
            warn!(remote = %remote, error = %e, "Inspector connection broken, mirroring disabled");
            return;
        }
    }
    let _ = stream.shutdown().await;
}
