//! Control-plane RPC
//!
//! A length-framed request/response protocol over a loopback socket. The
//! external API process uses it to create, delete and query entry points and
//! to stop the forwarder.
//!
//! # Example
//!
//! ```no_run
//! use proxy_forwarder::rpc::RpcClient;
//! use proxy_forwarder::upstream::UpstreamParams;
//!
//! # async fn example() -> Result<(), proxy_forwarder::error::RpcError> {
//! let client = RpcClient::new("127.0.0.1:38900".parse().unwrap());
//! let created = client
//!     .create_entry_point("alice", "secret", &UpstreamParams::country("au"), None, None)
//!     .await?;
//! println!("created at {created:?}");
//! # Ok(())
//! # }
//! ```

mod client;
mod handler;
mod protocol;
mod server;

pub use client::RpcClient;
pub use handler::{lookup, CallArgs, Handler, MAX_CREDENTIAL_LEN, METHODS};
pub use protocol::{
    decode_request, decode_response, encode_frame, encode_request, encode_response, read_frame,
    write_frame, RemoteError, RemoteErrorKind, RpcRequest, RpcResponse, ERROR_SENTINEL,
    LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{dispatch, RpcServer};
