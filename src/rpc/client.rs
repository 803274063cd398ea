//! Control-plane client
//!
//! Used by the external API process (and the tests) to drive a running
//! forwarder.

use std::io;
use std::net::{IpAddr, SocketAddr};

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;

use super::protocol::{
    decode_response, encode_request, read_frame, write_frame, RpcRequest, RpcResponse,
    MAX_MESSAGE_SIZE,
};
use crate::error::RpcError;
use crate::registry::{DeleteSummary, InspectorConfig};
use crate::upstream::UpstreamParams;

/// Client for the control-plane RPC
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: SocketAddr,
    max_message_size: usize,
}

impl RpcClient {
    /// Create a client for the listener at `addr`
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Limit the accepted response size
    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Invoke a method and return its raw JSON result
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ServerUnreachable` if nothing listens at the
    /// address, `RpcError::Remote` if the method raised an error, or another
    /// `RpcError` for transport failures.
    pub async fn call(
        &self,
        method_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RpcError> {
        let mut stream = TcpStream::connect(self.addr).await.map_err(|e| {
            if e.kind() == io::ErrorKind::ConnectionRefused {
                RpcError::ServerUnreachable { addr: self.addr }
            } else {
                RpcError::IoError(e)
            }
        })?;

        let request = RpcRequest {
            method_name: method_name.to_string(),
            args,
            kwargs,
        };
        write_frame(&mut stream, &encode_request(&request)?).await?;

        let payload = read_frame(&mut stream, self.max_message_size).await?;
        match decode_response(&payload)? {
            RpcResponse::Value(value) => Ok(value),
            RpcResponse::Error(e) => Err(RpcError::Remote(e)),
        }
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        method_name: &str,
        kwargs: Map<String, Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method_name, Vec::new(), kwargs).await?;
        serde_json::from_value(value).map_err(|e| RpcError::serialization(e.to_string()))
    }

    /// Register an entry point
    ///
    /// Returns the creation timestamp, or `None` if the username is taken.
    ///
    /// # Errors
    ///
    /// Returns `RpcError` on transport failure or a remote validation error.
    pub async fn create_entry_point(
        &self,
        username: &str,
        password: &str,
        params: &UpstreamParams,
        client_host: Option<IpAddr>,
        inspector: Option<&InspectorConfig>,
    ) -> Result<Option<f64>, RpcError> {
        let mut kwargs = Map::new();
        kwargs.insert("username".into(), json!(username));
        kwargs.insert("password".into(), json!(password));
        kwargs.insert("proxy_kwargs".into(), json!(params));
        kwargs.insert("client_host".into(), json!(client_host.map(|h| h.to_string())));
        kwargs.insert("inspector".into(), json!(inspector));
        self.call_typed("create_entry_point", kwargs).await
    }

    /// Delete an entry point
    ///
    /// Returns `None` if there was no such entry point.
    ///
    /// # Errors
    ///
    /// Returns `RpcError` on transport failure.
    pub async fn delete_entry_point(
        &self,
        username: &str,
    ) -> Result<Option<DeleteSummary>, RpcError> {
        let mut kwargs = Map::new();
        kwargs.insert("username".into(), json!(username));
        self.call_typed("delete_entry_point", kwargs).await
    }

    /// Check whether an entry point exists
    ///
    /// # Errors
    ///
    /// Returns `RpcError` on transport failure.
    pub async fn exists_entry_point(&self, username: &str) -> Result<bool, RpcError> {
        let mut kwargs = Map::new();
        kwargs.insert("username".into(), json!(username));
        self.call_typed("exists_entry_point", kwargs).await
    }

    /// Ask the forwarder to shut down
    ///
    /// # Errors
    ///
    /// Returns `RpcError` on transport failure.
    pub async fn terminate(&self) -> Result<(), RpcError> {
        self.call("terminate", Vec::new(), Map::new()).await?;
        Ok(())
    }
}
