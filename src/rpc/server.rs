//! Control-plane server
//!
//! Loopback TCP listener; one task per connection, one request per
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::handler::{lookup, CallArgs};
use super::protocol::{
    decode_request, encode_response, read_frame, write_frame, RemoteError, RemoteErrorKind,
    RpcRequest, RpcResponse,
};
use crate::error::RpcError;
use crate::forwarder::ProxyForwarder;

/// Control-plane RPC server
pub struct RpcServer {
    listener: TcpListener,
    forwarder: Arc<ProxyForwarder>,
    max_message_size: usize,
}

impl RpcServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// Returns `RpcError::BindError` if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        max_message_size: usize,
        forwarder: Arc<ProxyForwarder>,
    ) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::BindError {
                addr,
                reason: e.to_string(),
            })?;

        Ok(Self {
            listener,
            forwarder,
            max_message_size,
        })
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve requests until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "Control plane listening");

        if *shutdown.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let forwarder = Arc::clone(&self.forwarder);
                            let max_size = self.max_message_size;
                            tokio::spawn(async move {
                                let result = handle_connection(stream, forwarder, max_size).await;
                                if let Err(e) = result {
                                    debug!(peer = %peer, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Control plane accept error");
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Control plane shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    forwarder: Arc<ProxyForwarder>,
    max_message_size: usize,
) -> Result<(), RpcError> {
    let response = match read_frame(&mut stream, max_message_size).await {
        Ok(payload) => match decode_request(&payload) {
            Ok(request) => dispatch(&forwarder, request).await,
            Err(e) => {
                warn!(error = %e, "Invalid control request");
                RpcResponse::Error(RemoteError::new(RemoteErrorKind::InvalidRequest, e.to_string()))
            }
        },
        Err(e @ RpcError::FrameTooLarge { .. }) => {
            warn!(error = %e, "Control request rejected");
            RpcResponse::Error(RemoteError::new(RemoteErrorKind::InvalidRequest, e.to_string()))
        }
        Err(e) => return Err(e),
    };

    write_frame(&mut stream, &encode_response(&response)?).await
}

/// Invoke an exported method
///
/// Unknown names are rejected before anything else happens. The handler runs
/// in its own task so a panic becomes an `Internal` error response.
pub async fn dispatch(forwarder: &Arc<ProxyForwarder>, request: RpcRequest) -> RpcResponse {
    let RpcRequest {
        method_name,
        args,
        kwargs,
    } = request;

    let Some(handler) = lookup(&method_name) else {
        warn!(method = %method_name, "Rejected call to unknown method");
        return RpcResponse::Error(RemoteError::unknown_method(&method_name));
    };

    debug!(method = %method_name, "Control call");

    let forwarder = Arc::clone(forwarder);
    let call = CallArgs::new(method_name.clone(), args, kwargs);
    let result = tokio::spawn(async move { handler(&forwarder, call) })
        .await
        .unwrap_or_else(|e| {
            error!(method = %method_name, error = %e, "Control method failed");
            Err(RemoteError::new(
                RemoteErrorKind::Internal,
                format!("{method_name}() failed: {e}"),
            ))
        });

    if let Err(e) = &result {
        debug!(error = %e, "Control call returned an error");
    }

    result.into()
}
