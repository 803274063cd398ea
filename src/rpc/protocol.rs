//! Control-plane wire protocol
//!
//! Every message is framed as:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: payload
//!
//! A request payload is a JSON object `{method_name, args, kwargs}`. A response
//! payload is either the JSON-encoded result, or [`ERROR_SENTINEL`] followed by
//! a JSON `{kind, message}` object.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

/// Maximum frame payload accepted by default
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Length prefix size
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Marks a response payload as an error description
pub const ERROR_SENTINEL: &[u8] = b"x8742365__exc__";

/// A method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Exported method to invoke
    pub method_name: String,

    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl RpcRequest {
    /// Call with keyword arguments only
    pub fn new(method_name: impl Into<String>, kwargs: Map<String, Value>) -> Self {
        Self {
            method_name: method_name.into(),
            args: Vec::new(),
            kwargs,
        }
    }
}

/// Closed set of error kinds carried back to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteErrorKind {
    /// Method name is not exported
    UnknownMethod,
    /// Frame or request object could not be decoded
    InvalidRequest,
    /// Arguments missing, extra or of the wrong type
    InvalidArguments,
    /// Arguments well-formed but rejected by validation
    InvalidParameter,
    /// The method failed unexpectedly
    Internal,
}

impl RemoteErrorKind {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownMethod => "UNKNOWN_METHOD",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidArguments => "INVALID_ARGUMENTS",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a control-plane method
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Error kind
    pub kind: RemoteErrorKind,
    /// Human-readable message
    pub message: String,
}

impl RemoteError {
    /// Create a new error
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Unknown method error
    pub fn unknown_method(name: &str) -> Self {
        Self::new(RemoteErrorKind::UnknownMethod, format!("Method `{name}` is not exported"))
    }

    /// Invalid arguments error
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidArguments, message)
    }

    /// Invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidParameter, message)
    }
}

/// Decoded response payload
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    /// Method result
    Value(Value),
    /// Method error
    Error(RemoteError),
}

impl From<Result<Value, RemoteError>> for RpcResponse {
    fn from(result: Result<Value, RemoteError>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(e) => Self::Error(e),
        }
    }
}

/// Encode a request payload (without the length prefix)
///
/// # Errors
///
/// Returns `RpcError::SerializationError` if serialization fails.
pub fn encode_request(request: &RpcRequest) -> Result<Vec<u8>, RpcError> {
    serde_json::to_vec(request).map_err(|e| RpcError::serialization(e.to_string()))
}

/// Decode a request payload
///
/// # Errors
///
/// Returns `RpcError::ProtocolError` if the payload is not a request object.
pub fn decode_request(payload: &[u8]) -> Result<RpcRequest, RpcError> {
    serde_json::from_slice(payload).map_err(|e| RpcError::protocol(e.to_string()))
}

/// Encode a response payload (without the length prefix)
///
/// # Errors
///
/// Returns `RpcError::SerializationError` if serialization fails.
pub fn encode_response(response: &RpcResponse) -> Result<Vec<u8>, RpcError> {
    match response {
        RpcResponse::Value(value) => {
            serde_json::to_vec(value).map_err(|e| RpcError::serialization(e.to_string()))
        }
        RpcResponse::Error(error) => {
            let mut payload = ERROR_SENTINEL.to_vec();
            serde_json::to_writer(&mut payload, error)
                .map_err(|e| RpcError::serialization(e.to_string()))?;
            Ok(payload)
        }
    }
}

/// Decode a response payload
///
/// # Errors
///
/// Returns `RpcError::ProtocolError` if the payload is not valid JSON.
pub fn decode_response(payload: &[u8]) -> Result<RpcResponse, RpcError> {
    match payload.strip_prefix(ERROR_SENTINEL) {
        Some(error) => serde_json::from_slice(error)
            .map(RpcResponse::Error)
            .map_err(|e| RpcError::protocol(format!("invalid error payload: {e}"))),
        None => serde_json::from_slice(payload)
            .map(RpcResponse::Value)
            .map_err(|e| RpcError::protocol(e.to_string())),
    }
}

/// Prefix a payload with its length
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Read one frame, looping until the declared length is satisfied
///
/// # Errors
///
/// Returns `RpcError::FrameTooLarge` if the declared length exceeds
/// `max_size`, or an I/O error.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(RpcError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one frame
///
/// # Errors
///
/// Returns an I/O error if the write fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}
