//! Error types for the ACP bridge

use crate::protocol::RpcError;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error codes used on the wire
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    /// Generic code for failures raised inside an agent handler
    pub const HANDLER_FAILURE: i32 = -32603;
    pub const BUSY: i32 = -32001;
    pub const TIMEOUT: i32 = -32002;
    pub const CONNECTION_CLOSED: i32 = -32003;
    pub const TRANSPORT_FAILURE: i32 = -32004;
    /// Same value LSP and ACP use for a cancelled request
    pub const CANCELLED: i32 = -32800;
}

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A frame could not be decoded into a protocol message
    ///
    /// The offending frame is dropped; the connection survives.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The envelope was well-formed JSON but not a valid message
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The agent capability raised while processing a call
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    /// A second turn arrived for a single-flight session
    #[error("Session busy: {0}")]
    Busy(String),

    #[error("Request cancelled")]
    Cancelled,

    /// A pending outbound call exceeded its deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    /// Unrecoverable transport I/O; fatal to the whole connection
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The peer answered one of our calls with an error
    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(RpcError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl BridgeError {
    /// Convert bridge error to JSON-RPC error code
    pub fn to_json_rpc_error(&self) -> i32 {
        match self {
            BridgeError::Decode(_) => codes::PARSE_ERROR,
            BridgeError::InvalidRequest(_) => codes::INVALID_REQUEST,
            BridgeError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            BridgeError::InvalidParams(_) => codes::INVALID_PARAMS,
            BridgeError::Busy(_) => codes::BUSY,
            BridgeError::Cancelled => codes::CANCELLED,
            BridgeError::Timeout(_) => codes::TIMEOUT,
            BridgeError::ConnectionClosed => codes::CONNECTION_CLOSED,
            BridgeError::TransportFailure(_) | BridgeError::WebSocket(_) => {
                codes::TRANSPORT_FAILURE
            }
            BridgeError::Remote(error) => error.code,
            _ => codes::HANDLER_FAILURE,
        }
    }

    /// Build the wire error object sent to the peer
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            BridgeError::Remote(error) => error.clone(),
            other => RpcError::new(other.to_json_rpc_error(), other.to_string()),
        }
    }

    /// Whether this error ends the whole connection rather than a single call
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportFailure(_)
                | BridgeError::WebSocket(_)
                | BridgeError::ConnectionClosed
        )
    }
}

impl From<RpcError> for BridgeError {
    fn from(error: RpcError) -> Self {
        BridgeError::Remote(error)
    }
}

/// Convenience type alias for Results using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
