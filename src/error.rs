//! Error types for nodelink.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::RpcError;

/// Main error type for all nodelink operations.
#[derive(Debug, Error)]
pub enum NodelinkError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport has no usable endpoint (e.g. `accept` before `listen`).
    #[error("Transport not connected")]
    NotConnected,

    /// `listen`, `connect` or `attach` was called on a transport that already has an endpoint.
    #[error("Transport already attached")]
    AlreadyAttached,

    /// A send was attempted with no peer attached.
    #[error("No connected client")]
    ClientNotConnected,

    /// A send was attempted with an empty payload.
    #[error("No data to send")]
    NoData,

    /// The underlying write reported an error.
    #[error("Send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The communicator was terminated.
    #[error("Communicator terminated")]
    Terminated,

    /// No response arrived before the request deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Call parameters do not serialize to a JSON object.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Protocol error (undecodable payload, bad id, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an RPC error.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Result type alias using NodelinkError.
pub type Result<T> = std::result::Result<T, NodelinkError>;
