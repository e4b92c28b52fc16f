//! Error types for the storage service.

use thiserror::Error;

/// Errors that can occur in the storage service.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listen address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The configured listen address.
        addr: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A WebSocket protocol error occurred.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Message encoding or decoding failed.
    #[error("protocol error: {0}")]
    Proto(#[from] timber_proto::ProtoError),

    /// The peer did not acknowledge a keepalive ping in time.
    #[error("keepalive ack timeout")]
    KeepaliveTimeout,

    /// The peer pinged more often than the policy allows.
    #[error("client ping interval below minimum")]
    PingPolicyViolation,
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
