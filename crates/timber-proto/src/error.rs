//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An unknown order discriminant was received.
    #[error("unknown order value: {0}")]
    UnknownOrder(u8),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
