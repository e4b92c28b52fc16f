//! Error types for storage backends.

use thiserror::Error;
use timber_proto::ErrorCode;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup of an id that is not present.
    #[error("entry not found")]
    NotFound,

    /// Operation attempted after the store was closed.
    #[error("storage is closed")]
    Closed,

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Attribute serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protocol encoding or decoding failed.
    #[error("protocol error: {0}")]
    Proto(#[from] timber_proto::ProtoError),

    /// The remote storage service could not be reached or the
    /// connection dropped mid-request.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote storage service rejected the request.
    #[error("remote error ({code:?}): {message}")]
    Remote {
        /// Wire error code.
        code: ErrorCode,
        /// Server-provided description.
        message: String,
    },

    /// An internal invariant failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns true if this error means the entry does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Returns true if a write that failed with this error is worth
    /// retrying later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Transport(_) | Self::Io(_) | Self::Cancelled
        )
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
