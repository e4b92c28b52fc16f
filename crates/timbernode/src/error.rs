//! Error types for the collector.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while collecting logs.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Misconfiguration detected at startup. Aborts startup.
    #[error("config: {field}: {message}")]
    Config {
        /// The offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Kubernetes API failure.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Store(#[from] timber_store::StoreError),

    /// The log stream returned EOF while the container is still running:
    /// a connection drop, not a termination.
    #[error("stream closed unexpectedly, container still running")]
    StreamClosedUnexpectedly,

    /// No line arrived within the idle window; the stream reconnects.
    #[error("stream idle timeout after {0:?}")]
    IdleTimeout(Duration),

    /// Reading a log line failed.
    #[error("read log stream: {0}")]
    Read(String),

    /// The shared output channel is gone; the pipeline is shutting down.
    #[error("output channel closed")]
    OutputClosed,

    /// Pod discovery failed.
    #[error("discovery: {0}")]
    Discovery(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl CollectorError {
    /// Returns true if a stream that failed with this error should
    /// reconnect with backoff.
    ///
    /// Cancellation and pipeline shutdown are terminal; everything else
    /// is assumed to be a transient Kubernetes or connection fault.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::OutputClosed | Self::Config { .. }
        )
    }
}

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, CollectorError>;
