//! # timber-proto
//!
//! Shared types and wire protocol for the timber log pipeline.
//!
//! This crate provides the vocabulary spoken by every other timber crate:
//!
//! - [`LogEntry`] — A single log record with Kubernetes context
//! - [`Severity`] — Normalized log level (0..6)
//! - [`Query`] / [`QueryResult`] — Search parameters and paged results
//! - [`StoreStats`] — Storage statistics
//! - [`RequestEnvelope`] / [`ResponseEnvelope`] — Storage RPC framing
//!
//! ## Wire format
//!
//! The storage RPC surface mirrors the `Store` contract one-for-one:
//! Write, Query, GetById, Delete, Stats, plus a Health probe. Timestamps
//! cross the wire as signed 64-bit nanoseconds since epoch, severities as
//! 32-bit unsigned integers, and result order as an integer enum
//! (`DESC = 0`, `ASC = 1`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtoError;
pub use messages::{
    ErrorCode, HealthStatus, RequestEnvelope, ResponseEnvelope, StorageRequest, StorageResponse,
    WireEntry, WireOrder, WireQuery,
};
pub use types::{
    timestamp_from_nanos, timestamp_nanos, LogEntry, Order, Pagination, Query, QueryResult,
    Severity, StoreStats, ATTR_POD_UID,
};
