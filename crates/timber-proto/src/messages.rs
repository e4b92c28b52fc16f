//! Storage RPC message definitions.
//!
//! Requests and responses are JSON-encoded, internally tagged enums
//! wrapped in an envelope carrying a `u64` correlation id. The wire field
//! types are fixed: timestamps are signed 64-bit nanoseconds since epoch
//! (zero means unset), severities are `u32`, and [`WireOrder`] is an
//! integer enum with `DESC = 0`, `ASC = 1`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::types::{
    timestamp_from_nanos, timestamp_nanos, LogEntry, Order, Pagination, Query, Severity,
    StoreStats,
};

/// A log entry as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    /// Storage-assigned id, zero if unpersisted.
    #[serde(default)]
    pub id: i64,
    /// Nanoseconds since epoch.
    pub timestamp_nanos: i64,
    /// Kubernetes namespace.
    pub namespace: String,
    /// Pod name.
    pub pod: String,
    /// Container name.
    pub container: String,
    /// Severity discriminant (0..6).
    pub severity: u32,
    /// Log body.
    pub message: String,
    /// Structured attributes, absent when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
}

impl From<LogEntry> for WireEntry {
    fn from(e: LogEntry) -> Self {
        Self {
            id: e.id,
            timestamp_nanos: timestamp_nanos(e.timestamp),
            namespace: e.namespace,
            pod: e.pod,
            container: e.container,
            severity: e.severity as u32,
            message: e.message,
            attributes: e.attributes,
        }
    }
}

impl From<WireEntry> for LogEntry {
    fn from(e: WireEntry) -> Self {
        Self {
            id: e.id,
            timestamp: timestamp_from_nanos(e.timestamp_nanos),
            namespace: e.namespace,
            pod: e.pod,
            container: e.container,
            severity: Severity::from_u32(e.severity),
            message: e.message,
            attributes: e.attributes,
        }
    }
}

/// Result ordering on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum WireOrder {
    /// Newest first.
    #[default]
    Desc = 0,
    /// Oldest first.
    Asc = 1,
}

impl From<WireOrder> for u8 {
    fn from(o: WireOrder) -> Self {
        o as u8
    }
}

impl TryFrom<u8> for WireOrder {
    type Error = ProtoError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Desc),
            1 => Ok(Self::Asc),
            other => Err(ProtoError::UnknownOrder(other)),
        }
    }
}

impl From<Order> for WireOrder {
    fn from(o: Order) -> Self {
        match o {
            Order::Desc => Self::Desc,
            Order::Asc => Self::Asc,
        }
    }
}

impl From<WireOrder> for Order {
    fn from(o: WireOrder) -> Self {
        match o {
            WireOrder::Desc => Self::Desc,
            WireOrder::Asc => Self::Asc,
        }
    }
}

/// Query parameters on the wire. Zero values and empty strings mean
/// "no filter", matching the domain [`Query`] semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireQuery {
    /// Inclusive range start in nanoseconds, zero if unset.
    #[serde(default)]
    pub start_nanos: i64,
    /// Exclusive range end in nanoseconds, zero if unset.
    #[serde(default)]
    pub end_nanos: i64,
    /// Full-text search expression, empty if unset.
    #[serde(default)]
    pub search: String,
    /// Exact namespace filter, empty if unset.
    #[serde(default)]
    pub namespace: String,
    /// Exact pod filter, empty if unset.
    #[serde(default)]
    pub pod: String,
    /// Exact container filter, empty if unset.
    #[serde(default)]
    pub container: String,
    /// Minimum severity discriminant, zero disables the filter.
    #[serde(default)]
    pub min_severity: u32,
    /// Conjunctive attribute equality predicates.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Page size, zero means the server default.
    #[serde(default)]
    pub limit: u32,
    /// Forward pagination cursor, zero if unset.
    #[serde(default)]
    pub after_id: i64,
    /// Backward pagination cursor, zero if unset.
    #[serde(default)]
    pub before_id: i64,
    /// Result ordering.
    #[serde(default)]
    pub order: WireOrder,
}

impl From<Query> for WireQuery {
    fn from(q: Query) -> Self {
        Self {
            start_nanos: q.start.map(timestamp_nanos).unwrap_or_default(),
            end_nanos: q.end.map(timestamp_nanos).unwrap_or_default(),
            search: q.search.unwrap_or_default(),
            namespace: q.namespace.unwrap_or_default(),
            pod: q.pod.unwrap_or_default(),
            container: q.container.unwrap_or_default(),
            min_severity: q.min_severity as u32,
            attributes: q.attributes.unwrap_or_default(),
            limit: q.pagination.limit as u32,
            after_id: q.pagination.after_id,
            before_id: q.pagination.before_id,
            order: q.pagination.order.into(),
        }
    }
}

impl From<WireQuery> for Query {
    fn from(w: WireQuery) -> Self {
        Self {
            start: (w.start_nanos != 0).then(|| timestamp_from_nanos(w.start_nanos)),
            end: (w.end_nanos != 0).then(|| timestamp_from_nanos(w.end_nanos)),
            search: (!w.search.is_empty()).then_some(w.search),
            namespace: (!w.namespace.is_empty()).then_some(w.namespace),
            pod: (!w.pod.is_empty()).then_some(w.pod),
            container: (!w.container.is_empty()).then_some(w.container),
            min_severity: Severity::from_u32(w.min_severity),
            attributes: (!w.attributes.is_empty()).then_some(w.attributes),
            pagination: Pagination {
                limit: w.limit as usize,
                after_id: w.after_id,
                before_id: w.before_id,
                order: w.order.into(),
            },
        }
    }
}

/// Error codes returned by the storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The requested entry does not exist.
    NotFound,
    /// The storage engine failed.
    Internal,
    /// The request could not be delivered.
    Unavailable,
}

/// Health states reported by the storage service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The service is accepting requests.
    Serving,
    /// The service is shutting down or unavailable.
    NotServing,
}

/// Requests from the storage client to the storage service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageRequest {
    /// Persist a batch of log entries.
    Write {
        /// Entries to persist.
        entries: Vec<WireEntry>,
    },
    /// Search for log entries.
    Query(WireQuery),
    /// Fetch a single entry.
    ///
    /// The field is named `entry_id` so it cannot collide with the
    /// envelope's correlation id once flattened.
    GetById {
        /// Entry id.
        entry_id: i64,
    },
    /// Delete entries older than a cutoff.
    Delete {
        /// Cutoff in nanoseconds since epoch.
        older_than_nanos: i64,
    },
    /// Fetch storage statistics.
    Stats,
    /// Probe service health.
    Health,
}

/// Responses from the storage service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageResponse {
    /// Result of a write.
    Write {
        /// Number of entries accepted.
        count: u32,
    },
    /// A page of query results.
    Query {
        /// Matching entries.
        entries: Vec<WireEntry>,
        /// Whether more results exist.
        has_more: bool,
        /// Cursor for the next page.
        next_cursor: i64,
    },
    /// A single entry.
    Entry {
        /// The entry.
        entry: WireEntry,
    },
    /// Result of a delete.
    Delete {
        /// Number of entries removed.
        deleted: u64,
    },
    /// Storage statistics.
    Stats {
        /// Total persisted rows.
        total_entries: i64,
        /// On-disk size in bytes.
        disk_size_bytes: i64,
        /// Oldest entry timestamp in nanoseconds, zero if empty.
        oldest_nanos: i64,
        /// Newest entry timestamp in nanoseconds, zero if empty.
        newest_nanos: i64,
    },
    /// Health probe result.
    Health {
        /// Current status.
        status: HealthStatus,
    },
    /// The request failed.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
    },
}

impl StorageResponse {
    /// Builds a stats response from domain statistics.
    #[must_use]
    pub fn from_stats(stats: &StoreStats) -> Self {
        Self::Stats {
            total_entries: stats.total_entries,
            disk_size_bytes: stats.disk_size_bytes,
            oldest_nanos: stats.oldest.map(timestamp_nanos).unwrap_or_default(),
            newest_nanos: stats.newest.map(timestamp_nanos).unwrap_or_default(),
        }
    }

    /// Converts a stats response back into domain statistics.
    ///
    /// Returns `None` for non-stats responses.
    #[must_use]
    pub fn into_stats(self) -> Option<StoreStats> {
        match self {
            Self::Stats {
                total_entries,
                disk_size_bytes,
                oldest_nanos,
                newest_nanos,
            } => Some(StoreStats {
                total_entries,
                disk_size_bytes,
                oldest: (oldest_nanos != 0).then(|| timestamp_from_nanos(oldest_nanos)),
                newest: (newest_nanos != 0).then(|| timestamp_from_nanos(newest_nanos)),
            }),
            _ => None,
        }
    }
}

/// A request with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id echoed back in the matching response.
    pub id: u64,
    /// The request payload.
    #[serde(flatten)]
    pub request: StorageRequest,
}

/// A response with the correlation id of the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation id copied from the request.
    pub id: u64,
    /// The response payload.
    #[serde(flatten)]
    pub response: StorageResponse,
}

impl RequestEnvelope {
    /// Serializes to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid request envelope.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl ResponseEnvelope {
    /// Serializes to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid response envelope.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
