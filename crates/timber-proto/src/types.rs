//! Core types for the log pipeline.
//!
//! This module provides:
//! - [`Severity`] — Normalized log levels for entries
//! - [`LogEntry`] — A single log record with Kubernetes context
//! - [`Query`] — Search parameters for the storage engine
//! - [`Pagination`] / [`Order`] — Cursor-based paging controls
//! - [`QueryResult`] — A page of matching entries
//! - [`StoreStats`] — Storage statistics

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log severity levels, ordered from least to most severe.
///
/// `Unknown` sorts below everything so a minimum-severity filter of
/// `Unknown` matches all entries.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Severity could not be determined.
    #[default]
    Unknown = 0,
    /// Most verbose, fine-grained tracing.
    Trace = 1,
    /// Debugging information.
    Debug = 2,
    /// General information.
    Info = 3,
    /// Warning conditions.
    Warn = 4,
    /// Error conditions.
    Error = 5,
    /// Unrecoverable failures.
    Fatal = 6,
}

impl Severity {
    /// Returns the canonical uppercase name of this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parses a severity name, case-insensitively.
    ///
    /// `WARNING` normalizes to `Warn` and `PANIC` to `Fatal`. Anything
    /// unrecognized maps to `Unknown`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Self::Trace,
            "DEBUG" => Self::Debug,
            "INFO" => Self::Info,
            "WARN" | "WARNING" => Self::Warn,
            "ERROR" => Self::Error,
            "FATAL" | "PANIC" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Converts a storage/wire discriminant back to a severity.
    ///
    /// Out-of-range values map to `Unknown`.
    #[must_use]
    pub const fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Trace,
            2 => Self::Debug,
            3 => Self::Info,
            4 => Self::Warn,
            5 => Self::Error,
            6 => Self::Fatal,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log record from a Kubernetes container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique identifier assigned at persistence. Zero means the entry
    /// has not been persisted yet.
    pub id: i64,
    /// When the log line was produced.
    pub timestamp: DateTime<Utc>,
    /// Kubernetes namespace. Non-empty at insert.
    pub namespace: String,
    /// Pod name. Non-empty at insert.
    pub pod: String,
    /// Container name. Non-empty at insert.
    pub container: String,
    /// Severity level.
    pub severity: Severity,
    /// The log body after structured extraction.
    pub message: String,
    /// Structured attributes. `None` means no attributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
}

/// Reserved attribute key carrying the pod UID, always added by the
/// collector so a recreated pod with the same name is distinguishable.
pub const ATTR_POD_UID: &str = "pod_uid";

/// Sort order for query results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Newest entries first (default for log viewing).
    #[default]
    Desc,
    /// Oldest entries first.
    Asc,
}

/// Cursor-based pagination controls.
///
/// `after_id` resumes forward, `before_id` backward; both are exclusive
/// bounds on the entry id. Zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of entries to return. Zero means the default.
    #[serde(default)]
    pub limit: usize,
    /// Return entries with id greater than this value.
    #[serde(default)]
    pub after_id: i64,
    /// Return entries with id less than this value.
    #[serde(default)]
    pub before_id: i64,
    /// Result ordering.
    #[serde(default)]
    pub order: Order,
}

impl Pagination {
    /// Default page size when `limit` is zero.
    pub const DEFAULT_LIMIT: usize = 100;
    /// Hard ceiling on the page size.
    pub const MAX_LIMIT: usize = 1000;

    /// Returns the limit clamped to `[1, MAX_LIMIT]`, substituting the
    /// default for zero.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            Self::DEFAULT_LIMIT
        } else {
            self.limit.min(Self::MAX_LIMIT)
        }
    }
}

/// Parameters for searching logs. Unset fields mean "no filter".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Start of the time range, inclusive.
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// End of the time range, exclusive.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Full-text search expression on the message body.
    #[serde(default)]
    pub search: Option<String>,
    /// Exact namespace filter.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Exact pod filter.
    #[serde(default)]
    pub pod: Option<String>,
    /// Exact container filter.
    #[serde(default)]
    pub container: Option<String>,
    /// Entries with severity below this are excluded. `Unknown` disables
    /// the filter.
    #[serde(default)]
    pub min_severity: Severity,
    /// Attribute equality predicates, conjunctive.
    #[serde(default)]
    pub attributes: Option<HashMap<String, String>>,
    /// Paging controls.
    #[serde(default)]
    pub pagination: Pagination,
}

impl Query {
    /// Creates an empty query matching everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the half-open time range `[start, end)`.
    #[must_use]
    pub fn with_time_range(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Sets the full-text search expression.
    #[must_use]
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Sets the exact namespace filter.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the exact pod filter.
    #[must_use]
    pub fn with_pod(mut self, pod: impl Into<String>) -> Self {
        self.pod = Some(pod.into());
        self
    }

    /// Sets the exact container filter.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Sets the minimum severity.
    #[must_use]
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    /// Adds an attribute equality predicate.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Sets the page size.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.pagination.limit = limit;
        self
    }

    /// Resumes forward pagination after the given id.
    #[must_use]
    pub fn after(mut self, id: i64) -> Self {
        self.pagination.after_id = id;
        self
    }

    /// Resumes backward pagination before the given id.
    #[must_use]
    pub fn before(mut self, id: i64) -> Self {
        self.pagination.before_id = id;
        self
    }

    /// Sets the result ordering.
    #[must_use]
    pub fn with_order(mut self, order: Order) -> Self {
        self.pagination.order = order;
        self
    }
}

/// A page of query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching entries, in the requested order.
    pub entries: Vec<LogEntry>,
    /// Whether more results exist beyond this page.
    pub has_more: bool,
    /// The id to use as a cursor for the next page. Zero when `has_more`
    /// is false.
    pub next_cursor: i64,
}

/// Storage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total number of persisted rows.
    pub total_entries: i64,
    /// On-disk size in bytes. Zero for in-memory stores.
    pub disk_size_bytes: i64,
    /// Timestamp of the oldest entry, if any.
    pub oldest: Option<DateTime<Utc>>,
    /// Timestamp of the newest entry, if any.
    pub newest: Option<DateTime<Utc>>,
}

/// Converts a timestamp to nanoseconds since the Unix epoch.
///
/// Saturates for instants outside the representable range (year ~2262).
#[must_use]
pub fn timestamp_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Converts nanoseconds since the Unix epoch back to a timestamp.
#[must_use]
pub fn timestamp_from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}
