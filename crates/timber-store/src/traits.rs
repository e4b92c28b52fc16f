//! Traits for log storage backends.
//!
//! [`Store`] abstracts over where entries land (the embedded SQLite
//! engine or the remote storage service) so the collector pipeline is
//! oblivious to the difference. [`WriteOptimizer`] is an optional
//! capability probed at runtime where a store may or may not buffer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use timber_proto::{LogEntry, Query, QueryResult, StoreStats};

use crate::error::Result;

/// Abstract async interface over log storage backends.
///
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a batch of log entries.
    ///
    /// Returns the number of entries accepted. Entries whose
    /// deduplication tuple already exists are silently dropped at the
    /// row level.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be durably accepted.
    async fn write(&self, entries: Vec<LogEntry>) -> Result<usize>;

    /// Searches for log entries matching the given criteria.
    ///
    /// # Errors
    ///
    /// Returns an error if the query could not be executed.
    async fn query(&self, query: Query) -> Result<QueryResult>;

    /// Retrieves a single entry by its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) if
    /// the entry does not exist.
    async fn get_by_id(&self, id: i64) -> Result<LogEntry>;

    /// Removes entries older than the given timestamp.
    ///
    /// Returns the number of entries deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion failed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Returns storage statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if statistics could not be gathered.
    async fn stats(&self) -> Result<StoreStats>;

    /// Releases resources. Subsequent operations fail with
    /// [`StoreError::Closed`](crate::StoreError::Closed).
    ///
    /// # Errors
    ///
    /// Returns an error if outstanding state could not be released.
    async fn close(&self) -> Result<()>;

    /// Probes for the optional write-optimizer capability.
    ///
    /// Returns `None` for stores that do not buffer writes.
    fn write_optimizer(&self) -> Option<&dyn WriteOptimizer> {
        None
    }
}

/// Optional capability for write-heavy workloads.
#[async_trait]
pub trait WriteOptimizer: Send + Sync {
    /// Forces any buffered writes to persistent storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush failed; the unflushed batch stays
    /// queued for a later attempt.
    async fn flush(&self) -> Result<()>;

    /// Configures the write buffer size. Non-positive values are ignored.
    fn set_write_buffer(&self, entries: usize);
}

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn Store>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use parking_lot::Mutex;
    use timber_proto::Severity;

    /// Minimal in-memory store exercising the trait surface.
    struct MockStore {
        entries: Mutex<Vec<LogEntry>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                entries: Mutex::new(Vec::new()),
                closed: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Store for MockStore {
        async fn write(&self, entries: Vec<LogEntry>) -> Result<usize> {
            if self.closed.load(std::sync::atomic::Ordering::Acquire) {
                return Err(StoreError::Closed);
            }
            let n = entries.len();
            let mut guard = self.entries.lock();
            for mut e in entries {
                e.id = guard.len() as i64 + 1;
                guard.push(e);
            }
            Ok(n)
        }

        async fn query(&self, query: Query) -> Result<QueryResult> {
            let entries = self
                .entries
                .lock()
                .iter()
                .filter(|e| e.severity >= query.min_severity)
                .cloned()
                .collect();
            Ok(QueryResult {
                entries,
                has_more: false,
                next_cursor: 0,
            })
        }

        async fn get_by_id(&self, id: i64) -> Result<LogEntry> {
            self.entries
                .lock()
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or(StoreError::NotFound)
        }

        async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            let mut guard = self.entries.lock();
            let before = guard.len();
            guard.retain(|e| e.timestamp >= cutoff);
            Ok((before - guard.len()) as u64)
        }

        async fn stats(&self) -> Result<StoreStats> {
            Ok(StoreStats {
                total_entries: self.entries.lock().len() as i64,
                ..Default::default()
            })
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, std::sync::atomic::Ordering::Release);
            Ok(())
        }
    }

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            id: 0,
            timestamp: Utc::now(),
            namespace: "default".into(),
            pod: "p".into(),
            container: "c".into(),
            severity: Severity::Info,
            message: message.into(),
            attributes: None,
        }
    }

    #[tokio::test]
    async fn store_is_object_safe() {
        let store: SharedStore = Arc::new(MockStore::new());
        let n = store.write(vec![entry("a"), entry("b")]).await.expect("write");
        assert_eq!(n, 2);

        let result = store.query(Query::new()).await.expect("query");
        assert_eq!(result.entries.len(), 2);

        let got = store.get_by_id(1).await.expect("get");
        assert_eq!(got.message, "a");
    }

    #[tokio::test]
    async fn missing_id_is_not_found() {
        let store = MockStore::new();
        let err = store.get_by_id(99).await.expect_err("absent");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn closed_store_rejects_writes() {
        let store = MockStore::new();
        store.close().await.expect("close");
        let err = store.write(vec![entry("x")]).await.expect_err("closed");
        assert!(matches!(err, StoreError::Closed));
    }

    #[test]
    fn default_write_optimizer_is_absent() {
        let store = MockStore::new();
        assert!(store.write_optimizer().is_none());
    }
}
