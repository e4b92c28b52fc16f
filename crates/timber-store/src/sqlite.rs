//! Embedded SQLite storage engine with FTS5 search and deduplication.
//!
//! Writes are buffered in memory and flushed in a single transaction;
//! the partial unique index on `dedup_hash` makes flushes idempotent at
//! the row level, so the batcher's at-least-once retries never produce
//! duplicate rows. The engine assumes a single writer: all SQL runs
//! under one connection mutex, while the buffer has its own lock so
//! appends never block behind an in-flight transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::Connection;
use timber_proto::{timestamp_from_nanos, timestamp_nanos, LogEntry, Query, QueryResult, Severity, StoreStats};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::hash::dedup_hash;
use crate::schema;
use crate::traits::{Store, WriteOptimizer};

/// Path value selecting an in-memory database (test harnesses).
pub const MEMORY_PATH: &str = ":memory:";

const DEFAULT_WRITE_BUFFER: usize = 1000;

/// Configuration for the SQLite store.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or [`MEMORY_PATH`] for in-memory.
    pub path: String,
    /// Number of entries to buffer before flushing.
    pub write_buffer_size: usize,
}

impl SqliteConfig {
    /// Creates a configuration for the given database path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            write_buffer_size: DEFAULT_WRITE_BUFFER,
        }
    }

    /// Creates a configuration for an in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MEMORY_PATH)
    }

    /// Sets the write buffer capacity.
    #[must_use]
    pub fn with_write_buffer(mut self, entries: usize) -> Self {
        if entries > 0 {
            self.write_buffer_size = entries;
        }
        self
    }
}

struct WriteBuffer {
    entries: Vec<LogEntry>,
    cap: usize,
}

struct Inner {
    /// Serializes all SQL. The engine assumes a single writer.
    conn: Mutex<Connection>,
    /// Pending entries not yet committed. Separate lock so appends never
    /// block behind a flush transaction.
    buffer: Mutex<WriteBuffer>,
    path: String,
    closed: AtomicBool,
}

/// Log storage backed by SQLite with an FTS5 message index.
pub struct SqliteStore {
    inner: Arc<Inner>,
}

impl SqliteStore {
    /// Opens (and migrates, if needed) the database at the configured
    /// path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(cfg: SqliteConfig) -> Result<Self> {
        let cap = if cfg.write_buffer_size > 0 {
            cfg.write_buffer_size
        } else {
            DEFAULT_WRITE_BUFFER
        };

        // Stale WAL artifacts from a crashed process can fail the open
        // with SQLITE_IOERR_SHMSIZE.
        if cfg.path != MEMORY_PATH {
            let _ = std::fs::remove_file(format!("{}-shm", cfg.path));
            let _ = std::fs::remove_file(format!("{}-wal", cfg.path));
        }

        let mut conn = if cfg.path == MEMORY_PATH {
            Connection::open_in_memory()?
        } else {
            Connection::open(&cfg.path)?
        };
        schema::initialize(&mut conn)?;

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                buffer: Mutex::new(WriteBuffer {
                    entries: Vec::with_capacity(cap),
                    cap,
                }),
                path: cfg.path,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns distinct namespace values, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the query fails.
    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.run_blocking(|inner| inner.list_distinct("namespace")).await
    }

    /// Returns distinct container values, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the query fails.
    pub async fn list_containers(&self) -> Result<Vec<String>> {
        self.run_blocking(|inner| inner.list_distinct("container")).await
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Internal(format!("storage task failed: {e}")))?
    }
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Swaps the buffer out and commits it in one transaction. On any
    /// failure the batch goes back to the head of the live buffer.
    fn flush_blocking(&self) -> Result<()> {
        self.check_open()?;

        let batch = {
            let mut buf = self.buffer.lock();
            if buf.entries.is_empty() {
                return Ok(());
            }
            let cap = buf.cap;
            std::mem::replace(&mut buf.entries, Vec::with_capacity(cap))
        };

        let mut conn = self.conn.lock();
        if let Err(e) = insert_batch(&mut conn, &batch) {
            drop(conn);
            let mut buf = self.buffer.lock();
            let mut requeued = batch;
            requeued.append(&mut buf.entries);
            buf.entries = requeued;
            return Err(e);
        }
        Ok(())
    }

    fn query_blocking(&self, q: &Query) -> Result<QueryResult> {
        let (sql, args) = build_query(q);
        let limit = q.pagination.effective_limit();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(args))?;

        let mut entries = Vec::with_capacity(limit.min(256));
        while let Some(row) = rows.next()? {
            entries.push(entry_from_row(row)?);
        }

        let mut result = QueryResult::default();
        if entries.len() > limit {
            entries.truncate(limit);
            result.has_more = true;
            // Cursor is the last returned id so the next page resumes
            // with no overlap and no gap.
            result.next_cursor = entries.last().map_or(0, |e| e.id);
        }
        result.entries = entries;
        Ok(result)
    }

    fn get_blocking(&self, id: i64) -> Result<LogEntry> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, namespace, pod, container, severity, message, attributes
             FROM logs WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => entry_from_row(row),
            None => Err(StoreError::NotFound),
        }
    }

    fn delete_blocking(&self, cutoff_nanos: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM logs WHERE timestamp < ?1", [cutoff_nanos])?;
        Ok(affected as u64)
    }

    fn stats_blocking(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();

        let total_entries: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |r| r.get(0))?;
        let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM logs",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let disk_size_bytes = if self.path == MEMORY_PATH {
            0
        } else {
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
            page_count * page_size
        };

        Ok(StoreStats {
            total_entries,
            disk_size_bytes,
            oldest: oldest.map(timestamp_from_nanos),
            newest: newest.map(timestamp_from_nanos),
        })
    }

    fn list_distinct(&self, column: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT DISTINCT {column} FROM logs ORDER BY {column}"))?;
        let values = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(values)
    }
}

/// Commits a batch in a single transaction; rows whose dedup hash
/// already exists are dropped by the partial unique index.
fn insert_batch(conn: &mut Connection, batch: &[LogEntry]) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO logs (timestamp, namespace, pod, container, severity, message, attributes, dedup_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;

        for e in batch {
            let attrs = match e.attributes.as_ref().filter(|m| !m.is_empty()) {
                Some(map) => Some(serde_json::to_string(map)?),
                None => None,
            };
            let ts = timestamp_nanos(e.timestamp);
            let hash = dedup_hash(ts, &e.namespace, &e.pod, &e.container, &e.message);
            stmt.execute(rusqlite::params![
                ts,
                e.namespace,
                e.pod,
                e.container,
                e.severity as u32,
                e.message,
                attrs,
                hash,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<LogEntry> {
    let ts: i64 = row.get(1)?;
    let severity: u32 = row.get(5)?;
    let attrs: Option<String> = row.get(7)?;

    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: timestamp_from_nanos(ts),
        namespace: row.get(2)?,
        pod: row.get(3)?,
        container: row.get(4)?,
        severity: Severity::from_u32(severity),
        message: row.get(6)?,
        attributes: attrs
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str::<HashMap<String, String>>(&s).ok()),
    })
}

/// Builds the parameterized query SQL with predicates in a fixed order
/// so identical queries produce identical SQL.
fn build_query(q: &Query) -> (String, Vec<Value>) {
    let mut sql = String::from(
        "SELECT l.id, l.timestamp, l.namespace, l.pod, l.container, l.severity, l.message, l.attributes FROM logs l",
    );
    let mut args: Vec<Value> = Vec::new();

    if q.search.is_some() {
        sql.push_str(" JOIN logs_fts f ON l.id = f.rowid");
    }

    sql.push_str(" WHERE 1=1");

    if let Some(start) = q.start {
        sql.push_str(" AND l.timestamp >= ?");
        args.push(Value::Integer(timestamp_nanos(start)));
    }
    if let Some(end) = q.end {
        sql.push_str(" AND l.timestamp < ?");
        args.push(Value::Integer(timestamp_nanos(end)));
    }

    if let Some(search) = &q.search {
        sql.push_str(" AND logs_fts MATCH ?");
        args.push(Value::Text(search.clone()));
    }

    if let Some(namespace) = &q.namespace {
        sql.push_str(" AND l.namespace = ?");
        args.push(Value::Text(namespace.clone()));
    }
    if let Some(pod) = &q.pod {
        sql.push_str(" AND l.pod = ?");
        args.push(Value::Text(pod.clone()));
    }
    if let Some(container) = &q.container {
        sql.push_str(" AND l.container = ?");
        args.push(Value::Text(container.clone()));
    }

    if q.min_severity > Severity::Unknown {
        sql.push_str(" AND l.severity >= ?");
        args.push(Value::Integer(q.min_severity as i64));
    }

    if let Some(attributes) = &q.attributes {
        // Sorted key order keeps the generated SQL deterministic.
        let mut keys: Vec<&String> = attributes.keys().collect();
        keys.sort();
        for key in keys {
            sql.push_str(" AND json_extract(l.attributes, ?) = ?");
            args.push(Value::Text(format!("$.{key}")));
            args.push(Value::Text(attributes[key].clone()));
        }
    }

    if q.pagination.after_id > 0 {
        sql.push_str(" AND l.id > ?");
        args.push(Value::Integer(q.pagination.after_id));
    }
    if q.pagination.before_id > 0 {
        sql.push_str(" AND l.id < ?");
        args.push(Value::Integer(q.pagination.before_id));
    }

    match q.pagination.order {
        timber_proto::Order::Asc => sql.push_str(" ORDER BY l.id ASC"),
        timber_proto::Order::Desc => sql.push_str(" ORDER BY l.id DESC"),
    }

    // One extra row detects has-more without a COUNT.
    sql.push_str(&format!(" LIMIT {}", q.pagination.effective_limit() + 1));

    (sql, args)
}

#[async_trait]
impl Store for SqliteStore {
    async fn write(&self, entries: Vec<LogEntry>) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        self.inner.check_open()?;

        let count = entries.len();
        let need_flush = {
            let mut buf = self.inner.buffer.lock();
            buf.entries.extend(entries);
            buf.entries.len() >= buf.cap
        };

        if need_flush {
            self.run_blocking(Inner::flush_blocking).await?;
        }
        Ok(count)
    }

    async fn query(&self, query: Query) -> Result<QueryResult> {
        self.inner.check_open()?;
        // Flush so recent writes are visible to the query.
        self.run_blocking(Inner::flush_blocking).await?;
        self.run_blocking(move |inner| inner.query_blocking(&query)).await
    }

    async fn get_by_id(&self, id: i64) -> Result<LogEntry> {
        self.inner.check_open()?;
        self.run_blocking(move |inner| inner.get_blocking(id)).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.check_open()?;
        let cutoff_nanos = timestamp_nanos(cutoff);
        self.run_blocking(move |inner| inner.delete_blocking(cutoff_nanos)).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.check_open()?;
        self.run_blocking(Inner::stats_blocking).await
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Best-effort flush of whatever is still buffered.
        let batch = {
            let mut buf = self.inner.buffer.lock();
            std::mem::take(&mut buf.entries)
        };
        if !batch.is_empty() {
            let inner = Arc::clone(&self.inner);
            let flushed = tokio::task::spawn_blocking(move || {
                let mut conn = inner.conn.lock();
                insert_batch(&mut conn, &batch)
            })
            .await;
            if let Ok(Err(e)) = flushed {
                debug!(error = %e, "final flush on close failed");
            }
        }
        Ok(())
    }

    fn write_optimizer(&self) -> Option<&dyn WriteOptimizer> {
        Some(self)
    }
}

#[async_trait]
impl WriteOptimizer for SqliteStore {
    async fn flush(&self) -> Result<()> {
        self.run_blocking(Inner::flush_blocking).await
    }

    fn set_write_buffer(&self, entries: usize) {
        if entries > 0 {
            self.inner.buffer.lock().cap = entries;
        }
    }
}
