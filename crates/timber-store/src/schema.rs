//! SQLite schema, pragmas, and migrations for the log store.
//!
//! Opening a database runs four steps in order: pragmas, base schema,
//! migrations for pre-dedup databases, then the FTS index and its
//! triggers. All steps are idempotent so re-opening an up-to-date
//! database is a no-op.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::Result;
use crate::hash::dedup_hash;

/// Performance and durability settings applied before any schema work.
pub const PRAGMA_SQL: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;
";

/// Base tables and indexes that do not depend on migrated columns.
const BASE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id          INTEGER PRIMARY KEY,
    timestamp   INTEGER NOT NULL,
    namespace   TEXT NOT NULL,
    pod         TEXT NOT NULL,
    container   TEXT NOT NULL,
    severity    INTEGER NOT NULL,
    message     TEXT NOT NULL,
    attributes  TEXT
);

CREATE INDEX IF NOT EXISTS idx_logs_k8s
    ON logs(namespace, pod, container);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp
    ON logs(timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_logs_severity
    ON logs(severity);
";

/// Full-text index and the triggers that keep it in lock-step with the
/// primary table. Created after migrations so the rowids are stable.
const FTS_SCHEMA_SQL: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS logs_fts USING fts5(
    message,
    content='logs',
    content_rowid='id',
    tokenize='porter unicode61 remove_diacritics 1'
);

CREATE TRIGGER IF NOT EXISTS logs_ai AFTER INSERT ON logs BEGIN
    INSERT INTO logs_fts(rowid, message) VALUES (new.id, new.message);
END;

CREATE TRIGGER IF NOT EXISTS logs_ad AFTER DELETE ON logs BEGIN
    INSERT INTO logs_fts(logs_fts, rowid, message)
        VALUES('delete', old.id, old.message);
END;

CREATE TRIGGER IF NOT EXISTS logs_au AFTER UPDATE ON logs BEGIN
    INSERT INTO logs_fts(logs_fts, rowid, message)
        VALUES('delete', old.id, old.message);
    INSERT INTO logs_fts(rowid, message) VALUES (new.id, new.message);
END;
";

/// Partial unique index enforcing row-level deduplication.
const DEDUP_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_logs_dedup ON logs(dedup_hash) WHERE dedup_hash IS NOT NULL";

/// Rows processed per migration transaction.
const MIGRATION_BATCH_SIZE: usize = 10_000;

/// Applies pragmas, creates the schema, and migrates pre-dedup databases.
///
/// # Errors
///
/// Returns an error if any DDL or migration statement fails.
pub fn initialize(conn: &mut Connection) -> Result<()> {
    // PRAGMA journal_mode returns a row; execute_batch swallows it.
    conn.execute_batch(PRAGMA_SQL)?;
    conn.execute_batch(BASE_SCHEMA_SQL)?;
    run_migrations(conn)?;
    conn.execute_batch(FTS_SCHEMA_SQL)?;
    Ok(())
}

/// Handles schema updates for databases created before deduplication.
fn run_migrations(conn: &mut Connection) -> Result<()> {
    if !column_exists(conn, "logs", "dedup_hash")? {
        // Fresh migration: add the column, backfill, install the index.
        info!("migrating logs table: adding dedup_hash column");
        conn.execute("ALTER TABLE logs ADD COLUMN dedup_hash INTEGER", [])?;
        backfill_dedup_hashes(conn)?;
        conn.execute(DEDUP_INDEX_SQL, [])?;
        return Ok(());
    }

    if !index_exists(conn, "logs", "idx_logs_dedup")? {
        // Column exists but the index does not: a previous migration
        // partially completed, or duplicates landed before the unique
        // index existed. Backfill NULL hashes, remove duplicates keeping
        // the smallest id per hash, then install the index.
        info!("migrating logs table: rebuilding dedup index");
        backfill_dedup_hashes(conn)?;
        deduplicate_hashes(conn)?;
        conn.execute(DEDUP_INDEX_SQL, [])?;
    }

    Ok(())
}

/// Checks whether a column exists on the given table.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Checks whether an index exists on the given table.
fn index_exists(conn: &Connection, table: &str, index: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == index {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Computes and stores `dedup_hash` for rows that lack one, in batches.
fn backfill_dedup_hashes(conn: &mut Connection) -> Result<()> {
    struct PendingRow {
        id: i64,
        timestamp: i64,
        namespace: String,
        pod: String,
        container: String,
        message: String,
    }

    let mut total = 0usize;
    loop {
        let batch: Vec<PendingRow> = {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, namespace, pod, container, message
                 FROM logs
                 WHERE dedup_hash IS NULL
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([MIGRATION_BATCH_SIZE], |row| {
                Ok(PendingRow {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    namespace: row.get(2)?,
                    pod: row.get(3)?,
                    container: row.get(4)?,
                    message: row.get(5)?,
                })
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        if batch.is_empty() {
            break;
        }

        let tx = conn.transaction()?;
        {
            let mut update = tx.prepare("UPDATE logs SET dedup_hash = ?1 WHERE id = ?2")?;
            for row in &batch {
                let hash = dedup_hash(
                    row.timestamp,
                    &row.namespace,
                    &row.pod,
                    &row.container,
                    &row.message,
                );
                update.execute(rusqlite::params![hash, row.id])?;
            }
        }
        tx.commit()?;
        total += batch.len();
    }

    if total > 0 {
        info!(rows = total, "backfilled dedup hashes");
    }
    Ok(())
}

/// Removes rows whose hash collides with a smaller-id row, in batches,
/// until no rows are removed.
fn deduplicate_hashes(conn: &Connection) -> Result<()> {
    let mut total = 0usize;
    loop {
        let affected = conn.execute(
            "DELETE FROM logs WHERE id IN (
                SELECT l.id FROM logs l
                WHERE l.dedup_hash IS NOT NULL
                AND EXISTS (
                    SELECT 1 FROM logs l2
                    WHERE l2.dedup_hash = l.dedup_hash
                    AND l2.id < l.id
                )
                LIMIT ?1
            )",
            [MIGRATION_BATCH_SIZE],
        )?;
        if affected == 0 {
            break;
        }
        total += affected;
    }

    if total > 0 {
        debug!(rows = total, "removed duplicate rows during migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The pre-dedup schema as it shipped before the dedup column existed.
    const LEGACY_SCHEMA_SQL: &str = "
    CREATE TABLE logs (
        id          INTEGER PRIMARY KEY,
        timestamp   INTEGER NOT NULL,
        namespace   TEXT NOT NULL,
        pod         TEXT NOT NULL,
        container   TEXT NOT NULL,
        severity    INTEGER NOT NULL,
        message     TEXT NOT NULL,
        attributes  TEXT
    );
    ";

    fn legacy_db_with_rows(rows: &[(i64, &str, &str, &str, &str)]) -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(LEGACY_SCHEMA_SQL).expect("legacy schema");
        for (ts, ns, pod, container, msg) in rows {
            conn.execute(
                "INSERT INTO logs (timestamp, namespace, pod, container, severity, message)
                 VALUES (?1, ?2, ?3, ?4, 3, ?5)",
                rusqlite::params![ts, ns, pod, container, msg],
            )
            .expect("insert");
        }
        conn
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut conn = Connection::open_in_memory().expect("open");
        initialize(&mut conn).expect("first init");
        initialize(&mut conn).expect("second init");
        assert!(index_exists(&conn, "logs", "idx_logs_dedup").expect("probe"));
    }

    #[test]
    fn migration_adds_column_and_index() {
        let mut conn = legacy_db_with_rows(&[(1000, "ns", "pod", "c", "hello")]);
        assert!(!column_exists(&conn, "logs", "dedup_hash").expect("probe"));

        initialize(&mut conn).expect("init");

        assert!(column_exists(&conn, "logs", "dedup_hash").expect("probe"));
        assert!(index_exists(&conn, "logs", "idx_logs_dedup").expect("probe"));

        let nulls: i64 = conn
            .query_row("SELECT COUNT(*) FROM logs WHERE dedup_hash IS NULL", [], |r| r.get(0))
            .expect("count");
        assert_eq!(nulls, 0);

        let hash: i64 = conn
            .query_row("SELECT dedup_hash FROM logs LIMIT 1", [], |r| r.get(0))
            .expect("hash");
        assert_eq!(hash, dedup_hash(1000, "ns", "pod", "c", "hello"));
    }

    #[test]
    fn migration_keeps_smallest_id_per_hash() {
        // Three identical tuples plus one distinct row; the legacy schema
        // happily stored the duplicates.
        let mut conn = legacy_db_with_rows(&[
            (1000, "ns", "pod", "c", "dup"),
            (1000, "ns", "pod", "c", "dup"),
            (1000, "ns", "pod", "c", "dup"),
            (2000, "ns", "pod", "c", "unique"),
        ]);

        initialize(&mut conn).expect("init");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM logs", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 2);

        let survivor: i64 = conn
            .query_row("SELECT id FROM logs WHERE message = 'dup'", [], |r| r.get(0))
            .expect("survivor");
        assert_eq!(survivor, 1, "smallest id wins");
    }

    #[test]
    fn migration_backfills_partial_state() {
        // Column present, index missing, some hashes NULL: the shape left
        // by an interrupted earlier migration.
        let mut conn = legacy_db_with_rows(&[
            (1000, "ns", "pod", "c", "a"),
            (1000, "ns", "pod", "c", "a"),
            (3000, "ns", "pod", "c", "b"),
        ]);
        conn.execute("ALTER TABLE logs ADD COLUMN dedup_hash INTEGER", [])
            .expect("add column");
        conn.execute(
            "UPDATE logs SET dedup_hash = ?1 WHERE id = 3",
            [dedup_hash(3000, "ns", "pod", "c", "b")],
        )
        .expect("partial backfill");

        initialize(&mut conn).expect("init");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM logs", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 2);
        assert!(index_exists(&conn, "logs", "idx_logs_dedup").expect("probe"));
    }

    #[test]
    fn unique_index_rejects_duplicate_hash() {
        let mut conn = Connection::open_in_memory().expect("open");
        initialize(&mut conn).expect("init");

        let hash = dedup_hash(1, "ns", "pod", "c", "m");
        conn.execute(
            "INSERT INTO logs (timestamp, namespace, pod, container, severity, message, dedup_hash)
             VALUES (1, 'ns', 'pod', 'c', 3, 'm', ?1)",
            [hash],
        )
        .expect("first insert");

        let dup = conn.execute(
            "INSERT INTO logs (timestamp, namespace, pod, container, severity, message, dedup_hash)
             VALUES (1, 'ns', 'pod', 'c', 3, 'm', ?1)",
            [hash],
        );
        assert!(dup.is_err(), "duplicate hash must be rejected");
    }
}
