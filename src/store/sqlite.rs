// Copyright (c) 2025 - Cowboy AI, Inc.
//! SQLite Store Adapter
//!
//! Implements the [`Store`] seam over an embedded SQLite database.
//! Writes arrive only from the materializer, so a single connection
//! behind a mutex serializes them; live-query consumers get committed
//! snapshots pushed through their ports whenever the outermost
//! savepoint releases.
//!
//! Schema migration is a version-tagged full reset: when the on-disk
//! `user_version` pragma does not match [`SCHEMA_VERSION`], every core
//! table is dropped and recreated, and streams re-backfill from their
//! cursors (which are also reset).

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{LiveQueryHandle, Mutation, QueryRows, SqlValue, Store, StoreError, StoreResult};
use async_trait::async_trait;

/// Bump on any incompatible schema change; mismatch triggers a full
/// reset on open.
pub const SCHEMA_VERSION: i64 = 1;

const CORE_TABLES: &[&str] = &[
    "event_log",
    "stream_cursor",
    "spaces",
    "rooms",
    "messages",
    "reactions",
    "joined_spaces",
    "profiles",
    "read_markers",
    "session",
];

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_log (
    stream_id    TEXT NOT NULL,
    event_id     TEXT NOT NULL,
    stream_index INTEGER NOT NULL,
    PRIMARY KEY (stream_id, event_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_event_log_position
    ON event_log(stream_id, stream_index);

CREATE TABLE IF NOT EXISTS stream_cursor (
    stream_id    TEXT PRIMARY KEY,
    stream_index INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS spaces (
    stream_id  TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    avatar     TEXT,
    admin_user TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rooms (
    stream_id        TEXT NOT NULL,
    room_id          TEXT NOT NULL,
    name             TEXT NOT NULL,
    topic            TEXT,
    archived         INTEGER NOT NULL DEFAULT 0,
    last_activity_at TEXT,
    PRIMARY KEY (stream_id, room_id)
);

CREATE TABLE IF NOT EXISTS messages (
    stream_id  TEXT NOT NULL,
    message_id TEXT NOT NULL,
    room_id    TEXT NOT NULL,
    author     TEXT NOT NULL,
    content    TEXT NOT NULL CHECK (length(content) <= 65536),
    reply_to   TEXT,
    created_at TEXT NOT NULL,
    edited_at  TEXT,
    deleted    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (stream_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_room
    ON messages(stream_id, room_id, created_at);

CREATE TABLE IF NOT EXISTS reactions (
    stream_id  TEXT NOT NULL,
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    key        TEXT NOT NULL,
    PRIMARY KEY (stream_id, message_id, user_id, key)
);

CREATE TABLE IF NOT EXISTS joined_spaces (
    user_id   TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (user_id, stream_id)
);

CREATE TABLE IF NOT EXISTS profiles (
    user_id      TEXT PRIMARY KEY,
    display_name TEXT,
    avatar       TEXT,
    status_line  TEXT
);

CREATE TABLE IF NOT EXISTS read_markers (
    user_id      TEXT NOT NULL,
    stream_id    TEXT NOT NULL,
    room_id      TEXT NOT NULL,
    last_read_at TEXT NOT NULL,
    PRIMARY KEY (user_id, stream_id, room_id)
);

CREATE TABLE IF NOT EXISTS session (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

struct LiveQueryState {
    id: u64,
    sql: String,
    params: Vec<SqlValue>,
    last: QueryRows,
    sender: mpsc::UnboundedSender<QueryRows>,
}

struct StoreInner {
    conn: Connection,
    depth: usize,
    live: Vec<LiveQueryState>,
    next_live_id: u64,
}

/// SQLite-backed implementation of the [`Store`] seam
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Connection(format!("{}: {e}", db_path.display())))?;
        Self::from_connection(conn)
    }

    /// Open a transient in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Connection(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                conn,
                depth: 0,
                live: Vec::new(),
                next_live_id: 0,
            })),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Connection("store mutex poisoned".to_string()))
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    if version != SCHEMA_VERSION {
        if version != 0 {
            warn!(
                found = version,
                expected = SCHEMA_VERSION,
                "Schema version mismatch, resetting local store"
            );
        }
        let drops = CORE_TABLES
            .iter()
            .map(|t| format!("DROP TABLE IF EXISTS {t};"))
            .collect::<String>();
        conn.execute_batch(&drops)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
    }

    conn.execute_batch(SCHEMA)
        .map_err(|e| StoreError::Connection(e.to_string()))?;
    Ok(())
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn value_of(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> StoreResult<QueryRows> {
    let mut stmt = conn.prepare(sql).map_err(|e| StoreError::Statement {
        sql: sql.to_string(),
        message: e.to_string(),
    })?;
    let columns = stmt.column_count();

    let mut rows = stmt
        .query(params_from_iter(params.iter()))
        .map_err(|e| StoreError::Statement {
            sql: sql.to_string(),
            message: e.to_string(),
        })?;

    let mut out = Vec::new();
    loop {
        match rows.next() {
            Ok(Some(row)) => {
                let mut values = Vec::with_capacity(columns);
                for i in 0..columns {
                    let value = row.get_ref(i).map_err(|e| StoreError::Statement {
                        sql: sql.to_string(),
                        message: e.to_string(),
                    })?;
                    values.push(value_of(value));
                }
                out.push(values);
            }
            Ok(None) => break,
            Err(e) => {
                return Err(StoreError::Statement {
                    sql: sql.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(out)
}

/// Savepoint names are internal identifiers; reject anything that could
/// not be spliced into a SAVEPOINT statement.
fn valid_savepoint_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn refresh_live_queries(inner: &mut StoreInner) {
    let mut dropped = Vec::new();
    for (i, live) in inner.live.iter_mut().enumerate() {
        match run_query(&inner.conn, &live.sql, &live.params) {
            Ok(rows) => {
                if rows != live.last {
                    live.last = rows.clone();
                    if live.sender.send(rows).is_err() {
                        dropped.push(i);
                    }
                }
            }
            Err(e) => {
                warn!(live_query = live.id, error = %e, "Live query refresh failed");
            }
        }
    }
    for i in dropped.into_iter().rev() {
        let removed = inner.live.remove(i);
        debug!(live_query = removed.id, "Live query port closed, unregistered");
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn execute(&self, mutation: &Mutation) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let changed = inner
            .conn
            .execute(&mutation.sql, params_from_iter(mutation.params.iter()))
            .map_err(|e| StoreError::Statement {
                sql: mutation.truncated_sql(),
                message: e.to_string(),
            })?;
        if inner.depth == 0 {
            refresh_live_queries(&mut inner);
        }
        Ok(changed)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<QueryRows> {
        let inner = self.lock()?;
        run_query(&inner.conn, sql, params)
    }

    async fn savepoint(&self, name: &str) -> StoreResult<()> {
        if !valid_savepoint_name(name) {
            return Err(StoreError::Transaction(format!(
                "invalid savepoint name '{name}'"
            )));
        }
        let mut inner = self.lock()?;
        inner
            .conn
            .execute_batch(&format!("SAVEPOINT {name};"))
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        inner.depth += 1;
        Ok(())
    }

    async fn release(&self, name: &str) -> StoreResult<()> {
        if !valid_savepoint_name(name) {
            return Err(StoreError::Transaction(format!(
                "invalid savepoint name '{name}'"
            )));
        }
        let mut inner = self.lock()?;
        inner
            .conn
            .execute_batch(&format!("RELEASE {name};"))
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        inner.depth = inner.depth.saturating_sub(1);
        if inner.depth == 0 {
            refresh_live_queries(&mut inner);
        }
        Ok(())
    }

    async fn rollback_to(&self, name: &str) -> StoreResult<()> {
        if !valid_savepoint_name(name) {
            return Err(StoreError::Transaction(format!(
                "invalid savepoint name '{name}'"
            )));
        }
        let inner = self.lock()?;
        inner
            .conn
            .execute_batch(&format!("ROLLBACK TO {name};"))
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    async fn register_live_query(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> StoreResult<LiveQueryHandle> {
        let mut inner = self.lock()?;
        let initial = run_query(&inner.conn, sql, params)?;

        let (sender, rows) = mpsc::unbounded_channel();
        // Initial snapshot so consumers can render without waiting for
        // the first change.
        let _ = sender.send(initial.clone());

        let id = inner.next_live_id;
        inner.next_live_id += 1;
        inner.live.push(LiveQueryState {
            id,
            sql: sql.to_string(),
            params: params.to_vec(),
            last: initial,
            sender,
        });

        debug!(live_query = id, sql, "Registered live query");
        Ok(LiveQueryHandle { id, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{EventId, StreamId, StreamIndex};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_record_event_is_idempotent() {
        let store = store();
        let stream = StreamId::new("s1").unwrap();
        let event = EventId::generate();

        assert!(store
            .record_event(&stream, &event, StreamIndex::new(1))
            .await
            .unwrap());
        assert!(!store
            .record_event(&stream, &event, StreamIndex::new(1))
            .await
            .unwrap());
        assert!(store.contains_event(&stream, &event).await.unwrap());
    }

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let store = store();
        let stream = StreamId::new("s1").unwrap();

        assert_eq!(store.cursor(&stream).await.unwrap(), StreamIndex::ZERO);
        store.set_cursor(&stream, StreamIndex::new(10)).await.unwrap();
        store.set_cursor(&stream, StreamIndex::new(4)).await.unwrap();
        assert_eq!(store.cursor(&stream).await.unwrap(), StreamIndex::new(10));
    }

    #[tokio::test]
    async fn test_savepoint_rollback_discards_changes() {
        let store = store();
        let stream = StreamId::new("s1").unwrap();
        let event = EventId::generate();

        store.savepoint("outer").await.unwrap();
        store
            .record_event(&stream, &event, StreamIndex::new(1))
            .await
            .unwrap();
        store.rollback_to("outer").await.unwrap();
        store.release("outer").await.unwrap();

        assert!(!store.contains_event(&stream, &event).await.unwrap());
    }

    #[tokio::test]
    async fn test_live_query_fires_on_commit_boundary() {
        let store = store();
        let stream = StreamId::new("s1").unwrap();

        let mut handle = store
            .register_live_query("SELECT COUNT(*) FROM event_log", &[])
            .await
            .unwrap();

        // Initial snapshot.
        let rows = handle.rows.recv().await.unwrap();
        assert_eq!(rows[0][0], SqlValue::Integer(0));

        store.savepoint("batch").await.unwrap();
        store
            .record_event(&stream, &EventId::generate(), StreamIndex::new(1))
            .await
            .unwrap();
        // Not committed yet; no new snapshot should be pending.
        assert!(handle.rows.try_recv().is_err());

        store.release("batch").await.unwrap();
        let rows = handle.rows.recv().await.unwrap();
        assert_eq!(rows[0][0], SqlValue::Integer(1));
    }

    #[tokio::test]
    async fn test_check_constraint_surfaces_as_statement_error() {
        let store = store();
        let oversized = "x".repeat(65_537);
        let result = store
            .execute(&Mutation::new(
                "INSERT INTO messages (stream_id, message_id, room_id, author, content, created_at) \
                 VALUES ('s', 'm', 'r', 'u', ?1, 't')",
                vec![SqlValue::Text(oversized)],
            ))
            .await;
        assert!(matches!(result, Err(StoreError::Statement { .. })));
    }

    #[tokio::test]
    async fn test_session_row_round_trip() {
        let store = store();
        assert_eq!(store.session_get("user").await.unwrap(), None);
        store.session_put("user", "did:plc:abc").await.unwrap();
        assert_eq!(
            store.session_get("user").await.unwrap(),
            Some("did:plc:abc".to_string())
        );
        store.session_delete("user").await.unwrap();
        assert_eq!(store.session_get("user").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tidemark.db");
        let stream = StreamId::new("s1").unwrap();
        let committed = EventId::generate();
        let rolled_back = EventId::generate();

        {
            let store = SqliteStore::open(&db_path).unwrap();
            store.savepoint("batch").await.unwrap();
            store
                .record_event(&stream, &committed, StreamIndex::new(1))
                .await
                .unwrap();
            store.release("batch").await.unwrap();
            store.set_cursor(&stream, StreamIndex::new(1)).await.unwrap();

            // A rolled-back savepoint leaves no trace on disk.
            store.savepoint("discard").await.unwrap();
            store
                .record_event(&stream, &rolled_back, StreamIndex::new(2))
                .await
                .unwrap();
            store.rollback_to("discard").await.unwrap();
            store.release("discard").await.unwrap();
        }

        // Same schema version on re-open: committed state survives.
        let store = SqliteStore::open(&db_path).unwrap();
        assert!(store.contains_event(&stream, &committed).await.unwrap());
        assert!(!store.contains_event(&stream, &rolled_back).await.unwrap());
        assert_eq!(store.cursor(&stream).await.unwrap(), StreamIndex::new(1));
    }

    #[tokio::test]
    async fn test_schema_version_mismatch_resets_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tidemark.db");
        let stream = StreamId::new("s1").unwrap();
        let event = EventId::generate();

        {
            let store = SqliteStore::open(&db_path).unwrap();
            store
                .record_event(&stream, &event, StreamIndex::new(1))
                .await
                .unwrap();
            store.set_cursor(&stream, StreamIndex::new(1)).await.unwrap();
        }

        // Stamp a future schema version on the file, as a newer build
        // would have left behind.
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION + 1))
                .unwrap();
        }

        // Version mismatch triggers the full reset on open.
        let store = SqliteStore::open(&db_path).unwrap();
        assert!(!store.contains_event(&stream, &event).await.unwrap());
        assert_eq!(store.cursor(&stream).await.unwrap(), StreamIndex::ZERO);

        // The reset store is tagged current and fully usable again.
        assert!(store
            .record_event(&stream, &event, StreamIndex::new(1))
            .await
            .unwrap());
        let conn = Connection::open(&db_path).unwrap();
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
