// Copyright (c) 2025 - Cowboy AI, Inc.
//! Local Store Abstraction
//!
//! The materializer is the only writer of the local store; live-query
//! consumers read from it. This module defines the seam between them:
//! parameterized mutations as plain data, nested savepoints, and
//! live-query registration that fires on every committed change.
//!
//! # Architecture
//!
//! ```text
//! Registry transform          Store
//! ─────────────────          ──────────
//!
//! Event                      Mutations
//!   │                            │
//!   ▼                            ▼
//! ┌──────────────┐        ┌──────────────┐
//! │ transform()  │  data  │  execute()   │
//! │  pure func   │ ─────> │  savepoints  │
//! └──────────────┘        └──────────────┘
//!                                │
//!                                ▼
//!                         Live-query ports
//! ```
//!
//! Mutations are returned as data, not performed, so transforms stay
//! pure and replayable; the store interprets them inside savepoints.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::{EventId, StreamId, StreamIndex, UserId};

pub use sqlite::SqliteStore;

/// A single SQL parameter value, store-agnostic
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(value as i64)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One parameterized store statement, produced by a registry transform
///
/// Transforms only emit idempotent shapes (`INSERT OR IGNORE`,
/// `INSERT OR REPLACE`, keyed `UPDATE`), so replaying an event against
/// the same pre-state is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Mutation {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Statement text truncated for warning reports
    pub fn truncated_sql(&self) -> String {
        const LIMIT: usize = 120;
        let trimmed = self.sql.split_whitespace().collect::<Vec<_>>().join(" ");
        if trimmed.chars().count() <= LIMIT {
            trimmed
        } else {
            let head: String = trimmed.chars().take(LIMIT).collect();
            format!("{head}…")
        }
    }
}

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A single statement failed (constraint violation, bad binding)
    #[error("Statement failed: {message} ({sql})")]
    Statement { sql: String, message: String },

    /// Savepoint bookkeeping or whole-transaction failure
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// The store itself is unusable
    #[error("Store connection error: {0}")]
    Connection(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Rows returned by a query, column values in select order
pub type QueryRows = Vec<Vec<SqlValue>>;

/// Handle for a registered live query
///
/// The receiver fires with the fresh result set after every committed
/// change that alters it. Dropping the handle unregisters the query.
pub struct LiveQueryHandle {
    pub id: u64,
    pub rows: tokio::sync::mpsc::UnboundedReceiver<QueryRows>,
}

/// The local relational store seam
///
/// Implementations must serialize writes (the materializer is the only
/// writer) and support nested savepoints. All statements are
/// parameterized; none of the core's SQL is built by string
/// interpolation of values.
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute one mutation, returning the affected row count
    async fn execute(&self, mutation: &Mutation) -> StoreResult<usize>;

    /// Run a one-shot query
    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<QueryRows>;

    /// Open a named savepoint (nestable)
    async fn savepoint(&self, name: &str) -> StoreResult<()>;

    /// Release a named savepoint, committing its changes into the
    /// enclosing scope. Releasing the outermost savepoint is the commit
    /// boundary that fires live queries.
    async fn release(&self, name: &str) -> StoreResult<()>;

    /// Roll back to a named savepoint without releasing it
    async fn rollback_to(&self, name: &str) -> StoreResult<()>;

    /// Register a live query; the handle's port fires on every
    /// committed change to the result set
    async fn register_live_query(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> StoreResult<LiveQueryHandle>;

    // ------------------------------------------------------------------
    // Typed helpers over the core tables, shared by all implementations
    // ------------------------------------------------------------------

    /// Record an event in `event_log`; returns false when the event was
    /// already present (idempotent replay)
    async fn record_event(
        &self,
        stream: &StreamId,
        event: &EventId,
        idx: StreamIndex,
    ) -> StoreResult<bool> {
        let changed = self
            .execute(&Mutation::new(
                "INSERT OR IGNORE INTO event_log (stream_id, event_id, stream_index) \
                 VALUES (?1, ?2, ?3)",
                vec![
                    SqlValue::from(stream.as_str()),
                    SqlValue::from(event.to_string()),
                    SqlValue::Integer(idx.value() as i64),
                ],
            ))
            .await?;
        Ok(changed > 0)
    }

    /// Whether an event has been recorded for this stream
    async fn contains_event(&self, stream: &StreamId, event: &EventId) -> StoreResult<bool> {
        let rows = self
            .query(
                "SELECT 1 FROM event_log WHERE stream_id = ?1 AND event_id = ?2",
                &[
                    SqlValue::from(stream.as_str()),
                    SqlValue::from(event.to_string()),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Greatest durably committed index for a stream, zero if none
    async fn cursor(&self, stream: &StreamId) -> StoreResult<StreamIndex> {
        let rows = self
            .query(
                "SELECT stream_index FROM stream_cursor WHERE stream_id = ?1",
                &[SqlValue::from(stream.as_str())],
            )
            .await?;
        match rows.first().and_then(|r| r.first()) {
            Some(SqlValue::Integer(idx)) => Ok(StreamIndex::new(*idx as u64)),
            _ => Ok(StreamIndex::ZERO),
        }
    }

    /// Advance the cursor; a lower value than the stored one is a no-op
    /// (the cursor never regresses)
    async fn set_cursor(&self, stream: &StreamId, idx: StreamIndex) -> StoreResult<()> {
        self.execute(&Mutation::new(
            "INSERT INTO stream_cursor (stream_id, stream_index) VALUES (?1, ?2) \
             ON CONFLICT(stream_id) DO UPDATE SET \
             stream_index = MAX(stream_index, excluded.stream_index)",
            vec![
                SqlValue::from(stream.as_str()),
                SqlValue::Integer(idx.value() as i64),
            ],
        ))
        .await?;
        Ok(())
    }

    /// Joined spaces materialized from the personal stream
    async fn joined_spaces(&self, user: &UserId) -> StoreResult<Vec<StreamId>> {
        let rows = self
            .query(
                "SELECT stream_id FROM joined_spaces WHERE user_id = ?1 \
                 ORDER BY joined_at, stream_id",
                &[SqlValue::from(user.as_str())],
            )
            .await?;
        let mut streams = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(SqlValue::Text(id)) = row.first() {
                if let Ok(stream) = StreamId::new(id.clone()) {
                    streams.push(stream);
                }
            }
        }
        Ok(streams)
    }

    /// Whether a profile row exists for this user
    async fn has_profile(&self, user: &UserId) -> StoreResult<bool> {
        let rows = self
            .query(
                "SELECT 1 FROM profiles WHERE user_id = ?1",
                &[SqlValue::from(user.as_str())],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Read one key from the single-row session table
    async fn session_get(&self, key: &str) -> StoreResult<Option<String>> {
        let rows = self
            .query(
                "SELECT value FROM session WHERE key = ?1",
                &[SqlValue::from(key)],
            )
            .await?;
        Ok(rows.first().and_then(|r| match r.first() {
            Some(SqlValue::Text(v)) => Some(v.clone()),
            _ => None,
        }))
    }

    /// Write one key of the session table
    async fn session_put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.execute(&Mutation::new(
            "INSERT OR REPLACE INTO session (key, value) VALUES (?1, ?2)",
            vec![SqlValue::from(key), SqlValue::from(value)],
        ))
        .await?;
        Ok(())
    }

    /// Delete one key of the session table (logout)
    async fn session_delete(&self, key: &str) -> StoreResult<()> {
        self.execute(&Mutation::new(
            "DELETE FROM session WHERE key = ?1",
            vec![SqlValue::from(key)],
        ))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_sql_collapses_whitespace() {
        let m = Mutation::new(
            "INSERT INTO messages\n    (a, b)\n    VALUES (?1, ?2)",
            vec![],
        );
        assert_eq!(m.truncated_sql(), "INSERT INTO messages (a, b) VALUES (?1, ?2)");
    }

    #[test]
    fn test_truncated_sql_caps_length() {
        let long = format!("SELECT {}", "x, ".repeat(100));
        let m = Mutation::new(long, vec![]);
        assert!(m.truncated_sql().len() <= 124);
        assert!(m.truncated_sql().ends_with('…'));
    }

    #[test]
    fn test_sql_value_conversions() {
        assert_eq!(SqlValue::from("a"), SqlValue::Text("a".to_string()));
        assert_eq!(SqlValue::from(7i64), SqlValue::Integer(7));
        assert_eq!(SqlValue::from(true), SqlValue::Integer(1));
        assert_eq!(SqlValue::from(None::<String>), SqlValue::Null);
    }
}
