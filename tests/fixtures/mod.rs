// Copyright (c) 2025 - Cowboy AI, Inc.
//! Shared test fixtures: an end-to-end pipeline over the in-memory
//! event server and an in-memory SQLite store.

#![allow(dead_code)]

use std::sync::Arc;
use tokio::sync::mpsc;

use tidemark::{
    Batch, Event, EventBody, EventChannel, EventId, EventServer, InMemoryProfileFetcher,
    MaterializationReport, Materializer, MemoryEventServer, Priority, RoomId, ServerConfig,
    SqliteStore, StaticTokenProvider, Store, StreamId, StreamIndex, UserId,
};

pub const MODULE: &str = "space.chat.module.v0";

/// A wired pipeline: memory server, channel, materializer, store
pub struct Pipeline {
    pub user: UserId,
    pub server: Arc<MemoryEventServer>,
    pub store: Arc<SqliteStore>,
    pub channel: EventChannel,
    pub profiles: Arc<InMemoryProfileFetcher>,
    pub reports: mpsc::UnboundedReceiver<MaterializationReport>,
}

pub async fn pipeline() -> Pipeline {
    pipeline_with_page_size(500).await
}

pub async fn pipeline_with_page_size(page_size: usize) -> Pipeline {
    let user = UserId::new("did:plc:me").unwrap();
    let server = Arc::new(MemoryEventServer::new(
        user.clone(),
        ServerConfig {
            page_size,
            ..ServerConfig::default()
        },
    ));
    server
        .authenticate(Arc::new(StaticTokenProvider::new("test-token")))
        .await
        .unwrap();

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let channel = EventChannel::default();
    let profiles = Arc::new(InMemoryProfileFetcher::new());
    let (materializer, reports) = Materializer::new(
        channel.clone(),
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&profiles) as Arc<dyn tidemark::ProfileFetcher>,
    );
    materializer.spawn();

    Pipeline {
        user,
        server,
        store,
        channel,
        profiles,
        reports,
    }
}

/// Build an event as the server would deliver it
pub fn delivered(
    user: &UserId,
    idx: u64,
    room: Option<RoomId>,
    body: EventBody,
) -> Event {
    Event {
        id: EventId::generate(),
        room,
        user: user.clone(),
        stream_index: StreamIndex::new(idx),
        body,
    }
}

/// Same as [`delivered`] but with a pinned event id, for dependency
/// scenarios
pub fn delivered_with_id(
    id: EventId,
    user: &UserId,
    idx: u64,
    room: Option<RoomId>,
    body: EventBody,
) -> Event {
    Event {
        id,
        room,
        user: user.clone(),
        stream_index: StreamIndex::new(idx),
        body,
    }
}

/// Wrap events into a backfill batch
pub fn fetched(stream: &StreamId, events: Vec<Event>, priority: Priority) -> Batch {
    Batch::Fetched {
        batch_id: tidemark::BatchId::generate(),
        stream_id: stream.clone(),
        events,
        priority,
    }
}

/// Wrap events into a live batch
pub fn live(stream: &StreamId, events: Vec<Event>, priority: Priority) -> Batch {
    Batch::Live {
        batch_id: tidemark::BatchId::generate(),
        stream_id: stream.clone(),
        events,
        priority,
    }
}

/// One text column from a single-row query
pub async fn text_cell(store: &SqliteStore, sql: &str, params: &[tidemark::SqlValue]) -> Option<String> {
    let rows = store.query(sql, params).await.unwrap();
    rows.first().and_then(|row| match row.first() {
        Some(tidemark::SqlValue::Text(value)) => Some(value.clone()),
        _ => None,
    })
}

/// One integer column from a single-row query
pub async fn int_cell(store: &SqliteStore, sql: &str, params: &[tidemark::SqlValue]) -> Option<i64> {
    let rows = store.query(sql, params).await.unwrap();
    rows.first().and_then(|row| match row.first() {
        Some(tidemark::SqlValue::Integer(value)) => Some(*value),
        _ => None,
    })
}
