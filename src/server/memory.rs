// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-Memory Event Server
//!
//! Deterministic in-process implementation of the [`EventServer`]
//! contract for tests and offline use. Rows live in vectors, indexes
//! are assigned on append, and backfill pages are cut at the configured
//! page size, so scheduling scenarios replay identically.
//!
//! Registration and backfill snapshotting happen under one lock, so a
//! live event can never be delivered ahead of the history it follows.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{SyncError, SyncResult};
use crate::event::tags;
use crate::identity::TokenProvider;
use crate::ids::{BatchId, StreamId, StreamIndex, UserId};

use super::{
    Delivery, DeliveryMeta, DeliverySink, EventPage, EventServer, ModuleDef, Row, ServerConfig,
    ServerStatus, StreamInfo, StreamQuery, SubscriptionHandle,
};

struct LiveSubscriber {
    id: Uuid,
    sink: DeliverySink,
    metadata_only: bool,
}

struct MemoryStream {
    module_cid: String,
    rows: Vec<Row>,
    subscribers: Vec<LiveSubscriber>,
}

impl MemoryStream {
    fn tail(&self) -> StreamIndex {
        StreamIndex::new(self.rows.len() as u64)
    }
}

struct MemoryState {
    streams: HashMap<StreamId, MemoryStream>,
    modules: HashSet<String>,
    authenticated: Option<UserId>,
    next_stream: u64,
}

/// In-memory [`EventServer`] implementation
pub struct MemoryEventServer {
    state: Arc<Mutex<MemoryState>>,
    status: watch::Sender<ServerStatus>,
    config: ServerConfig,
    user: UserId,
}

impl MemoryEventServer {
    /// Create a server that will attest `user` on authentication and on
    /// every appended row
    pub fn new(user: UserId, config: ServerConfig) -> Self {
        let (status, _) = watch::channel(ServerStatus::Connecting);
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                streams: HashMap::new(),
                modules: HashSet::new(),
                authenticated: None,
                next_stream: 0,
            })),
            status,
            config,
            user,
        }
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Transport("server state poisoned".to_string()))
    }

    /// Append a row authored by an arbitrary user, bypassing the
    /// authentication gate. Lets tests seed history from other authors.
    pub fn seed_event(
        &self,
        stream: &StreamId,
        user: &UserId,
        payload: Bytes,
    ) -> SyncResult<StreamIndex> {
        let mut state = self.lock()?;
        append_row(&mut state, stream, user.clone(), payload)
    }

    /// Create a stream with a fixed id, so tests can pin identifiers
    pub fn seed_stream(&self, stream: StreamId, module_cid: &str) -> SyncResult<()> {
        let mut state = self.lock()?;
        state.streams.insert(
            stream,
            MemoryStream {
                module_cid: module_cid.to_string(),
                rows: Vec::new(),
                subscribers: Vec::new(),
            },
        );
        state.modules.insert(module_cid.to_string());
        Ok(())
    }

    /// Remove a stream, as if it were deleted server-side. Used to
    /// exercise the profile-record repair path.
    pub fn remove_stream(&self, stream: &StreamId) -> SyncResult<()> {
        let mut state = self.lock()?;
        state.streams.remove(stream);
        Ok(())
    }

    /// Simulate a transport drop: all subscriptions close, the status
    /// watch flips to `Disconnected`
    pub fn disconnect(&self) -> SyncResult<()> {
        let mut state = self.lock()?;
        state.authenticated = None;
        for stream in state.streams.values_mut() {
            for subscriber in stream.subscribers.drain(..) {
                let _ = subscriber.sink.send(Delivery::Closed);
            }
        }
        drop(state);
        let _ = self.status.send(ServerStatus::Disconnected);
        Ok(())
    }
}

fn structural_tag(payload: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return false;
    };
    matches!(
        value.get("type").and_then(serde_json::Value::as_str),
        Some(tags::ROOM_CREATE) | Some(tags::ROOM_UPDATE) | Some(tags::SPACE_INFO)
    )
}

fn room_of(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get("room")?
        .as_str()
        .map(str::to_string)
}

fn append_row(
    state: &mut MemoryState,
    stream_id: &StreamId,
    user: UserId,
    payload: Bytes,
) -> SyncResult<StreamIndex> {
    let stream = state
        .streams
        .get_mut(stream_id)
        .ok_or_else(|| SyncError::Protocol(format!("unknown stream {stream_id}")))?;

    let idx = stream.tail().next();
    let row = Row {
        idx,
        user,
        payload,
    };
    stream.rows.push(row.clone());
    let tail = stream.tail();

    // Echo to live subscribers, respecting metadata filtering.
    let mut dead = Vec::new();
    for (i, subscriber) in stream.subscribers.iter().enumerate() {
        if subscriber.metadata_only && !structural_tag(&row.payload) {
            continue;
        }
        let delivery = Delivery::Page {
            page: EventPage {
                rows: vec![row.clone()],
                has_more: false,
                tail,
            },
            meta: DeliveryMeta {
                batch_id: BatchId::generate(),
                stream_id: stream_id.clone(),
                is_backfill: false,
            },
        };
        if subscriber.sink.send(delivery).is_err() {
            dead.push(i);
        }
    }
    for i in dead.into_iter().rev() {
        let removed = stream.subscribers.remove(i);
        debug!(subscription = %removed.id, "Live sink closed, dropping subscriber");
    }

    Ok(idx)
}

#[async_trait]
impl EventServer for MemoryEventServer {
    async fn authenticate(&self, tokens: Arc<dyn TokenProvider>) -> SyncResult<UserId> {
        // Any well-formed token is accepted; the double only checks
        // that the handshake actually ran.
        let token = tokens.token().await?;
        if token.is_empty() {
            return Err(SyncError::Transport("empty token rejected".to_string()));
        }
        {
            let mut state = self.lock()?;
            state.authenticated = Some(self.user.clone());
        }
        let _ = self.status.send(ServerStatus::Authenticated {
            user: self.user.clone(),
        });
        Ok(self.user.clone())
    }

    fn status(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    async fn create_stream(&self, module_cid: &str) -> SyncResult<StreamId> {
        let mut state = self.lock()?;
        state.next_stream += 1;
        let id = StreamId::new(format!("mem-stream-{}", state.next_stream))
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        state.streams.insert(
            id.clone(),
            MemoryStream {
                module_cid: module_cid.to_string(),
                rows: Vec::new(),
                subscribers: Vec::new(),
            },
        );
        state.modules.insert(module_cid.to_string());
        Ok(id)
    }

    async fn stream_info(&self, stream: &StreamId) -> SyncResult<Option<StreamInfo>> {
        let state = self.lock()?;
        Ok(state.streams.get(stream).map(|s| StreamInfo {
            module_cid: s.module_cid.clone(),
        }))
    }

    async fn has_module(&self, cid: &str) -> SyncResult<bool> {
        let state = self.lock()?;
        Ok(state.modules.contains(cid))
    }

    async fn upload_module(&self, def: &ModuleDef) -> SyncResult<String> {
        let mut state = self.lock()?;
        state.modules.insert(def.cid.clone());
        Ok(def.cid.clone())
    }

    async fn update_module(&self, stream: &StreamId, cid: &str) -> SyncResult<()> {
        let mut state = self.lock()?;
        if !state.modules.contains(cid) {
            return Err(SyncError::Protocol(format!("module {cid} not uploaded")));
        }
        let Some(entry) = state.streams.get_mut(stream) else {
            return Err(SyncError::Protocol(format!("unknown stream {stream}")));
        };
        entry.module_cid = cid.to_string();
        Ok(())
    }

    async fn subscribe_events(
        &self,
        stream_id: &StreamId,
        query: StreamQuery,
        sink: DeliverySink,
    ) -> SyncResult<SubscriptionHandle> {
        let metadata_only = query.name == "metadata";
        let page_size = self.config.page_size.max(1);

        // Snapshot, deliver backfill, and register for live delivery
        // under one lock so no appended row can slip between them.
        let mut state = self.lock()?;
        let stream = state
            .streams
            .get_mut(stream_id)
            .ok_or_else(|| SyncError::Protocol(format!("unknown stream {stream_id}")))?;
        let tail = stream.tail();

        let history: Vec<Row> = stream
            .rows
            .iter()
            .filter(|row| row.idx >= query.start)
            .filter(|row| !metadata_only || structural_tag(&row.payload))
            .cloned()
            .collect();

        let mut pages: Vec<Vec<Row>> = history
            .chunks(page_size)
            .map(<[Row]>::to_vec)
            .collect();
        if pages.is_empty() {
            pages.push(Vec::new());
        }
        let last = pages.len() - 1;
        for (i, rows) in pages.into_iter().enumerate() {
            let delivery = Delivery::Page {
                page: EventPage {
                    rows,
                    has_more: i < last,
                    tail,
                },
                meta: DeliveryMeta {
                    batch_id: BatchId::generate(),
                    stream_id: stream_id.clone(),
                    is_backfill: true,
                },
            };
            if sink.send(delivery).is_err() {
                warn!(stream = %stream_id, "Subscription sink closed during backfill");
                return Ok(SubscriptionHandle::new(|| {}));
            }
        }

        let id = Uuid::now_v7();
        stream.subscribers.push(LiveSubscriber {
            id,
            sink,
            metadata_only,
        });

        let state_ref = Arc::clone(&self.state);
        let stream_ref = stream_id.clone();
        Ok(SubscriptionHandle::new(move || {
            if let Ok(mut state) = state_ref.lock() {
                if let Some(stream) = state.streams.get_mut(&stream_ref) {
                    if let Some(pos) = stream.subscribers.iter().position(|s| s.id == id) {
                        let removed = stream.subscribers.remove(pos);
                        let _ = removed.sink.send(Delivery::Closed);
                    }
                }
            }
        }))
    }

    async fn query(&self, stream_id: &StreamId, query: StreamQuery) -> SyncResult<Vec<Row>> {
        let state = self.lock()?;
        let stream = state
            .streams
            .get(stream_id)
            .ok_or_else(|| SyncError::Protocol(format!("unknown stream {stream_id}")))?;

        match query.name.as_str() {
            "events" => Ok(stream
                .rows
                .iter()
                .filter(|row| row.idx >= query.start)
                .cloned()
                .collect()),
            "room" => {
                let room = query
                    .params
                    .get("room")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| {
                        SyncError::Protocol("room query requires a room param".to_string())
                    })?;
                let before = query
                    .params
                    .get("before")
                    .and_then(serde_json::Value::as_u64)
                    .map(StreamIndex::new);

                let mut rows: Vec<Row> = stream
                    .rows
                    .iter()
                    .filter(|row| room_of(&row.payload).as_deref() == Some(room))
                    .filter(|row| before.map(|b| row.idx < b).unwrap_or(true))
                    .cloned()
                    .collect();
                // Most recent first, bounded window.
                rows.reverse();
                if let Some(limit) = query.limit {
                    rows.truncate(limit);
                }
                Ok(rows)
            }
            other => Err(SyncError::Protocol(format!("unknown query '{other}'"))),
        }
    }

    async fn send_event(&self, stream_id: &StreamId, payload: Bytes) -> SyncResult<()> {
        let mut state = self.lock()?;
        let Some(user) = state.authenticated.clone() else {
            return Err(SyncError::Transport("not authenticated".to_string()));
        };
        append_row(&mut state, stream_id, user, payload)?;
        Ok(())
    }

    async fn send_events(&self, stream_id: &StreamId, payloads: Vec<Bytes>) -> SyncResult<()> {
        let mut state = self.lock()?;
        let Some(user) = state.authenticated.clone() else {
            return Err(SyncError::Transport("not authenticated".to_string()));
        };
        for payload in payloads {
            append_row(&mut state, stream_id, user.clone(), payload)?;
        }
        Ok(())
    }
}
