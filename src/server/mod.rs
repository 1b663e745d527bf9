// Copyright (c) 2025 - Cowboy AI, Inc.
//! Remote Event Server Contract
//!
//! The remote server hosts many independent append-only streams. The
//! core only assumes the operations defined here: an auth handshake, a
//! query/subscribe primitive returning rows, and an append primitive.
//! The server assigns every accepted event its [`StreamIndex`] and
//! attests the authoring user on each row.
//!
//! Two implementations ship with the crate:
//!
//! - [`NatsEventServer`] backs the contract with NATS JetStream
//! - [`MemoryEventServer`] is a deterministic in-process double for
//!   tests and offline use

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::errors::SyncResult;
use crate::identity::TokenProvider;
use crate::ids::{BatchId, StreamId, StreamIndex, UserId};

pub use memory::MemoryEventServer;
pub use nats::{NatsEventServer, NatsServerConfig};

/// Caller-facing tuning for server calls
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Deadline applied to each RPC; expiry surfaces as a transport
    /// error through the normal errored path
    pub request_timeout: Duration,

    /// Rows per backfill page
    pub page_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            page_size: 500,
        }
    }
}

/// One stored event row as the server returns it
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Server-assigned position in the stream
    pub idx: StreamIndex,

    /// Authoring user, attested by the server
    pub user: UserId,

    /// Opaque event payload
    pub payload: Bytes,
}

/// A page of rows from a subscription or one-shot query
#[derive(Debug, Clone)]
pub struct EventPage {
    pub rows: Vec<Row>,

    /// More history follows; `false` marks the backfill → live-tail
    /// transition
    pub has_more: bool,

    /// The stream's tail index when the page was cut; lets a metadata
    /// subscription learn the latest index without reading every row
    pub tail: StreamIndex,
}

/// Bookkeeping attached to every delivered page
#[derive(Debug, Clone)]
pub struct DeliveryMeta {
    pub batch_id: BatchId,
    pub stream_id: StreamId,
    pub is_backfill: bool,
}

/// Items pushed into a subscription sink
#[derive(Debug)]
pub enum Delivery {
    /// A page of rows
    Page { page: EventPage, meta: DeliveryMeta },

    /// Transport failure; the subscription is dead
    Error(String),

    /// Clean close (unsubscribe or server shutdown)
    Closed,
}

/// Sink half of a subscription; the server pushes [`Delivery`] items
/// into it in stream order
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

/// Named query against a stream
///
/// `name` selects a server-side projection; the core uses `events`
/// (everything), `metadata` (structural events only), and `room` (a
/// bounded window of one room, most recent first).
#[derive(Debug, Clone)]
pub struct StreamQuery {
    pub name: String,
    pub params: serde_json::Value,
    pub start: StreamIndex,
    pub limit: Option<usize>,
}

impl StreamQuery {
    /// Full event subscription from `start` (exclusive cursor, so the
    /// first delivered row is `start`)
    pub fn events_from(start: StreamIndex) -> Self {
        Self {
            name: "events".to_string(),
            params: serde_json::Value::Null,
            start,
            limit: None,
        }
    }

    /// Filtered projection of structural events only
    pub fn metadata_from(start: StreamIndex) -> Self {
        Self {
            name: "metadata".to_string(),
            params: serde_json::Value::Null,
            start,
            limit: None,
        }
    }

    /// Bounded window of one room's events, most recent first
    pub fn room_window(
        room: &crate::ids::RoomId,
        limit: usize,
        before: Option<StreamIndex>,
    ) -> Self {
        let mut params = serde_json::Map::new();
        params.insert(
            "room".to_string(),
            serde_json::Value::String(room.to_string()),
        );
        if let Some(before) = before {
            params.insert("before".to_string(), serde_json::json!(before.value()));
        }
        Self {
            name: "room".to_string(),
            params: serde_json::Value::Object(params),
            start: StreamIndex::ZERO,
            limit: Some(limit),
        }
    }
}

/// Stream metadata reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Content id of the module governing the stream
    pub module_cid: String,
}

/// A module definition for upload
#[derive(Debug, Clone)]
pub struct ModuleDef {
    pub cid: String,
    pub definition: serde_json::Value,
}

/// Connection status emitted on the server's watch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Connecting,
    Authenticated { user: UserId },
    Disconnected,
}

/// Handle for an open subscription; dropping it unsubscribes
pub struct SubscriptionHandle {
    id: Uuid,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: Uuid::now_v7(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Release the server-side subscription. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// The remote event server seam
#[async_trait]
pub trait EventServer: Send + Sync {
    /// Perform the token handshake; resolves with the attested user id
    /// and flips the status watch to `Authenticated`
    async fn authenticate(&self, tokens: Arc<dyn TokenProvider>) -> SyncResult<UserId>;

    /// Watch the connection status (`authenticated`, `disconnect`)
    fn status(&self) -> watch::Receiver<ServerStatus>;

    /// Create a new stream governed by the given module
    async fn create_stream(&self, module_cid: &str) -> SyncResult<StreamId>;

    /// Stream metadata; `None` when the stream is unknown to the server
    async fn stream_info(&self, stream: &StreamId) -> SyncResult<Option<StreamInfo>>;

    /// Whether the server already has a module
    async fn has_module(&self, cid: &str) -> SyncResult<bool>;

    /// Upload a module definition, returning its content id
    async fn upload_module(&self, def: &ModuleDef) -> SyncResult<String>;

    /// Point a stream at a different module version. May fail when the
    /// caller lacks admin rights on the stream.
    async fn update_module(&self, stream: &StreamId, cid: &str) -> SyncResult<()>;

    /// Open a subscription delivering pages from `query.start` onward
    /// into `sink`, in stream order, transitioning implicitly from
    /// backfill to live tail
    async fn subscribe_events(
        &self,
        stream: &StreamId,
        query: StreamQuery,
        sink: DeliverySink,
    ) -> SyncResult<SubscriptionHandle>;

    /// One-shot query
    async fn query(&self, stream: &StreamId, query: StreamQuery) -> SyncResult<Vec<Row>>;

    /// Append one encoded payload; the server assigns the index and the
    /// live subscription echoes the event back
    async fn send_event(&self, stream: &StreamId, payload: Bytes) -> SyncResult<()>;

    /// Append several payloads in order
    async fn send_events(&self, stream: &StreamId, payloads: Vec<Bytes>) -> SyncResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_handle_cancel_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut handle = SubscriptionHandle::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        handle.unsubscribe();
        handle.unsubscribe();
        drop(handle);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_room_window_query_shape() {
        let room = crate::ids::RoomId::generate();
        let query = StreamQuery::room_window(&room, 50, Some(StreamIndex::new(120)));
        assert_eq!(query.name, "room");
        assert_eq!(query.limit, Some(50));
        assert_eq!(query.params["room"], room.to_string());
        assert_eq!(query.params["before"], 120);
    }
}
