// Copyright (c) 2025 - Cowboy AI, Inc.
//! Connected Stream
//!
//! One instance per subscribed space. Owns the logical subscription to
//! the remote log, runs the backfill state machine, decodes delivered
//! rows, and forwards batches onto the shared event channel.
//!
//! # Backfill lifecycle
//!
//! ```text
//! Pending ──subscribe──> Started ──caught-up──> Finished
//!                          │  ▲                    │
//!                        fail  └───resubscribe─────┘
//!                          ▼
//!                       Errored ──subscribe──> Started
//! ```
//!
//! Transitions are explicit; an invalid edge is a typed error, never a
//! silent state overwrite.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::{Batch, Priority};
use crate::channel::EventChannel;
use crate::errors::{SyncError, SyncResult};
use crate::event::{codec, Event, EventBody, SpaceInfo};
use crate::ids::{EventId, RoomId, StreamId, StreamIndex, UserId};
use crate::server::{
    Delivery, EventServer, ModuleDef, Row, StreamQuery, SubscriptionHandle,
};

/// Errors local to stream connection management
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid backfill transition from {from} to {input}")]
    InvalidTransition {
        from: &'static str,
        input: &'static str,
    },

    #[error("Stream is already subscribed")]
    AlreadySubscribed,
}

impl From<ConnectionError> for SyncError {
    fn from(err: ConnectionError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// What part of the stream this connection pins locally
///
/// Only whole-space pinning is currently supported; per-room pinning is
/// reserved for lazy room subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinState {
    /// Backfill the whole log
    Space,

    /// Reserved: backfill only the named rooms
    Rooms(Vec<RoomId>),
}

/// Phase of the backfill state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillPhase {
    Pending,
    Started,
    Finished,
    Errored(String),
}

/// Inputs that drive the backfill state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillInput {
    Subscribe,
    CaughtUp,
    Fail(String),
    Resubscribe,
}

impl BackfillPhase {
    fn name(&self) -> &'static str {
        match self {
            BackfillPhase::Pending => "pending",
            BackfillPhase::Started => "started",
            BackfillPhase::Finished => "finished",
            BackfillPhase::Errored(_) => "errored",
        }
    }

    /// Attempt a transition; invalid edges are typed errors
    pub fn transition(&self, input: &BackfillInput) -> Result<BackfillPhase, ConnectionError> {
        match (self, input) {
            (BackfillPhase::Pending, BackfillInput::Subscribe) => Ok(BackfillPhase::Started),
            (BackfillPhase::Errored(_), BackfillInput::Subscribe) => Ok(BackfillPhase::Started),
            (BackfillPhase::Started, BackfillInput::CaughtUp) => Ok(BackfillPhase::Finished),
            (BackfillPhase::Started, BackfillInput::Fail(message)) => {
                Ok(BackfillPhase::Errored(message.clone()))
            }
            (BackfillPhase::Finished, BackfillInput::Resubscribe) => Ok(BackfillPhase::Started),
            (from, input) => Err(ConnectionError::InvalidTransition {
                from: from.name(),
                input: match input {
                    BackfillInput::Subscribe => "subscribe",
                    BackfillInput::CaughtUp => "caught-up",
                    BackfillInput::Fail(_) => "fail",
                    BackfillInput::Resubscribe => "resubscribe",
                },
            }),
        }
    }
}

/// Observable backfill state: phase, highest forwarded index, priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillState {
    pub phase: BackfillPhase,
    pub cursor: StreamIndex,
    pub priority: Priority,
}

/// Tuning for one stream connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Learn the latest index through a metadata subscription first and
    /// open the full subscription from there (structure now, content on
    /// demand). An optimization, not a contract; the plain path is the
    /// default.
    pub metadata_first: bool,

    /// Advisory warning after this long without backfill progress
    pub stalled_warn_after: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            metadata_first: false,
            stalled_warn_after: Duration::from_secs(30),
        }
    }
}

/// One logical connection to a remote space stream
pub struct ConnectedStream {
    stream_id: StreamId,
    pin: PinState,
    server: Arc<dyn EventServer>,
    channel: EventChannel,
    priority: Priority,
    config: ConnectionConfig,
    backfill: watch::Sender<BackfillState>,
    subscription: Option<SubscriptionHandle>,
    forward_task: Option<JoinHandle<()>>,
    lazy_room_cursors: HashMap<RoomId, StreamIndex>,
}

impl std::fmt::Debug for ConnectedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedStream")
            .field("stream_id", &self.stream_id)
            .field("pin", &self.pin)
            .field("priority", &self.priority)
            .field("config", &self.config)
            .field("subscription", &self.subscription)
            .field("lazy_room_cursors", &self.lazy_room_cursors)
            .finish()
    }
}

impl ConnectedStream {
    /// Ensure the remote log exists and agrees on its module, then hold
    /// an unsubscribed connection to it.
    ///
    /// A module mismatch triggers a mandatory upgrade attempt; failure
    /// is tolerated (the user may lack admin rights on the stream). An
    /// unknown stream is a configuration error.
    pub async fn connect(
        server: Arc<dyn EventServer>,
        channel: EventChannel,
        stream_id: StreamId,
        expected_module: &str,
        priority: Priority,
        config: ConnectionConfig,
    ) -> SyncResult<Self> {
        match server.stream_info(&stream_id).await? {
            None => {
                return Err(SyncError::Configuration(format!(
                    "stream {stream_id} is unknown to the server"
                )))
            }
            Some(info) if info.module_cid != expected_module => {
                info!(
                    stream = %stream_id,
                    reported = %info.module_cid,
                    expected = expected_module,
                    "Stream module mismatch, attempting upgrade"
                );
                match server.update_module(&stream_id, expected_module).await {
                    Ok(()) => info!(stream = %stream_id, "Stream module upgraded"),
                    Err(e) => warn!(
                        stream = %stream_id,
                        error = %e,
                        "Module upgrade failed, continuing with reported module"
                    ),
                }
            }
            Some(_) => {}
        }

        let (backfill, _) = watch::channel(BackfillState {
            phase: BackfillPhase::Pending,
            cursor: StreamIndex::ZERO,
            priority,
        });

        Ok(Self {
            stream_id,
            pin: PinState::Space,
            server,
            channel,
            priority,
            config,
            backfill,
            subscription: None,
            forward_task: None,
            lazy_room_cursors: HashMap::new(),
        })
    }

    /// Create a new remote stream and send its mandatory initial
    /// administrative event
    pub async fn create(
        server: &Arc<dyn EventServer>,
        module: &ModuleDef,
        admin: &UserId,
        space_name: &str,
    ) -> SyncResult<StreamId> {
        if !server.has_module(&module.cid).await? {
            server.upload_module(module).await?;
        }
        let stream_id = server.create_stream(&module.cid).await?;

        let payload = codec::encode(
            EventId::generate(),
            None,
            &EventBody::SpaceInfo(SpaceInfo {
                name: space_name.to_string(),
                avatar: None,
                admin: admin.clone(),
            }),
        )?;
        server.send_event(&stream_id, payload.into()).await?;

        info!(stream = %stream_id, name = space_name, "Created stream");
        Ok(stream_id)
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn pin(&self) -> &PinState {
        &self.pin
    }

    /// Watch the backfill state machine
    pub fn backfill_watch(&self) -> watch::Receiver<BackfillState> {
        self.backfill.subscribe()
    }

    /// Current backfill state snapshot
    pub fn backfill(&self) -> BackfillState {
        self.backfill.borrow().clone()
    }

    /// Open the subscription, delivering rows from `start` onward.
    ///
    /// The subscription transitions from backfill to live tail
    /// implicitly once the server reports no more history.
    pub async fn subscribe(&mut self, start: StreamIndex) -> SyncResult<()> {
        if self.subscription.is_some() {
            return Err(ConnectionError::AlreadySubscribed.into());
        }

        let mut start = start;
        if self.config.metadata_first {
            if let Some(tail) = self.learn_tail(start).await? {
                debug!(stream = %self.stream_id, tail = %tail, "Learned tail via metadata");
                start = start.max(tail.next());
            }
        }

        let input = match self.backfill.borrow().phase {
            BackfillPhase::Finished => BackfillInput::Resubscribe,
            _ => BackfillInput::Subscribe,
        };
        self.apply_transition(&input)?;

        let (sink, deliveries) = mpsc::unbounded_channel();
        let handle = self
            .server
            .subscribe_events(&self.stream_id, StreamQuery::events_from(start), sink)
            .await
            .map_err(|e| {
                let _ = self.try_transition(&BackfillInput::Fail(e.to_string()));
                e
            })?;
        self.subscription = Some(handle);

        let task = forward_deliveries(ForwardTask {
            stream_id: self.stream_id.clone(),
            channel: self.channel.clone(),
            backfill: self.backfill.clone(),
            priority: self.priority,
            stalled_warn_after: self.config.stalled_warn_after,
            deliveries,
        });
        self.forward_task = Some(task);
        Ok(())
    }

    /// Secondary metadata subscription used to learn the latest index
    /// before the full subscription opens
    async fn learn_tail(&self, start: StreamIndex) -> SyncResult<Option<StreamIndex>> {
        let (sink, mut deliveries) = mpsc::unbounded_channel();
        let mut handle = self
            .server
            .subscribe_events(&self.stream_id, StreamQuery::metadata_from(start), sink)
            .await?;

        let mut tail = None;
        // The backfill ends with a has_more=false page; its tail field
        // is the index we came for.
        while let Some(delivery) = deliveries.recv().await {
            match delivery {
                Delivery::Page { page, .. } => {
                    tail = Some(page.tail);
                    if !page.has_more {
                        break;
                    }
                }
                Delivery::Error(message) => {
                    warn!(stream = %self.stream_id, message, "Metadata subscription failed");
                    break;
                }
                Delivery::Closed => break,
            }
        }
        handle.unsubscribe();
        Ok(tail)
    }

    /// Close the subscription and drop pending channel items for this
    /// stream. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(mut handle) = self.subscription.take() {
            handle.unsubscribe();
            info!(stream = %self.stream_id, "Unsubscribed");
        }
        if let Some(task) = self.forward_task.take() {
            // The server side has dropped its sink; the forward task
            // drains and exits on its own. Abort covers the case where
            // it is parked on a stalled-backfill timer.
            task.abort();
        }
        self.channel.drop_stream(&self.stream_id);
    }

    /// One-shot bounded window of a single room's events, most recent
    /// first
    pub async fn fetch_room(
        &self,
        room: RoomId,
        limit: usize,
        before: Option<StreamIndex>,
    ) -> SyncResult<Vec<Event>> {
        let rows = self
            .server
            .query(&self.stream_id, StreamQuery::room_window(&room, limit, before))
            .await?;
        Ok(decode_rows(&self.stream_id, rows))
    }

    /// Cached variant of [`ConnectedStream::fetch_room`]: tracks the
    /// lowest index already fetched per room and suppresses fetches for
    /// windows that are already covered
    pub async fn lazy_load_room(
        &mut self,
        room: RoomId,
        limit: usize,
        before: Option<StreamIndex>,
    ) -> SyncResult<Vec<Event>> {
        if let Some(covered_from) = self.lazy_room_cursors.get(&room) {
            let already_covered = match before {
                // Newest window was fetched before.
                None => true,
                Some(before) => before >= *covered_from,
            };
            if already_covered {
                debug!(stream = %self.stream_id, room = %room, "Room window already covered");
                return Ok(Vec::new());
            }
        }

        let events = self.fetch_room(room, limit, before).await?;
        if let Some(oldest) = events.iter().map(|e| e.stream_index).min() {
            let entry = self
                .lazy_room_cursors
                .entry(room)
                .or_insert(oldest);
            *entry = (*entry).min(oldest);
        } else if before.is_none() {
            // An empty newest window still counts as covered.
            self.lazy_room_cursors
                .entry(room)
                .or_insert(StreamIndex::ZERO);
        }
        Ok(events)
    }

    /// Append one event to the log. The server assigns the index; the
    /// live subscription echoes the event back, which is the only path
    /// by which sending affects local state.
    pub async fn send_event(
        &self,
        room: Option<RoomId>,
        body: &EventBody,
    ) -> SyncResult<EventId> {
        let id = EventId::generate();
        let payload = codec::encode(id, room, body)?;
        self.server.send_event(&self.stream_id, payload.into()).await?;
        Ok(id)
    }

    /// Append several events in order
    pub async fn send_events(
        &self,
        events: Vec<(Option<RoomId>, EventBody)>,
    ) -> SyncResult<Vec<EventId>> {
        let mut ids = Vec::with_capacity(events.len());
        let mut payloads = Vec::with_capacity(events.len());
        for (room, body) in &events {
            let id = EventId::generate();
            payloads.push(codec::encode(id, *room, body)?.into());
            ids.push(id);
        }
        self.server.send_events(&self.stream_id, payloads).await?;
        Ok(ids)
    }

    fn apply_transition(&self, input: &BackfillInput) -> Result<(), ConnectionError> {
        let next = self.backfill.borrow().phase.transition(input)?;
        self.backfill.send_modify(|state| state.phase = next);
        Ok(())
    }

    fn try_transition(&self, input: &BackfillInput) -> bool {
        self.apply_transition(input).is_ok()
    }
}

impl Drop for ConnectedStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn decode_rows(stream_id: &StreamId, rows: Vec<Row>) -> Vec<Event> {
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        match codec::decode(row.user, row.idx, &row.payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(stream = %stream_id, idx = %row.idx, error = %e, "Undecodable row skipped");
            }
        }
    }
    events
}

struct ForwardTask {
    stream_id: StreamId,
    channel: EventChannel,
    backfill: watch::Sender<BackfillState>,
    priority: Priority,
    stalled_warn_after: Duration,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Decode pages as they arrive and forward them onto the shared
/// channel, driving the backfill state machine along the way.
fn forward_deliveries(mut task: ForwardTask) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_forwarded = StreamIndex::ZERO;
        let mut warned_stall = false;

        loop {
            let backfilling =
                matches!(task.backfill.borrow().phase, BackfillPhase::Started);

            let delivery = if backfilling {
                match tokio::time::timeout(task.stalled_warn_after, task.deliveries.recv()).await
                {
                    Ok(delivery) => delivery,
                    Err(_) => {
                        if !warned_stall {
                            warn!(
                                stream = %task.stream_id,
                                stalled_for = ?task.stalled_warn_after,
                                "Backfill stalled"
                            );
                            warned_stall = true;
                        }
                        continue;
                    }
                }
            } else {
                task.deliveries.recv().await
            };

            match delivery {
                Some(Delivery::Page { page, meta }) => {
                    warned_stall = false;

                    let mut events = Vec::with_capacity(page.rows.len());
                    for row in page.rows {
                        // Dedup within one connection lifetime.
                        if row.idx <= last_forwarded {
                            continue;
                        }
                        match codec::decode(row.user, row.idx, &row.payload) {
                            Ok(event) => {
                                last_forwarded = last_forwarded.max(event.stream_index);
                                events.push(event);
                            }
                            Err(e) => {
                                warn!(
                                    stream = %task.stream_id,
                                    idx = %row.idx,
                                    error = %e,
                                    "Undecodable row skipped"
                                );
                            }
                        }
                    }

                    task.backfill
                        .send_modify(|state| state.cursor = last_forwarded);

                    if !events.is_empty() {
                        // Live pushes are foreground on any stream;
                        // backfill keeps the connection's own class.
                        let priority = if meta.is_backfill {
                            task.priority
                        } else {
                            Priority::Foreground
                        };
                        let batch = if meta.is_backfill {
                            Batch::Fetched {
                                batch_id: meta.batch_id,
                                stream_id: task.stream_id.clone(),
                                events,
                                priority,
                            }
                        } else {
                            Batch::Live {
                                batch_id: meta.batch_id,
                                stream_id: task.stream_id.clone(),
                                events,
                                priority,
                            }
                        };
                        task.channel.push(batch);
                    }

                    if meta.is_backfill && !page.has_more {
                        transition(&task.backfill, &task.stream_id, BackfillInput::CaughtUp);
                    }
                }
                Some(Delivery::Error(message)) => {
                    warn!(stream = %task.stream_id, message, "Subscription errored");
                    transition(&task.backfill, &task.stream_id, BackfillInput::Fail(message));
                    return;
                }
                Some(Delivery::Closed) | None => {
                    let phase = task.backfill.borrow().phase.clone();
                    if matches!(phase, BackfillPhase::Started) {
                        transition(
                            &task.backfill,
                            &task.stream_id,
                            BackfillInput::Fail("subscription closed before catch-up".to_string()),
                        );
                    } else {
                        debug!(stream = %task.stream_id, "Subscription closed");
                    }
                    return;
                }
            }
        }
    })
}

fn transition(
    backfill: &watch::Sender<BackfillState>,
    stream_id: &StreamId,
    input: BackfillInput,
) {
    let result = backfill.borrow().phase.transition(&input);
    match result {
        Ok(next) => backfill.send_modify(|state| state.phase = next),
        Err(e) => warn!(stream = %stream_id, error = %e, "Ignored backfill transition"),
    }
}
