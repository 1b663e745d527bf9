// Copyright (c) 2025 - Cowboy AI, Inc.
//! Client Supervisor
//!
//! One actor task owns the mutable client state — the session, the
//! personal stream, the map of connected space streams, and the
//! reactive status. Operations arrive as commands over a mailbox and
//! reply through oneshot channels, so no lock ever guards shared state.
//!
//! # Startup
//!
//! ```text
//! authenticate ─> ensure personal stream ─> foreground backfill
//!      │                (3 attempts)              │
//!      ▼                                          ▼
//! spawn materializer                    read joined spaces
//!                                                 │
//!                                                 ▼
//!                              background space connections ─> Connected
//! ```
//!
//! Join and leave are events on the personal stream; the supervisor
//! reacts to their materialization through a live query on the
//! membership table, which is also what re-opens connections after a
//! remote join from another device.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::batch::Priority;
use crate::channel::{ChannelConfig, EventChannel};
use crate::connection::{BackfillPhase, ConnectedStream, ConnectionConfig};
use crate::errors::{SyncError, SyncResult};
use crate::event::{Event, EventBody, SpaceJoin, SpaceLeave};
use crate::identity::{ProfileFetcher, ProfileRecordError, ProfileStore, Session};
use crate::ids::{EventId, RoomId, StreamId, StreamIndex, UserId};
use crate::materializer::{MaterializationReport, Materializer};
use crate::server::{EventServer, ModuleDef, ServerStatus};
use crate::store::{SqlValue, Store};

/// Session-table key holding the current user id
const SESSION_USER_KEY: &str = "user";

/// Reactive client status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    Initialising,
    Connected {
        personal: StreamId,
        streams: Vec<StreamId>,
    },
    Offline,
    Error(String),
}

/// Reconnection backoff tuning
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl BackoffConfig {
    fn next(&self, current: Duration) -> Duration {
        (current * self.multiplier).min(self.max)
    }
}

/// Top-level client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Module governing every stream this client creates or joins
    pub module: ModuleDef,
    pub connection: ConnectionConfig,
    pub backoff: BackoffConfig,
    pub channel: ChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            module: ModuleDef {
                cid: "space.chat.module.v0".to_string(),
                definition: serde_json::Value::Null,
            },
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

enum Command {
    SendEvent {
        stream: StreamId,
        room: Option<RoomId>,
        body: EventBody,
        reply: oneshot::Sender<SyncResult<EventId>>,
    },
    LazyLoadRoom {
        stream: StreamId,
        room: RoomId,
        limit: usize,
        before: Option<StreamIndex>,
        reply: oneshot::Sender<SyncResult<Vec<Event>>>,
    },
    Join {
        stream: StreamId,
        reply: oneshot::Sender<SyncResult<EventId>>,
    },
    Leave {
        stream: StreamId,
        reply: oneshot::Sender<SyncResult<EventId>>,
    },
    Logout {
        reply: oneshot::Sender<SyncResult<()>>,
    },
}

/// Handle to the supervisor actor
pub struct Client {
    user: UserId,
    personal: StreamId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ClientStatus>,
    reports: Option<mpsc::UnboundedReceiver<MaterializationReport>>,
}

impl Client {
    /// Run the startup sequence and spawn the supervisor actor
    pub async fn connect(
        session: Session,
        server: Arc<dyn EventServer>,
        store: Arc<dyn Store>,
        profiles: Arc<dyn ProfileFetcher>,
        profile_record: Arc<dyn ProfileStore>,
        config: ClientConfig,
    ) -> SyncResult<Client> {
        let (status_tx, status_rx) = watch::channel(ClientStatus::Initialising);

        // 1. Handshake; every send below is gated on this completing.
        let user = server.authenticate(Arc::clone(&session.tokens)).await?;
        if user != session.user {
            return Err(SyncError::Configuration(format!(
                "server attested {user} but session holds {}",
                session.user
            )));
        }
        store
            .session_put(SESSION_USER_KEY, user.as_str())
            .await
            .map_err(|e| SyncError::Configuration(e.to_string()))?;

        // 2. The pipeline: channel and its single consumer.
        let channel = EventChannel::new(config.channel.clone());
        let (materializer, reports) =
            Materializer::new(channel.clone(), Arc::clone(&store), profiles);
        materializer.spawn();

        // 3. Personal stream, created on first run, repaired if the
        // record points at a stream the server no longer has.
        let personal_id =
            ensure_personal_stream(&*profile_record, &server, &config.module, &user).await?;

        // 4. Foreground personal backfill, awaited before anything else.
        let mut personal = ConnectedStream::connect(
            Arc::clone(&server),
            channel.clone(),
            personal_id.clone(),
            &config.module.cid,
            Priority::Foreground,
            config.connection.clone(),
        )
        .await?;
        let cursor = store
            .cursor(&personal_id)
            .await
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        let mut backfill = personal.backfill_watch();
        personal.subscribe(cursor.next()).await?;
        let finished = backfill
            .wait_for(|state| {
                matches!(
                    state.phase,
                    BackfillPhase::Finished | BackfillPhase::Errored(_)
                )
            })
            .await
            .map_err(|_| SyncError::Transport("personal stream connection lost".to_string()))?
            .phase
            .clone();
        if let BackfillPhase::Errored(message) = finished {
            return Err(SyncError::Transport(format!(
                "personal stream backfill failed: {message}"
            )));
        }

        // Backfill completion is delivery-level; wait for the
        // materializer to commit what was delivered before reading the
        // membership list. The deadline is advisory: trailing stashed
        // events must not wedge startup.
        let delivered = personal.backfill().cursor;
        await_cursor(&store, &personal_id, delivered, config.connection.stalled_warn_after).await;

        // 5-6. Joined spaces from the store; connection failures are
        // tracked, never fatal to startup.
        let mut streams = HashMap::new();
        let mut failed = HashMap::new();
        let joined = store
            .joined_spaces(&user)
            .await
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        for stream_id in joined {
            match open_stream(
                &server,
                &channel,
                &store,
                &stream_id,
                &config,
            )
            .await
            {
                Ok(connection) => {
                    streams.insert(stream_id, connection);
                }
                Err(e) => {
                    warn!(stream = %stream_id, error = %e, "Space connection failed at startup");
                    failed.insert(stream_id, e.to_string());
                }
            }
        }

        // React to membership changes materialized from the personal
        // stream. Registered after the initial set is open, so the
        // first snapshot is a no-op diff.
        let joined_rows = store
            .register_live_query(
                "SELECT stream_id FROM joined_spaces WHERE user_id = ?1 ORDER BY stream_id",
                &[SqlValue::from(user.as_str())],
            )
            .await
            .map_err(|e| SyncError::Configuration(e.to_string()))?
            .rows;

        // 7. Reactive status flips once everything is connected.
        let _ = status_tx.send(ClientStatus::Connected {
            personal: personal_id.clone(),
            streams: streams.keys().cloned().collect(),
        });
        info!(user = %user, spaces = streams.len(), "Client connected");

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let actor = ClientActor {
            user: user.clone(),
            session,
            server_status: server.status(),
            server,
            store,
            channel,
            config,
            personal_id: personal_id.clone(),
            personal,
            streams,
            failed,
            status: status_tx,
            commands: commands_rx,
            joined_rows,
        };
        tokio::spawn(actor.run());

        Ok(Client {
            user,
            personal: personal_id,
            commands: commands_tx,
            status: status_rx,
            reports: Some(reports),
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The personal stream id this client bootstrapped from
    pub fn personal_stream(&self) -> &StreamId {
        &self.personal
    }

    /// Watch the reactive client status
    pub fn status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Take the materialization reporting channel (observability)
    pub fn take_reports(&mut self) -> Option<mpsc::UnboundedReceiver<MaterializationReport>> {
        self.reports.take()
    }

    /// Append an event to a connected stream
    pub async fn send_event(
        &self,
        stream: &StreamId,
        room: Option<RoomId>,
        body: EventBody,
    ) -> SyncResult<EventId> {
        self.request(|reply| Command::SendEvent {
            stream: stream.clone(),
            room,
            body,
            reply,
        })
        .await
    }

    /// On-demand scrollback for one room of one space
    pub async fn lazy_load_room(
        &self,
        stream: &StreamId,
        room: RoomId,
        limit: usize,
        before: Option<StreamIndex>,
    ) -> SyncResult<Vec<Event>> {
        self.request(|reply| Command::LazyLoadRoom {
            stream: stream.clone(),
            room,
            limit,
            before,
            reply,
        })
        .await
    }

    /// Join a space: records membership on the personal stream; the
    /// connection opens when the join materializes
    pub async fn join(&self, stream: &StreamId) -> SyncResult<EventId> {
        self.request(|reply| Command::Join {
            stream: stream.clone(),
            reply,
        })
        .await
    }

    /// Leave a space: membership row is removed, local history is
    /// retained
    pub async fn leave(&self, stream: &StreamId) -> SyncResult<EventId> {
        self.request(|reply| Command::Leave {
            stream: stream.clone(),
            reply,
        })
        .await
    }

    /// Close every connection and clear the persisted user id
    pub async fn logout(self) -> SyncResult<()> {
        self.request(|reply| Command::Logout { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> Command,
    ) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::Configuration("client supervisor stopped".to_string()))?;
        response
            .await
            .map_err(|_| SyncError::Configuration("client supervisor stopped".to_string()))?
    }
}

/// Ensure the personal stream exists and the profile record points at
/// it, repairing a dangling record, bounded to three attempts
async fn ensure_personal_stream(
    profile_record: &dyn ProfileStore,
    server: &Arc<dyn EventServer>,
    module: &ModuleDef,
    user: &UserId,
) -> SyncResult<StreamId> {
    const MAX_ATTEMPTS: u32 = 3;

    for attempt in 1..=MAX_ATTEMPTS {
        match profile_record.get().await {
            Ok(stream_id) => match server.stream_info(&stream_id).await? {
                Some(_) => {
                    debug!(stream = %stream_id, "Personal stream record verified");
                    return Ok(stream_id);
                }
                None => {
                    // Record points at a stream the server lost; delete
                    // and recreate on the next attempt.
                    warn!(
                        attempt,
                        stream = %stream_id,
                        "Personal stream missing on server, repairing record"
                    );
                    profile_record
                        .delete()
                        .await
                        .map_err(|e| SyncError::Configuration(e.to_string()))?;
                }
            },
            Err(ProfileRecordError::RecordNotFound) => {
                let stream_id =
                    ConnectedStream::create(server, module, user, "personal").await?;
                profile_record
                    .put(&stream_id)
                    .await
                    .map_err(|e| SyncError::Configuration(e.to_string()))?;
                info!(stream = %stream_id, "Personal stream created");
                return Ok(stream_id);
            }
            Err(e) => {
                warn!(attempt, error = %e, "Profile record read failed");
            }
        }
    }

    Err(SyncError::Configuration(format!(
        "personal stream could not be ensured after {MAX_ATTEMPTS} attempts"
    )))
}

/// Wait until a stream's committed cursor covers `target`, bounded by
/// an advisory deadline
async fn await_cursor(
    store: &Arc<dyn Store>,
    stream_id: &StreamId,
    target: StreamIndex,
    deadline: Duration,
) {
    let caught_up = tokio::time::timeout(deadline, async {
        loop {
            match store.cursor(stream_id).await {
                Ok(cursor) if cursor >= target => break,
                Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(e) => {
                    warn!(stream = %stream_id, error = %e, "Cursor read failed while waiting");
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }
    })
    .await;

    if caught_up.is_err() {
        warn!(
            stream = %stream_id,
            target = %target,
            "Materialization lagging behind delivered backfill, continuing"
        );
    }
}

async fn open_stream(
    server: &Arc<dyn EventServer>,
    channel: &EventChannel,
    store: &Arc<dyn Store>,
    stream_id: &StreamId,
    config: &ClientConfig,
) -> SyncResult<ConnectedStream> {
    let mut connection = ConnectedStream::connect(
        Arc::clone(server),
        channel.clone(),
        stream_id.clone(),
        &config.module.cid,
        Priority::Background,
        config.connection.clone(),
    )
    .await?;
    let cursor = store
        .cursor(stream_id)
        .await
        .map_err(|e| SyncError::Configuration(e.to_string()))?;
    connection.subscribe(cursor.next()).await?;
    Ok(connection)
}

struct ClientActor {
    user: UserId,
    session: Session,
    server: Arc<dyn EventServer>,
    server_status: watch::Receiver<ServerStatus>,
    store: Arc<dyn Store>,
    channel: EventChannel,
    config: ClientConfig,
    personal_id: StreamId,
    personal: ConnectedStream,
    streams: HashMap<StreamId, ConnectedStream>,
    failed: HashMap<StreamId, String>,
    status: watch::Sender<ClientStatus>,
    commands: mpsc::Receiver<Command>,
    joined_rows: mpsc::UnboundedReceiver<crate::store::QueryRows>,
}

impl ClientActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None => break,
                        Some(command) => {
                            if self.handle(command).await {
                                break;
                            }
                        }
                    }
                }
                changed = self.server_status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let disconnected =
                        *self.server_status.borrow_and_update() == ServerStatus::Disconnected;
                    if disconnected {
                        self.reconnect().await;
                    }
                }
                rows = self.joined_rows.recv() => {
                    match rows {
                        None => break,
                        Some(rows) => self.sync_joined(rows).await,
                    }
                }
            }
        }
        debug!("Client supervisor stopped");
    }

    /// Returns true when the actor should stop
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::SendEvent {
                stream,
                room,
                body,
                reply,
            } => {
                let _ = reply.send(self.send_on(&stream, room, &body).await);
            }
            Command::LazyLoadRoom {
                stream,
                room,
                limit,
                before,
                reply,
            } => {
                let result = match self.streams.get_mut(&stream) {
                    Some(connection) => connection.lazy_load_room(room, limit, before).await,
                    None => Err(SyncError::Configuration(format!(
                        "not connected to stream {stream}"
                    ))),
                };
                let _ = reply.send(result);
            }
            Command::Join { stream, reply } => {
                let body = EventBody::SpaceJoin(SpaceJoin { stream });
                let _ = reply.send(self.personal.send_event(None, &body).await);
            }
            Command::Leave { stream, reply } => {
                let body = EventBody::SpaceLeave(SpaceLeave { stream });
                let _ = reply.send(self.personal.send_event(None, &body).await);
            }
            Command::Logout { reply } => {
                let _ = reply.send(self.logout().await);
                return true;
            }
        }
        false
    }

    async fn send_on(
        &self,
        stream: &StreamId,
        room: Option<RoomId>,
        body: &EventBody,
    ) -> SyncResult<EventId> {
        if *stream == self.personal_id {
            return self.personal.send_event(room, body).await;
        }
        match self.streams.get(stream) {
            Some(connection) => connection.send_event(room, body).await,
            None => Err(SyncError::Configuration(format!(
                "not connected to stream {stream}"
            ))),
        }
    }

    /// Diff the materialized membership against open connections
    async fn sync_joined(&mut self, rows: crate::store::QueryRows) {
        let desired: Vec<StreamId> = rows
            .iter()
            .filter_map(|row| match row.first() {
                Some(SqlValue::Text(id)) => StreamId::new(id.clone()).ok(),
                _ => None,
            })
            .filter(|id| *id != self.personal_id)
            .collect();

        for stream_id in &desired {
            if self.streams.contains_key(stream_id) {
                continue;
            }
            match open_stream(&self.server, &self.channel, &self.store, stream_id, &self.config)
                .await
            {
                Ok(connection) => {
                    info!(stream = %stream_id, "Joined space connected");
                    self.failed.remove(stream_id);
                    self.streams.insert(stream_id.clone(), connection);
                }
                Err(e) => {
                    warn!(stream = %stream_id, error = %e, "Joined space connection failed");
                    self.failed.insert(stream_id.clone(), e.to_string());
                }
            }
        }

        let to_close: Vec<StreamId> = self
            .streams
            .keys()
            .filter(|id| !desired.contains(id))
            .cloned()
            .collect();
        for stream_id in to_close {
            if let Some(mut connection) = self.streams.remove(&stream_id) {
                connection.unsubscribe();
                info!(stream = %stream_id, "Left space, connection closed");
            }
        }

        self.publish_status();
    }

    /// Capped exponential backoff until the transport recovers, then
    /// resume every stream from its persisted cursor
    async fn reconnect(&mut self) {
        let _ = self.status.send(ClientStatus::Offline);
        warn!("Server disconnected, reconnecting with backoff");

        let mut delay = self.config.backoff.initial;
        loop {
            tokio::time::sleep(delay).await;
            match self
                .server
                .authenticate(Arc::clone(&self.session.tokens))
                .await
            {
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, next_delay = ?delay, "Reconnect attempt failed");
                    delay = self.config.backoff.next(delay);
                }
            }
        }

        if let Err(e) = self.resubscribe_all().await {
            error!(error = %e, "Resubscription after reconnect failed");
            let _ = self.status.send(ClientStatus::Error(e.to_string()));
            return;
        }
        info!("Reconnected, streams resumed from persisted cursors");
        self.publish_status();
    }

    async fn resubscribe_all(&mut self) -> SyncResult<()> {
        let cursor = self
            .store
            .cursor(&self.personal_id)
            .await
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        self.personal.unsubscribe();
        self.personal.subscribe(cursor.next()).await?;

        for (stream_id, connection) in &mut self.streams {
            let cursor = self
                .store
                .cursor(stream_id)
                .await
                .map_err(|e| SyncError::Configuration(e.to_string()))?;
            connection.unsubscribe();
            if let Err(e) = connection.subscribe(cursor.next()).await {
                warn!(stream = %stream_id, error = %e, "Stream resubscription failed");
                self.failed.insert(stream_id.clone(), e.to_string());
            }
        }
        Ok(())
    }

    fn publish_status(&self) {
        let _ = self.status.send(ClientStatus::Connected {
            personal: self.personal_id.clone(),
            streams: self.streams.keys().cloned().collect(),
        });
    }

    async fn logout(&mut self) -> SyncResult<()> {
        self.personal.unsubscribe();
        for (_, mut connection) in self.streams.drain() {
            connection.unsubscribe();
        }
        self.channel.close();
        self.store
            .session_delete(SESSION_USER_KEY)
            .await
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        let _ = self.status.send(ClientStatus::Initialising);
        info!(user = %self.user, "Logged out");
        Ok(())
    }
}
