// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS JetStream Event Server Adapter
//!
//! Backs the [`EventServer`] contract with NATS JetStream. Each space
//! stream maps to one JetStream stream whose server-assigned sequence
//! numbers realize [`StreamIndex`]; `DeliverPolicy::ByStartSequence`
//! realizes "subscribe from cursor".
//!
//! # Subject Layout
//!
//! ```text
//! {prefix}.auth                  auth handshake (request-reply)
//! {prefix}.modules.has           module registry RPCs
//! {prefix}.modules.upload
//! {prefix}.modules.update
//! {prefix}.{stream}.events       the stream's event subject
//! ```
//!
//! The authoring user is attested per message in the `X-Spaces-User`
//! header, set server-side on ingest.

use async_nats::jetstream::{self, consumer, stream::Stream as JsStream};
use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::errors::{SyncError, SyncResult};
use crate::event::tags;
use crate::identity::TokenProvider;
use crate::ids::{BatchId, StreamId, StreamIndex, UserId};

use super::{
    Delivery, DeliveryMeta, DeliverySink, EventPage, EventServer, ModuleDef, Row, ServerStatus,
    StreamInfo, StreamQuery, SubscriptionHandle,
};

/// Header carrying the server-attested author of each event
pub const USER_HEADER: &str = "X-Spaces-User";

/// Configuration for the NATS-backed event server
#[derive(Debug, Clone)]
pub struct NatsServerConfig {
    /// NATS server URLs
    pub servers: Vec<String>,

    /// Client name
    pub name: String,

    /// Root of the subject hierarchy
    pub subject_prefix: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Deadline for each RPC
    pub request_timeout: Duration,

    /// Rows per backfill page
    pub page_size: usize,
}

impl Default for NatsServerConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "tidemark-client".to_string(),
            subject_prefix: "spaces".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            page_size: 500,
        }
    }
}

impl NatsServerConfig {
    fn auth_subject(&self) -> String {
        format!("{}.auth", self.subject_prefix)
    }

    fn module_subject(&self, op: &str) -> String {
        format!("{}.modules.{op}", self.subject_prefix)
    }

    fn events_subject(&self, stream: &StreamId) -> String {
        format!("{}.{stream}.events", self.subject_prefix)
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    did: String,
}

#[derive(Serialize)]
struct ModuleRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    definition: Option<&'a serde_json::Value>,
}

#[derive(Deserialize)]
struct ModuleResponse {
    ok: bool,
    #[serde(default)]
    cid: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// NATS JetStream implementation of the [`EventServer`] contract
pub struct NatsEventServer {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsServerConfig,
    status: watch::Sender<ServerStatus>,
    authenticated: Mutex<Option<UserId>>,
}

impl NatsEventServer {
    /// Connect to NATS with the given configuration
    pub async fn connect(config: NatsServerConfig) -> SyncResult<Self> {
        let (status, _) = watch::channel(ServerStatus::Connecting);
        let events = status.clone();

        let connect_options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout))
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    if let async_nats::Event::Disconnected = event {
                        let _ = events.send(ServerStatus::Disconnected);
                    }
                }
            });

        let client = async_nats::connect_with_options(config.servers.join(","), connect_options)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        info!(servers = ?config.servers, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            config,
            status,
            authenticated: Mutex::new(None),
        })
    }

    async fn request<T, R>(&self, subject: String, request: &T) -> SyncResult<R>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let payload = serde_json::to_vec(request)?;
        let response = timeout(
            self.config.request_timeout,
            self.client.request(subject, payload.into()),
        )
        .await?
        .map_err(|e| SyncError::Transport(e.to_string()))?;

        serde_json::from_slice(&response.payload)
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    async fn module_rpc(&self, op: &str, request: ModuleRequest<'_>) -> SyncResult<ModuleResponse> {
        let response: ModuleResponse =
            self.request(self.config.module_subject(op), &request).await?;
        Ok(response)
    }

    async fn get_stream(&self, stream: &StreamId) -> SyncResult<Option<JsStream>> {
        match self.jetstream.get_stream(stream.as_str()).await {
            Ok(stream) => Ok(Some(stream)),
            Err(e) => {
                // JetStream lookup failures do not distinguish
                // "missing" from transient faults; callers bound their
                // retries, so a miss here is reported as unknown.
                debug!(stream = %stream, error = %e, "Stream lookup failed");
                Ok(None)
            }
        }
    }
}

fn row_of(message: &jetstream::Message) -> Option<Row> {
    let info = match message.info() {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "Message without JetStream info, skipping");
            return None;
        }
    };
    let user = message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(USER_HEADER))
        .map(|value| value.to_string());
    let Some(user) = user.and_then(|u| UserId::new(u).ok()) else {
        warn!(
            sequence = info.stream_sequence,
            "Message without attested user header, skipping"
        );
        return None;
    };

    Some(Row {
        idx: StreamIndex::new(info.stream_sequence),
        user,
        payload: message.payload.clone(),
    })
}

fn structural_payload(payload: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return false;
    };
    matches!(
        value.get("type").and_then(serde_json::Value::as_str),
        Some(tags::ROOM_CREATE) | Some(tags::ROOM_UPDATE) | Some(tags::SPACE_INFO)
    )
}

#[async_trait]
impl EventServer for NatsEventServer {
    async fn authenticate(&self, tokens: Arc<dyn TokenProvider>) -> SyncResult<UserId> {
        let token = tokens.token().await?;
        let response: AuthResponse = self
            .request(self.config.auth_subject(), &AuthRequest { token: &token })
            .await?;
        let user = UserId::new(response.did).map_err(|e| SyncError::Protocol(e.to_string()))?;

        {
            let mut authenticated = self.authenticated.lock().await;
            *authenticated = Some(user.clone());
        }
        let _ = self.status.send(ServerStatus::Authenticated {
            user: user.clone(),
        });
        info!(user = %user, "Authenticated with event server");
        Ok(user)
    }

    fn status(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    async fn create_stream(&self, module_cid: &str) -> SyncResult<StreamId> {
        let id = StreamId::new(format!("space-{}", Ulid::new().to_string().to_lowercase()))
            .map_err(|e| SyncError::Protocol(e.to_string()))?;

        let stream_config = jetstream::stream::Config {
            name: id.to_string(),
            subjects: vec![self.config.events_subject(&id)],
            description: Some(module_cid.to_string()),
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        info!(stream = %id, module = module_cid, "Created stream");
        Ok(id)
    }

    async fn stream_info(&self, stream: &StreamId) -> SyncResult<Option<StreamInfo>> {
        let Some(mut js_stream) = self.get_stream(stream).await? else {
            return Ok(None);
        };
        let info = js_stream
            .info()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Some(StreamInfo {
            module_cid: info.config.description.clone().unwrap_or_default(),
        }))
    }

    async fn has_module(&self, cid: &str) -> SyncResult<bool> {
        let response = self
            .module_rpc(
                "has",
                ModuleRequest {
                    stream: None,
                    cid: Some(cid),
                    definition: None,
                },
            )
            .await?;
        Ok(response.ok)
    }

    async fn upload_module(&self, def: &ModuleDef) -> SyncResult<String> {
        let response = self
            .module_rpc(
                "upload",
                ModuleRequest {
                    stream: None,
                    cid: Some(&def.cid),
                    definition: Some(&def.definition),
                },
            )
            .await?;
        match (response.ok, response.cid) {
            (true, Some(cid)) => Ok(cid),
            _ => Err(SyncError::Protocol(
                response
                    .error
                    .unwrap_or_else(|| "module upload rejected".to_string()),
            )),
        }
    }

    async fn update_module(&self, stream: &StreamId, cid: &str) -> SyncResult<()> {
        let response = self
            .module_rpc(
                "update",
                ModuleRequest {
                    stream: Some(stream.as_str()),
                    cid: Some(cid),
                    definition: None,
                },
            )
            .await?;
        if response.ok {
            Ok(())
        } else {
            Err(SyncError::Protocol(response.error.unwrap_or_else(|| {
                format!("module update rejected for {stream}")
            })))
        }
    }

    async fn subscribe_events(
        &self,
        stream_id: &StreamId,
        query: StreamQuery,
        sink: DeliverySink,
    ) -> SyncResult<SubscriptionHandle> {
        let Some(mut js_stream) = self.get_stream(stream_id).await? else {
            return Err(SyncError::Protocol(format!("unknown stream {stream_id}")));
        };
        let tail = StreamIndex::new(
            js_stream
                .info()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?
                .state
                .last_sequence,
        );

        let metadata_only = query.name == "metadata";
        let page_size = self.config.page_size.max(1);
        let start = query.start.max(StreamIndex::new(1));

        let deliver_policy = if start.value() <= 1 {
            consumer::DeliverPolicy::All
        } else {
            consumer::DeliverPolicy::ByStartSequence {
                start_sequence: start.value(),
            }
        };

        let consumer = js_stream
            .create_consumer(consumer::pull::Config {
                deliver_policy,
                ack_policy: consumer::AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let stream_id = stream_id.clone();
        let task = tokio::spawn(async move {
            let mut messages = match consumer.messages().await {
                Ok(messages) => messages,
                Err(e) => {
                    let _ = sink.send(Delivery::Error(e.to_string()));
                    return;
                }
            };

            let mut backfilling = start <= tail && tail > StreamIndex::ZERO;
            let mut buffer: Vec<Row> = Vec::new();

            let flush = |sink: &DeliverySink,
                         stream_id: &StreamId,
                         rows: Vec<Row>,
                         has_more: bool,
                         is_backfill: bool| {
                sink.send(Delivery::Page {
                    page: EventPage {
                        rows,
                        has_more,
                        tail,
                    },
                    meta: DeliveryMeta {
                        batch_id: BatchId::generate(),
                        stream_id: stream_id.clone(),
                        is_backfill,
                    },
                })
                .is_ok()
            };

            if !backfilling {
                // No history past the cursor: report tail-caught-up
                // immediately so the backfill state machine finishes.
                if !flush(&sink, &stream_id, Vec::new(), false, true) {
                    return;
                }
            }

            loop {
                match messages.next().await {
                    Some(Ok(message)) => {
                        let Some(row) = row_of(&message) else {
                            continue;
                        };
                        let seq = row.idx;
                        let keep = !metadata_only || structural_payload(&row.payload);

                        if backfilling {
                            if keep {
                                buffer.push(row);
                            }
                            if seq >= tail {
                                backfilling = false;
                                if !flush(&sink, &stream_id, std::mem::take(&mut buffer), false, true)
                                {
                                    return;
                                }
                            } else if buffer.len() >= page_size
                                && !flush(&sink, &stream_id, std::mem::take(&mut buffer), true, true)
                            {
                                return;
                            }
                        } else if keep
                            && !flush(&sink, &stream_id, vec![row], false, false)
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(stream = %stream_id, error = %e, "Subscription transport error");
                        let _ = sink.send(Delivery::Error(e.to_string()));
                        return;
                    }
                    None => {
                        let _ = sink.send(Delivery::Closed);
                        return;
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(move || {
            task.abort();
        }))
    }

    async fn query(&self, stream_id: &StreamId, query: StreamQuery) -> SyncResult<Vec<Row>> {
        let Some(mut js_stream) = self.get_stream(stream_id).await? else {
            return Err(SyncError::Protocol(format!("unknown stream {stream_id}")));
        };
        let tail = js_stream
            .info()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?
            .state
            .last_sequence;

        let consumer = js_stream
            .create_consumer(consumer::pull::Config {
                deliver_policy: if query.start.value() <= 1 {
                    consumer::DeliverPolicy::All
                } else {
                    consumer::DeliverPolicy::ByStartSequence {
                        start_sequence: query.start.value(),
                    }
                },
                ack_policy: consumer::AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        // JetStream has no payload-level filtering; scan and filter
        // client-side up to the tail recorded at call time.
        let mut rows = Vec::new();
        if tail >= query.start.value().max(1) {
            let mut messages = consumer
                .messages()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            while let Some(message) = timeout(self.config.request_timeout, messages.next())
                .await
                .map_err(SyncError::from)?
            {
                let message = message.map_err(|e| SyncError::Transport(e.to_string()))?;
                let Some(row) = row_of(&message) else {
                    continue;
                };
                let seq = row.idx.value();
                rows.push(row);
                if seq >= tail {
                    break;
                }
            }
        }

        match query.name.as_str() {
            "events" => Ok(rows),
            "room" => {
                let room = query
                    .params
                    .get("room")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        SyncError::Protocol("room query requires a room param".to_string())
                    })?;
                let before = query
                    .params
                    .get("before")
                    .and_then(serde_json::Value::as_u64)
                    .map(StreamIndex::new);

                let mut rows: Vec<Row> = rows
                    .into_iter()
                    .filter(|row| {
                        serde_json::from_slice::<serde_json::Value>(&row.payload)
                            .ok()
                            .and_then(|v| v.get("room").and_then(|r| r.as_str().map(str::to_string)))
                            .as_deref()
                            == Some(room.as_str())
                    })
                    .filter(|row| before.map(|b| row.idx < b).unwrap_or(true))
                    .collect();
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
        let user = {
            let authenticated = self.authenticated.lock().await;
            authenticated
                .clone()
                .ok_or_else(|| SyncError::Transport("not authenticated".to_string()))?
        };

        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, user.as_str());

        let ack = timeout(
            self.config.request_timeout,
            self.jetstream.publish_with_headers(
                self.config.events_subject(stream_id),
                headers,
                payload,
            ),
        )
        .await?
        .map_err(|e| SyncError::Transport(e.to_string()))?;

        timeout(self.config.request_timeout, ack)
            .await?
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn send_events(&self, stream_id: &StreamId, payloads: Vec<Bytes>) -> SyncResult<()> {
        for payload in payloads {
            self.send_event(stream_id, payload).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsServerConfig::default();
        assert_eq!(config.subject_prefix, "spaces");
        assert_eq!(config.page_size, 500);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_subject_layout() {
        let config = NatsServerConfig::default();
        let stream = StreamId::new("space-01h2xcejqtf2nbrexx3vqjhp41").unwrap();
        assert_eq!(config.auth_subject(), "spaces.auth");
        assert_eq!(config.module_subject("update"), "spaces.modules.update");
        assert_eq!(
            config.events_subject(&stream),
            "spaces.space-01h2xcejqtf2nbrexx3vqjhp41.events"
        );
    }

    #[test]
    fn test_structural_payload_detection() {
        let structural =
            br#"{"id":"01H2XCEJQTF2NBREXX3VQJHP41","type":"space.chat.room.create.v0"}"#;
        let content =
            br#"{"id":"01H2XCEJQTF2NBREXX3VQJHP41","type":"space.chat.message.create.v0"}"#;
        assert!(structural_payload(structural));
        assert!(!structural_payload(content));
        assert!(!structural_payload(b"not json"));
    }
}
