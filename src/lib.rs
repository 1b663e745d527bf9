//! Client-side event stream synchronization and materialization core
//! for federated spaces.
//!
//! Each user authenticates against an identity service and connects to
//! a remote append-only event server hosting many independent streams
//! (*spaces*). This crate subscribes to a set of streams, backfills
//! their history, receives live updates, and materializes every event
//! into a local relational store that drives live queries.
//!
//! # Architecture
//!
//! ```text
//! remote subscription ─> ConnectedStream ─> EventChannel ─> Materializer
//!                                                               │
//!                                  Schema Registry transform ───┤
//!                                                               ▼
//!                                        Store mutation ─> cursor update
//!                                                               │
//!                                                               ▼
//!                                                  live-query notification
//! ```
//!
//! # Modules
//!
//! - [`ids`] - identifier value objects
//! - [`event`] - event model and wire codec
//! - [`registry`] - closed schema registry (validate, dependencies,
//!   pure transforms)
//! - [`batch`] - typed pipeline stages
//! - [`channel`] - two-class priority mailbox
//! - [`connection`] - per-space stream connection and backfill
//! - [`materializer`] - single-consumer apply loop with causal stash
//! - [`store`] - local store seam and SQLite adapter
//! - [`server`] - remote server contract, NATS adapter, memory double
//! - [`identity`] - session and profile record contracts
//! - [`client`] - supervisor actor
//! - [`errors`] - error taxonomy
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidemark::{
//!     Client, ClientConfig, InMemoryProfileFetcher, InMemoryProfileStore, NatsEventServer,
//!     NatsServerConfig, Session, SqliteStore, StaticTokenProvider, UserId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = NatsEventServer::connect(NatsServerConfig::default()).await?;
//!     let store = SqliteStore::open_in_memory()?;
//!     let session = Session::new(
//!         UserId::new("did:plc:me")?,
//!         Arc::new(StaticTokenProvider::new("app-password-token")),
//!     );
//!
//!     let client = Client::connect(
//!         session,
//!         Arc::new(server),
//!         Arc::new(store),
//!         Arc::new(InMemoryProfileFetcher::new()),
//!         Arc::new(InMemoryProfileStore::new()),
//!         ClientConfig::default(),
//!     )
//!     .await?;
//!
//!     println!("connected as {}", client.user());
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod channel;
pub mod client;
pub mod connection;
pub mod errors;
pub mod event;
pub mod identity;
pub mod ids;
pub mod materializer;
pub mod registry;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use batch::{ApplyResult, Batch, Bundle, Disposition, Priority};
pub use channel::{ChannelConfig, EventChannel};
pub use client::{BackoffConfig, Client, ClientConfig, ClientStatus};
pub use connection::{
    BackfillPhase, BackfillState, ConnectedStream, ConnectionConfig, PinState,
};
pub use errors::{SyncError, SyncResult};
pub use event::{
    codec::DecodeError, Event, EventBody, LastReadSet, MessageCreate, MessageDelete, MessageEdit,
    MessageReact, MessageReorder, ProfileUpdate, RoomCreate, RoomUpdate, SpaceInfo, SpaceJoin,
    SpaceLeave, ValidationError,
};
pub use identity::{
    FetchedProfile, IdentityProvider, InMemoryProfileFetcher, InMemoryProfileStore,
    ProfileFetcher, ProfileRecordError, ProfileStore, Session, StaticTokenProvider,
    TokenProvider,
};
pub use ids::{BatchId, EventId, RoomId, StreamId, StreamIndex, UserId};
pub use materializer::{
    MaterializationReport, MaterializationSummary, MaterializationWarnings, Materializer,
};
pub use server::{
    DeliveryMeta, EventPage, EventServer, MemoryEventServer, ModuleDef, NatsEventServer,
    NatsServerConfig, Row, ServerConfig, ServerStatus, StreamInfo, StreamQuery,
    SubscriptionHandle,
};
pub use store::{Mutation, SqlValue, SqliteStore, Store, StoreError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
