// Copyright (c) 2025 - Cowboy AI, Inc.
//! Identity and Session Contracts
//!
//! The identity provider, the per-user profile record, and the profile
//! directory are collaborators of the core, not part of it. This module
//! defines their seams and ships deterministic in-memory
//! implementations for tests and offline use.
//!
//! The profile record stores the user's personal stream id under a
//! stable key. Its failure modes are typed — the ensure/repair logic in
//! the supervisor branches on variants, never on message substrings.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::{SyncError, SyncResult};
use crate::ids::{StreamId, UserId};

/// Yields signed tokens for the remote server handshake
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid signed token
    async fn token(&self) -> SyncResult<String>;
}

/// Fixed-token provider for app-password and test flows
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> SyncResult<String> {
        Ok(self.token.clone())
    }
}

/// An authenticated user session
///
/// Produced by the identity provider (OAuth restoration, interactive
/// login, or app-password for tests); consumed by the supervisor.
#[derive(Clone)]
pub struct Session {
    /// Stable identifier of the authenticated user
    pub user: UserId,

    /// Process-local session identifier, time-ordered
    pub session_id: Uuid,

    /// Token factory for the server handshake
    pub tokens: Arc<dyn TokenProvider>,
}

impl Session {
    pub fn new(user: UserId, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            user,
            session_id: Uuid::now_v7(),
            tokens,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Hand-off seam to the identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Begin interactive login; returns the URL to hand to the user
    async fn login(&self, handle: &str) -> SyncResult<String>;

    /// Complete interactive login with the provider's callback params
    async fn callback(&self, params: &str) -> SyncResult<Session>;

    /// Non-interactive app-password flow, used by tests
    async fn app_password(&self, handle: &str, secret: &str) -> SyncResult<Session>;
}

/// Errors from the per-user profile record
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileRecordError {
    /// No record stored under the personal-stream key
    #[error("Profile record not found")]
    RecordNotFound,

    /// The record service is unreachable
    #[error("Profile record transport error: {0}")]
    Transport(String),

    /// The stored value is not a usable stream id
    #[error("Profile record is malformed: {0}")]
    Malformed(String),
}

/// The per-user profile record holding the personal stream id
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Read the personal stream id
    async fn get(&self) -> Result<StreamId, ProfileRecordError>;

    /// Write the personal stream id
    async fn put(&self, id: &StreamId) -> Result<(), ProfileRecordError>;

    /// Delete the record (repair path and logout)
    async fn delete(&self) -> Result<(), ProfileRecordError>;
}

/// A profile record fetched out-of-band from the identity directory
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedProfile {
    pub user: UserId,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

/// Batched out-of-band profile lookup
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Fetch profile records for a deduplicated set of users.
    ///
    /// Unknown users are simply absent from the result; only transport
    /// failures are errors.
    async fn fetch(&self, users: &[UserId]) -> SyncResult<Vec<FetchedProfile>>;
}

// ---------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------

/// In-memory profile record for tests and offline use
#[derive(Default)]
pub struct InMemoryProfileStore {
    record: Mutex<Option<StreamId>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the record, as if a previous run had written it
    pub fn with_record(id: StreamId) -> Self {
        Self {
            record: Mutex::new(Some(id)),
        }
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self) -> Result<StreamId, ProfileRecordError> {
        let record = self
            .record
            .lock()
            .map_err(|_| ProfileRecordError::Transport("record lock poisoned".to_string()))?;
        record.clone().ok_or(ProfileRecordError::RecordNotFound)
    }

    async fn put(&self, id: &StreamId) -> Result<(), ProfileRecordError> {
        let mut record = self
            .record
            .lock()
            .map_err(|_| ProfileRecordError::Transport("record lock poisoned".to_string()))?;
        *record = Some(id.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<(), ProfileRecordError> {
        let mut record = self
            .record
            .lock()
            .map_err(|_| ProfileRecordError::Transport("record lock poisoned".to_string()))?;
        *record = None;
        Ok(())
    }
}

/// In-memory profile directory for tests and offline use
#[derive(Default)]
pub struct InMemoryProfileFetcher {
    profiles: Mutex<HashMap<UserId, FetchedProfile>>,
    fail: Mutex<bool>,
}

impl InMemoryProfileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a known profile
    pub fn insert(&self, profile: FetchedProfile) {
        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.insert(profile.user.clone(), profile);
        }
    }

    /// Make subsequent fetches fail with a transport error
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut fail) = self.fail.lock() {
            *fail = failing;
        }
    }
}

#[async_trait]
impl ProfileFetcher for InMemoryProfileFetcher {
    async fn fetch(&self, users: &[UserId]) -> SyncResult<Vec<FetchedProfile>> {
        if self.fail.lock().map(|f| *f).unwrap_or(false) {
            return Err(SyncError::Transport(
                "profile directory unavailable".to_string(),
            ));
        }
        let profiles = self
            .profiles
            .lock()
            .map_err(|_| SyncError::Transport("profile lock poisoned".to_string()))?;
        Ok(users
            .iter()
            .filter_map(|user| profiles.get(user).cloned())
            .collect())
    }
}
