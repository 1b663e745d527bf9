// Copyright (c) 2025 - Cowboy AI, Inc.
//! Personal-Stream Event Bodies
//!
//! A user's personal stream records their profile, the list of joined
//! spaces, and per-room read markers. It is a stream like any other but
//! is always connected first and backfilled at foreground priority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ValidationError;
use crate::ids::{RoomId, StreamId};

/// Update the user's own profile record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_line: Option<String>,
}

impl ProfileUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if matches!(&self.display_name, Some(n) if n.is_empty()) {
            return Err(ValidationError::EmptyField {
                field: "display_name",
            });
        }
        Ok(())
    }
}

/// Record membership of a space
///
/// On materialization the supervisor reacts by opening a stream
/// connection to the joined space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceJoin {
    /// Stream backing the joined space
    pub stream: StreamId,
}

impl SpaceJoin {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Record leaving a space
///
/// Materialized rows for the space are retained so history survives a
/// later re-join; only the membership row is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceLeave {
    /// Stream backing the left space
    pub stream: StreamId,
}

impl SpaceLeave {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Move the read marker for one room of one space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastReadSet {
    /// Space the marker belongs to
    pub stream: StreamId,

    /// Room within the space
    pub room: RoomId,

    /// Instant up to which the room is considered read
    pub at: DateTime<Utc>,
}

impl LastReadSet {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}
