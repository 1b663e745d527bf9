// Copyright (c) 2025 - Cowboy AI, Inc.
//! Space-Stream Event Bodies
//!
//! Events that live on a space's stream: chat messages and their
//! follow-ups, room structure, and the mandatory administrative space
//! info event.
//!
//! Messages are keyed by the event id of their `create` event; edits,
//! deletes, and reactions reference that id, which is also their causal
//! dependency.

use serde::{Deserialize, Serialize};

use super::ValidationError;
use crate::ids::{EventId, UserId};

/// A new chat message in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCreate {
    /// Message text
    pub content: String,

    /// Message this one replies to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EventId>,
}

impl MessageCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.is_empty() {
            return Err(ValidationError::EmptyField { field: "content" });
        }
        Ok(())
    }
}

/// Replace the content of an existing message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEdit {
    /// Event id of the message being edited
    pub target: EventId,

    /// Replacement text
    pub content: String,
}

impl MessageEdit {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.is_empty() {
            return Err(ValidationError::EmptyField { field: "content" });
        }
        Ok(())
    }
}

/// Tombstone an existing message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDelete {
    /// Event id of the message being deleted
    pub target: EventId,
}

impl MessageDelete {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Toggle a reaction on an existing message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReact {
    /// Event id of the message being reacted to
    pub target: EventId,

    /// Reaction key (an emoji or shortcode)
    pub key: String,
}

impl MessageReact {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.is_empty() {
            return Err(ValidationError::EmptyField { field: "key" });
        }
        Ok(())
    }
}

/// Move a message within its room's display order
///
/// Reordering is handled interactively by the view layer; in
/// materialization this event validates and then produces no mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReorder {
    /// Event id of the message being moved
    pub target: EventId,

    /// Message it should follow, or none for the top of the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<EventId>,
}

impl MessageReorder {
    pub fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Create a room within the space
///
/// The room id is carried in the event envelope's `room` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCreate {
    /// Display name
    pub name: String,

    /// Optional topic line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl RoomCreate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyField { field: "name" });
        }
        Ok(())
    }
}

/// Patch a room's name, topic, or archival flag
///
/// Applied as a keyed update; patching a room that has not materialized
/// yet is a no-op rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl RoomUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_none() && self.topic.is_none() && self.archived.is_none() {
            return Err(ValidationError::InvalidField {
                field: "name",
                reason: "room update must change at least one field".to_string(),
            });
        }
        if matches!(&self.name, Some(n) if n.is_empty()) {
            return Err(ValidationError::EmptyField { field: "name" });
        }
        Ok(())
    }
}

/// Mandatory initial administrative event on every space stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceInfo {
    /// Space display name
    pub name: String,

    /// Optional avatar reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,

    /// User holding admin rights over the stream
    pub admin: UserId,
}

impl SpaceInfo {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyField { field: "name" });
        }
        Ok(())
    }
}
