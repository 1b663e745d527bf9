// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Model
//!
//! Events are immutable records authored by a user and accepted by the
//! remote stream server. Every event carries a sortable [`EventId`], an
//! optional [`RoomId`], the authoring [`UserId`] (attested by the
//! server), the server-assigned [`StreamIndex`], and a type-specific
//! body.
//!
//! The body is a closed sum over all recognized types plus an explicit
//! [`EventBody::Unknown`] variant holding the original payload bytes, so
//! forward-compatible readers can skip types they do not understand
//! without losing them on re-encode.
//!
//! # Module Organization
//!
//! - [`codec`] - wire encoding and decoding of tagged payloads
//! - [`space`] - space-stream event bodies (messages, rooms, space info)
//! - [`personal`] - personal-stream event bodies (membership, markers)

pub mod codec;
pub mod personal;
pub mod space;

use bytes::Bytes;
use thiserror::Error;

use crate::ids::{EventId, RoomId, StreamIndex, UserId};

pub use personal::{LastReadSet, ProfileUpdate, SpaceJoin, SpaceLeave};
pub use space::{
    MessageCreate, MessageDelete, MessageEdit, MessageReact, MessageReorder, RoomCreate,
    RoomUpdate, SpaceInfo,
};

/// Namespaced type tags for the closed event set
///
/// The version suffix is part of the tag; a schema change mints a new
/// tag rather than mutating an existing one.
pub mod tags {
    pub const MESSAGE_CREATE: &str = "space.chat.message.create.v0";
    pub const MESSAGE_EDIT: &str = "space.chat.message.edit.v0";
    pub const MESSAGE_DELETE: &str = "space.chat.message.delete.v0";
    pub const MESSAGE_REACT: &str = "space.chat.message.react.v0";
    pub const MESSAGE_REORDER: &str = "space.chat.message.reorder.v0";
    pub const ROOM_CREATE: &str = "space.chat.room.create.v0";
    pub const ROOM_UPDATE: &str = "space.chat.room.update.v0";
    pub const SPACE_INFO: &str = "space.chat.space.info.v0";
    pub const PROFILE_UPDATE: &str = "user.profile.update.v0";
    pub const SPACE_JOIN: &str = "user.space.join.v0";
    pub const SPACE_LEAVE: &str = "user.space.leave.v0";
    pub const LAST_READ: &str = "user.room.lastRead.v0";
}

/// A single event as it flows through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Globally unique, sortable identifier
    pub id: EventId,

    /// Room this event belongs to, if any
    pub room: Option<RoomId>,

    /// Authoring user, attested by the server envelope
    pub user: UserId,

    /// Position in the stream, assigned by the server on ingest
    pub stream_index: StreamIndex,

    /// Type-specific body
    pub body: EventBody,
}

impl Event {
    /// The namespaced type tag of this event's body
    pub fn type_tag(&self) -> &str {
        self.body.type_tag()
    }
}

/// Closed sum over all recognized event types
///
/// Unrecognized tags are preserved as opaque bytes in
/// [`EventBody::Unknown`]; the materializer drops them with a warning
/// while still advancing the stream cursor past their index.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    MessageCreate(MessageCreate),
    MessageEdit(MessageEdit),
    MessageDelete(MessageDelete),
    MessageReact(MessageReact),
    MessageReorder(MessageReorder),
    RoomCreate(RoomCreate),
    RoomUpdate(RoomUpdate),
    SpaceInfo(SpaceInfo),
    ProfileUpdate(ProfileUpdate),
    SpaceJoin(SpaceJoin),
    SpaceLeave(SpaceLeave),
    LastReadSet(LastReadSet),

    /// Forward-compatibility escape hatch: the tag was not recognized,
    /// the original payload bytes are preserved untouched.
    Unknown { type_tag: String, raw: Bytes },
}

impl EventBody {
    /// The namespaced type tag for this body
    pub fn type_tag(&self) -> &str {
        match self {
            EventBody::MessageCreate(_) => tags::MESSAGE_CREATE,
            EventBody::MessageEdit(_) => tags::MESSAGE_EDIT,
            EventBody::MessageDelete(_) => tags::MESSAGE_DELETE,
            EventBody::MessageReact(_) => tags::MESSAGE_REACT,
            EventBody::MessageReorder(_) => tags::MESSAGE_REORDER,
            EventBody::RoomCreate(_) => tags::ROOM_CREATE,
            EventBody::RoomUpdate(_) => tags::ROOM_UPDATE,
            EventBody::SpaceInfo(_) => tags::SPACE_INFO,
            EventBody::ProfileUpdate(_) => tags::PROFILE_UPDATE,
            EventBody::SpaceJoin(_) => tags::SPACE_JOIN,
            EventBody::SpaceLeave(_) => tags::SPACE_LEAVE,
            EventBody::LastReadSet(_) => tags::LAST_READ,
            EventBody::Unknown { type_tag, .. } => type_tag,
        }
    }

    /// Whether this event shapes the structure of a space rather than
    /// its content. Structural events are what a metadata subscription
    /// projects.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EventBody::RoomCreate(_) | EventBody::RoomUpdate(_) | EventBody::SpaceInfo(_)
        )
    }
}

/// Event payload does not match the declared shape for its type
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field '{field}' must not be empty")]
    EmptyField { field: &'static str },

    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
