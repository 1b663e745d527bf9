// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Schema Registry
//!
//! The closed table mapping every recognized event type tag to its
//! validator, its causal-dependency function, its pure transform, and
//! its out-of-band profile requirements. Adding an event type is a
//! local change to this module; the rest of the pipeline is agnostic
//! to individual types.
//!
//! # Purity
//!
//! Transforms are pure functions from `(context, event)` to a list of
//! [`Mutation`] values. They never perform I/O and never suspend.
//! Timestamps in mutations derive from the millisecond clock embedded
//! in the event id, so the same event always produces the same
//! mutations. Every emitted statement is an idempotent shape
//! (`INSERT OR IGNORE`, upsert, keyed `UPDATE`), which is what makes
//! replay after reconnect safe.

mod personal;
mod space;

use chrono::{DateTime, Utc};

use crate::event::{tags, Event, ValidationError};
use crate::ids::{EventId, StreamId, UserId};
use crate::store::Mutation;

pub use personal::profile_mutations;

/// Context handed to every transform
#[derive(Debug, Clone)]
pub struct TransformContext {
    /// Stream the event arrived on
    pub stream_id: StreamId,

    /// Authoring user, attested by the server envelope
    pub user: UserId,
}

/// One row of the registry table
pub struct EventTypeEntry {
    /// Namespaced type tag this entry covers
    pub tag: &'static str,

    /// Shape and field constraints beyond what decoding enforces
    pub validate: fn(&Event) -> Result<(), ValidationError>,

    /// Event ids that must be materialized before this event applies
    pub depends_on: fn(&Event) -> Vec<EventId>,

    /// Pure transform from event to store mutations
    pub transform: fn(&TransformContext, &Event) -> Vec<Mutation>,

    /// Users whose profile records must be fetched out-of-band before
    /// this event's mutations run
    pub profile_fetch: fn(&Event) -> Vec<UserId>,
}

fn no_dependencies(_: &Event) -> Vec<EventId> {
    Vec::new()
}

fn no_profiles(_: &Event) -> Vec<UserId> {
    Vec::new()
}

/// The registry table. Compile-time only; no runtime registration.
pub static REGISTRY: &[EventTypeEntry] = &[
    EventTypeEntry {
        tag: tags::MESSAGE_CREATE,
        validate: space::validate_message_create,
        depends_on: no_dependencies,
        transform: space::transform_message_create,
        profile_fetch: space::author_profile,
    },
    EventTypeEntry {
        tag: tags::MESSAGE_EDIT,
        validate: space::validate_message_edit,
        depends_on: space::target_dependency,
        transform: space::transform_message_edit,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::MESSAGE_DELETE,
        validate: space::validate_message_delete,
        depends_on: space::target_dependency,
        transform: space::transform_message_delete,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::MESSAGE_REACT,
        validate: space::validate_message_react,
        depends_on: space::target_dependency,
        transform: space::transform_message_react,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::MESSAGE_REORDER,
        validate: space::validate_message_reorder,
        depends_on: space::target_dependency,
        transform: space::transform_message_reorder,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::ROOM_CREATE,
        validate: space::validate_room_create,
        depends_on: no_dependencies,
        transform: space::transform_room_create,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::ROOM_UPDATE,
        validate: space::validate_room_update,
        depends_on: no_dependencies,
        transform: space::transform_room_update,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::SPACE_INFO,
        validate: space::validate_space_info,
        depends_on: no_dependencies,
        transform: space::transform_space_info,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::PROFILE_UPDATE,
        validate: personal::validate_profile_update,
        depends_on: no_dependencies,
        transform: personal::transform_profile_update,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::SPACE_JOIN,
        validate: personal::validate_space_join,
        depends_on: no_dependencies,
        transform: personal::transform_space_join,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::SPACE_LEAVE,
        validate: personal::validate_space_leave,
        depends_on: no_dependencies,
        transform: personal::transform_space_leave,
        profile_fetch: no_profiles,
    },
    EventTypeEntry {
        tag: tags::LAST_READ,
        validate: personal::validate_last_read,
        depends_on: no_dependencies,
        transform: personal::transform_last_read,
        profile_fetch: no_profiles,
    },
];

/// Look up the registry entry for a type tag
pub fn lookup(tag: &str) -> Option<&'static EventTypeEntry> {
    REGISTRY.iter().find(|entry| entry.tag == tag)
}

/// Render the timestamp embedded in an event id as a stable RFC 3339
/// string for store columns. Pure; the same id always renders the same
/// instant.
pub(crate) fn event_time(id: EventId) -> String {
    DateTime::<Utc>::from_timestamp_millis(id.timestamp_ms() as i64)
        .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBody, MessageCreate};
    use crate::ids::{RoomId, StreamIndex};
    use bytes::Bytes;

    fn context() -> TransformContext {
        TransformContext {
            stream_id: StreamId::new("s1").unwrap(),
            user: UserId::new("did:plc:author").unwrap(),
        }
    }

    fn message_event() -> Event {
        Event {
            id: EventId::generate(),
            room: Some(RoomId::generate()),
            user: UserId::new("did:plc:author").unwrap(),
            stream_index: StreamIndex::new(1),
            body: EventBody::MessageCreate(MessageCreate {
                content: "hello".to_string(),
                reply_to: None,
            }),
        }
    }

    #[test]
    fn test_every_known_tag_has_an_entry() {
        for tag in [
            tags::MESSAGE_CREATE,
            tags::MESSAGE_EDIT,
            tags::MESSAGE_DELETE,
            tags::MESSAGE_REACT,
            tags::MESSAGE_REORDER,
            tags::ROOM_CREATE,
            tags::ROOM_UPDATE,
            tags::SPACE_INFO,
            tags::PROFILE_UPDATE,
            tags::SPACE_JOIN,
            tags::SPACE_LEAVE,
            tags::LAST_READ,
        ] {
            assert!(lookup(tag).is_some(), "missing registry entry for {tag}");
        }
    }

    #[test]
    fn test_unknown_tag_has_no_entry() {
        assert!(lookup("space.example.future.v0").is_none());
    }

    #[test]
    fn test_registry_has_no_duplicate_tags() {
        let mut tags: Vec<_> = REGISTRY.iter().map(|e| e.tag).collect();
        tags.sort_unstable();
        let before = tags.len();
        tags.dedup();
        assert_eq!(before, tags.len());
    }

    #[test]
    fn test_transform_is_deterministic() {
        let ctx = context();
        let event = message_event();
        let entry = lookup(event.type_tag()).unwrap();

        let first = (entry.transform)(&ctx, &event);
        let second = (entry.transform)(&ctx, &event);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_body_never_reaches_transforms() {
        let event = Event {
            body: EventBody::Unknown {
                type_tag: "space.example.future.v0".to_string(),
                raw: Bytes::from_static(b"{}"),
            },
            ..message_event()
        };
        assert!(lookup(event.type_tag()).is_none());
    }

    #[test]
    fn test_event_time_is_stable() {
        let id = EventId::generate();
        assert_eq!(event_time(id), event_time(id));
    }
}
