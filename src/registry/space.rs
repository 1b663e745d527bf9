// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transforms for Space-Stream Events
//!
//! Messages are keyed by the event id of their create event, so edits,
//! deletes, and reactions both reference and causally depend on that
//! id. Message creates also ensure their room row exists, since a
//! message can arrive before the room's own create event when history
//! is fetched lazily.

use crate::event::{Event, EventBody, ValidationError};
use crate::ids::{EventId, UserId};
use crate::store::{Mutation, SqlValue};

use super::{event_time, TransformContext};

fn body_mismatch(tag: &'static str) -> ValidationError {
    ValidationError::InvalidField {
        field: "type",
        reason: format!("body does not match tag {tag}"),
    }
}

fn room_required() -> ValidationError {
    ValidationError::InvalidField {
        field: "room",
        reason: "event type requires a room".to_string(),
    }
}

/// Shared dependency function: message follow-ups depend on the event
/// that created their target message.
pub(super) fn target_dependency(event: &Event) -> Vec<EventId> {
    match &event.body {
        EventBody::MessageEdit(b) => vec![b.target],
        EventBody::MessageDelete(b) => vec![b.target],
        EventBody::MessageReact(b) => vec![b.target],
        EventBody::MessageReorder(b) => vec![b.target],
        _ => Vec::new(),
    }
}

/// A first message from an author requires their profile record.
pub(super) fn author_profile(event: &Event) -> Vec<UserId> {
    vec![event.user.clone()]
}

// ---------------------------------------------------------------------
// message.create
// ---------------------------------------------------------------------

pub(super) fn validate_message_create(event: &Event) -> Result<(), ValidationError> {
    let body = match &event.body {
        EventBody::MessageCreate(b) => b,
        _ => return Err(body_mismatch("space.chat.message.create.v0")),
    };
    if event.room.is_none() {
        return Err(room_required());
    }
    body.validate()
}

pub(super) fn transform_message_create(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let (body, room) = match (&event.body, event.room) {
        (EventBody::MessageCreate(b), Some(room)) => (b, room),
        _ => return Vec::new(),
    };
    let created_at = event_time(event.id);

    vec![
        // Placeholder room row in case the room's create event has not
        // materialized yet; a later room.create upsert fills the name.
        Mutation::new(
            "INSERT OR IGNORE INTO rooms (stream_id, room_id, name) VALUES (?1, ?2, ?3)",
            vec![
                SqlValue::from(ctx.stream_id.as_str()),
                SqlValue::from(room.to_string()),
                SqlValue::from(room.to_string()),
            ],
        ),
        Mutation::new(
            "INSERT OR IGNORE INTO messages \
             (stream_id, message_id, room_id, author, content, reply_to, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            vec![
                SqlValue::from(ctx.stream_id.as_str()),
                SqlValue::from(event.id.to_string()),
                SqlValue::from(room.to_string()),
                SqlValue::from(ctx.user.as_str()),
                SqlValue::from(body.content.clone()),
                SqlValue::from(body.reply_to.map(|id| id.to_string())),
                SqlValue::from(created_at.clone()),
            ],
        ),
        Mutation::new(
            "UPDATE rooms SET last_activity_at = MAX(COALESCE(last_activity_at, ''), ?3) \
             WHERE stream_id = ?1 AND room_id = ?2",
            vec![
                SqlValue::from(ctx.stream_id.as_str()),
                SqlValue::from(room.to_string()),
                SqlValue::from(created_at),
            ],
        ),
    ]
}

// ---------------------------------------------------------------------
// message.edit
// ---------------------------------------------------------------------

pub(super) fn validate_message_edit(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::MessageEdit(b) => b.validate(),
        _ => Err(body_mismatch("space.chat.message.edit.v0")),
    }
}

pub(super) fn transform_message_edit(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let body = match &event.body {
        EventBody::MessageEdit(b) => b,
        _ => return Vec::new(),
    };
    let edited_at = event_time(event.id);

    // Last-write-wins by edit timestamp; replaying an older edit after
    // a newer one is a no-op.
    vec![Mutation::new(
        "UPDATE messages SET content = ?3, edited_at = ?4 \
         WHERE stream_id = ?1 AND message_id = ?2 AND deleted = 0 \
         AND (edited_at IS NULL OR edited_at <= ?4)",
        vec![
            SqlValue::from(ctx.stream_id.as_str()),
            SqlValue::from(body.target.to_string()),
            SqlValue::from(body.content.clone()),
            SqlValue::from(edited_at),
        ],
    )]
}

// ---------------------------------------------------------------------
// message.delete
// ---------------------------------------------------------------------

pub(super) fn validate_message_delete(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::MessageDelete(b) => b.validate(),
        _ => Err(body_mismatch("space.chat.message.delete.v0")),
    }
}

pub(super) fn transform_message_delete(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let body = match &event.body {
        EventBody::MessageDelete(b) => b,
        _ => return Vec::new(),
    };

    vec![
        Mutation::new(
            "UPDATE messages SET deleted = 1, content = '' \
             WHERE stream_id = ?1 AND message_id = ?2",
            vec![
                SqlValue::from(ctx.stream_id.as_str()),
                SqlValue::from(body.target.to_string()),
            ],
        ),
        Mutation::new(
            "DELETE FROM reactions WHERE stream_id = ?1 AND message_id = ?2",
            vec![
                SqlValue::from(ctx.stream_id.as_str()),
                SqlValue::from(body.target.to_string()),
            ],
        ),
    ]
}

// ---------------------------------------------------------------------
// message.react
// ---------------------------------------------------------------------

pub(super) fn validate_message_react(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::MessageReact(b) => b.validate(),
        _ => Err(body_mismatch("space.chat.message.react.v0")),
    }
}

pub(super) fn transform_message_react(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let body = match &event.body {
        EventBody::MessageReact(b) => b,
        _ => return Vec::new(),
    };

    vec![Mutation::new(
        "INSERT OR IGNORE INTO reactions (stream_id, message_id, user_id, key) \
         VALUES (?1, ?2, ?3, ?4)",
        vec![
            SqlValue::from(ctx.stream_id.as_str()),
            SqlValue::from(body.target.to_string()),
            SqlValue::from(ctx.user.as_str()),
            SqlValue::from(body.key.clone()),
        ],
    )]
}

// ---------------------------------------------------------------------
// message.reorder
// ---------------------------------------------------------------------

pub(super) fn validate_message_reorder(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::MessageReorder(b) => b.validate(),
        _ => Err(body_mismatch("space.chat.message.reorder.v0")),
    }
}

/// Reordering is resolved interactively by the view layer; the store
/// keeps server order, so materialization produces nothing.
pub(super) fn transform_message_reorder(_: &TransformContext, _: &Event) -> Vec<Mutation> {
    Vec::new()
}

// ---------------------------------------------------------------------
// room.create / room.update
// ---------------------------------------------------------------------

pub(super) fn validate_room_create(event: &Event) -> Result<(), ValidationError> {
    let body = match &event.body {
        EventBody::RoomCreate(b) => b,
        _ => return Err(body_mismatch("space.chat.room.create.v0")),
    };
    if event.room.is_none() {
        return Err(room_required());
    }
    body.validate()
}

pub(super) fn transform_room_create(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let (body, room) = match (&event.body, event.room) {
        (EventBody::RoomCreate(b), Some(room)) => (b, room),
        _ => return Vec::new(),
    };

    vec![Mutation::new(
        "INSERT INTO rooms (stream_id, room_id, name, topic) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(stream_id, room_id) DO UPDATE SET \
         name = excluded.name, topic = excluded.topic",
        vec![
            SqlValue::from(ctx.stream_id.as_str()),
            SqlValue::from(room.to_string()),
            SqlValue::from(body.name.clone()),
            SqlValue::from(body.topic.clone()),
        ],
    )]
}

pub(super) fn validate_room_update(event: &Event) -> Result<(), ValidationError> {
    let body = match &event.body {
        EventBody::RoomUpdate(b) => b,
        _ => return Err(body_mismatch("space.chat.room.update.v0")),
    };
    if event.room.is_none() {
        return Err(room_required());
    }
    body.validate()
}

pub(super) fn transform_room_update(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let (body, room) = match (&event.body, event.room) {
        (EventBody::RoomUpdate(b), Some(room)) => (b, room),
        _ => return Vec::new(),
    };

    // Keyed patch; updating a room that has not materialized is a
    // no-op, not an error.
    vec![Mutation::new(
        "UPDATE rooms SET \
         name = COALESCE(?3, name), \
         topic = COALESCE(?4, topic), \
         archived = COALESCE(?5, archived) \
         WHERE stream_id = ?1 AND room_id = ?2",
        vec![
            SqlValue::from(ctx.stream_id.as_str()),
            SqlValue::from(room.to_string()),
            SqlValue::from(body.name.clone()),
            SqlValue::from(body.topic.clone()),
            SqlValue::from(body.archived),
        ],
    )]
}

// ---------------------------------------------------------------------
// space.info
// ---------------------------------------------------------------------

pub(super) fn validate_space_info(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::SpaceInfo(b) => b.validate(),
        _ => Err(body_mismatch("space.chat.space.info.v0")),
    }
}

pub(super) fn transform_space_info(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let body = match &event.body {
        EventBody::SpaceInfo(b) => b,
        _ => return Vec::new(),
    };

    vec![Mutation::new(
        "INSERT INTO spaces (stream_id, name, avatar, admin_user) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(stream_id) DO UPDATE SET \
         name = excluded.name, avatar = excluded.avatar, admin_user = excluded.admin_user",
        vec![
            SqlValue::from(ctx.stream_id.as_str()),
            SqlValue::from(body.name.clone()),
            SqlValue::from(body.avatar.clone()),
            SqlValue::from(body.admin.as_str()),
        ],
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessageCreate, MessageEdit, RoomUpdate};
    use crate::ids::{RoomId, StreamId, StreamIndex};

    fn ctx() -> TransformContext {
        TransformContext {
            stream_id: StreamId::new("s1").unwrap(),
            user: UserId::new("did:plc:author").unwrap(),
        }
    }

    fn event(room: Option<RoomId>, body: EventBody) -> Event {
        Event {
            id: EventId::generate(),
            room,
            user: UserId::new("did:plc:author").unwrap(),
            stream_index: StreamIndex::new(1),
            body,
        }
    }

    #[test]
    fn test_message_create_requires_room() {
        let e = event(
            None,
            EventBody::MessageCreate(MessageCreate {
                content: "hi".to_string(),
                reply_to: None,
            }),
        );
        assert!(validate_message_create(&e).is_err());
    }

    #[test]
    fn test_message_create_produces_room_message_activity() {
        let e = event(
            Some(RoomId::generate()),
            EventBody::MessageCreate(MessageCreate {
                content: "hi".to_string(),
                reply_to: None,
            }),
        );
        let mutations = transform_message_create(&ctx(), &e);
        assert_eq!(mutations.len(), 3);
        assert!(mutations[0].sql.contains("INSERT OR IGNORE INTO rooms"));
        assert!(mutations[1].sql.contains("INSERT OR IGNORE INTO messages"));
        assert!(mutations[2].sql.contains("UPDATE rooms SET last_activity_at"));
    }

    #[test]
    fn test_edit_depends_on_its_target() {
        let target = EventId::generate();
        let e = event(
            None,
            EventBody::MessageEdit(MessageEdit {
                target,
                content: "fixed".to_string(),
            }),
        );
        assert_eq!(target_dependency(&e), vec![target]);
    }

    #[test]
    fn test_reorder_transform_is_empty() {
        let e = event(
            None,
            EventBody::MessageReorder(crate::event::MessageReorder {
                target: EventId::generate(),
                after: None,
            }),
        );
        assert!(transform_message_reorder(&ctx(), &e).is_empty());
        assert_eq!(target_dependency(&e).len(), 1);
    }

    #[test]
    fn test_room_update_patches_only_given_fields() {
        let e = event(
            Some(RoomId::generate()),
            EventBody::RoomUpdate(RoomUpdate {
                name: None,
                topic: Some("planning".to_string()),
                archived: None,
            }),
        );
        let mutations = transform_room_update(&ctx(), &e);
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].params[2], SqlValue::Null);
        assert_eq!(
            mutations[0].params[3],
            SqlValue::Text("planning".to_string())
        );
    }
}
