// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Wire Codec
//!
//! Payloads are self-describing JSON bytes tagged by a namespaced
//! `type` string:
//!
//! ```text
//! { "id": "<ulid>", "type": "space.chat.message.create.v0",
//!   "room": "<ulid>", "body": { ... } }
//! ```
//!
//! The authoring user and stream index are not part of the payload;
//! they arrive in the server's row envelope and are attested by it.
//!
//! Decoding never panics on malformed input. An unrecognized type tag
//! decodes to [`EventBody::Unknown`] with the original bytes preserved,
//! so `decode` then `encode` is byte-identical for foreign events.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

use super::{tags, Event, EventBody};
use crate::ids::{EventId, RoomId, StreamIndex, UserId};

/// Errors produced while decoding a payload
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    Json(String),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Payload is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Field '{field}' is not a valid identifier: {message}")]
    InvalidId {
        field: &'static str,
        message: String,
    },

    #[error("Body for '{tag}' does not match its schema: {message}")]
    Body { tag: String, message: String },
}

/// Decode one payload into an [`Event`]
///
/// `user` and `idx` come from the server's row envelope. Unknown type
/// tags yield [`EventBody::Unknown`] rather than an error.
pub fn decode(user: UserId, idx: StreamIndex, payload: &[u8]) -> Result<Event, DecodeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Json(e.to_string()))?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let tag = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("type"))?;

    let id = required_id::<EventId>(object, "id")?;
    let room = optional_id::<RoomId>(object, "room")?;

    let body = match tag {
        tags::MESSAGE_CREATE => EventBody::MessageCreate(body_of(object, tag)?),
        tags::MESSAGE_EDIT => EventBody::MessageEdit(body_of(object, tag)?),
        tags::MESSAGE_DELETE => EventBody::MessageDelete(body_of(object, tag)?),
        tags::MESSAGE_REACT => EventBody::MessageReact(body_of(object, tag)?),
        tags::MESSAGE_REORDER => EventBody::MessageReorder(body_of(object, tag)?),
        tags::ROOM_CREATE => EventBody::RoomCreate(body_of(object, tag)?),
        tags::ROOM_UPDATE => EventBody::RoomUpdate(body_of(object, tag)?),
        tags::SPACE_INFO => EventBody::SpaceInfo(body_of(object, tag)?),
        tags::PROFILE_UPDATE => EventBody::ProfileUpdate(body_of(object, tag)?),
        tags::SPACE_JOIN => EventBody::SpaceJoin(body_of(object, tag)?),
        tags::SPACE_LEAVE => EventBody::SpaceLeave(body_of(object, tag)?),
        tags::LAST_READ => EventBody::LastReadSet(body_of(object, tag)?),
        _ => EventBody::Unknown {
            type_tag: tag.to_string(),
            raw: Bytes::copy_from_slice(payload),
        },
    };

    Ok(Event {
        id,
        room,
        user,
        stream_index: idx,
        body,
    })
}

/// Encode a body into payload bytes for appending to a stream
///
/// [`EventBody::Unknown`] re-emits its preserved original bytes; the
/// `id` and `room` arguments are ignored for it.
pub fn encode(
    id: EventId,
    room: Option<RoomId>,
    body: &EventBody,
) -> Result<Vec<u8>, serde_json::Error> {
    let body_value = match body {
        EventBody::Unknown { raw, .. } => return Ok(raw.to_vec()),
        EventBody::MessageCreate(b) => to_value(b)?,
        EventBody::MessageEdit(b) => to_value(b)?,
        EventBody::MessageDelete(b) => to_value(b)?,
        EventBody::MessageReact(b) => to_value(b)?,
        EventBody::MessageReorder(b) => to_value(b)?,
        EventBody::RoomCreate(b) => to_value(b)?,
        EventBody::RoomUpdate(b) => to_value(b)?,
        EventBody::SpaceInfo(b) => to_value(b)?,
        EventBody::ProfileUpdate(b) => to_value(b)?,
        EventBody::SpaceJoin(b) => to_value(b)?,
        EventBody::SpaceLeave(b) => to_value(b)?,
        EventBody::LastReadSet(b) => to_value(b)?,
    };

    let mut object = Map::new();
    object.insert("id".to_string(), Value::String(id.to_string()));
    object.insert("type".to_string(), Value::String(body.type_tag().to_string()));
    if let Some(room) = room {
        object.insert("room".to_string(), Value::String(room.to_string()));
    }
    object.insert("body".to_string(), body_value);

    serde_json::to_vec(&Value::Object(object))
}

fn to_value<T: Serialize>(body: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(body)
}

fn body_of<T: DeserializeOwned>(object: &Map<String, Value>, tag: &str) -> Result<T, DecodeError> {
    let body = object.get("body").cloned().unwrap_or(Value::Null);
    serde_json::from_value(body).map_err(|e| DecodeError::Body {
        tag: tag.to_string(),
        message: e.to_string(),
    })
}

fn required_id<T>(object: &Map<String, Value>, field: &'static str) -> Result<T, DecodeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = object
        .get(field)
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField(field))?;
    raw.parse().map_err(|e: T::Err| DecodeError::InvalidId {
        field,
        message: e.to_string(),
    })
}

fn optional_id<T>(object: &Map<String, Value>, field: &'static str) -> Result<Option<T>, DecodeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let raw = value.as_str().ok_or(DecodeError::InvalidId {
                field,
                message: "expected a string".to_string(),
            })?;
            raw.parse().map(Some).map_err(|e: T::Err| DecodeError::InvalidId {
                field,
                message: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessageCreate, MessageEdit, SpaceInfo};
    use pretty_assertions::assert_eq;

    fn author() -> UserId {
        UserId::new("did:plc:tester").unwrap()
    }

    #[test]
    fn test_round_trip_known_body() {
        let id = EventId::generate();
        let room = Some(RoomId::generate());
        let body = EventBody::MessageCreate(MessageCreate {
            content: "hello there".to_string(),
            reply_to: Some(EventId::generate()),
        });

        let bytes = encode(id, room, &body).unwrap();
        let event = decode(author(), StreamIndex::new(3), &bytes).unwrap();

        assert_eq!(event.id, id);
        assert_eq!(event.room, room);
        assert_eq!(event.stream_index, StreamIndex::new(3));
        assert_eq!(event.body, body);
    }

    #[test]
    fn test_round_trip_without_room() {
        let id = EventId::generate();
        let body = EventBody::SpaceInfo(SpaceInfo {
            name: "garden club".to_string(),
            avatar: None,
            admin: author(),
        });

        let bytes = encode(id, None, &body).unwrap();
        let event = decode(author(), StreamIndex::new(1), &bytes).unwrap();
        assert_eq!(event.room, None);
        assert_eq!(event.body, body);
    }

    #[test]
    fn test_unknown_tag_preserves_bytes() {
        let payload = format!(
            r#"{{"id":"{}","type":"space.example.future.v0","body":{{"x":1}}}}"#,
            EventId::generate()
        );
        let event = decode(author(), StreamIndex::new(9), payload.as_bytes()).unwrap();

        match &event.body {
            EventBody::Unknown { type_tag, raw } => {
                assert_eq!(type_tag, "space.example.future.v0");
                assert_eq!(raw.as_ref(), payload.as_bytes());
            }
            other => panic!("expected Unknown, got {other:?}"),
        }

        // Re-encoding a foreign event is byte-identical.
        let bytes = encode(event.id, event.room, &event.body).unwrap();
        assert_eq!(bytes, payload.as_bytes());
    }

    #[test]
    fn test_malformed_payloads_are_typed_errors() {
        let user = author();
        assert!(matches!(
            decode(user.clone(), StreamIndex::new(1), b"not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode(user.clone(), StreamIndex::new(1), b"[1,2]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            decode(user.clone(), StreamIndex::new(1), b"{\"body\":{}}"),
            Err(DecodeError::MissingField("type"))
        ));
        assert!(matches!(
            decode(
                user,
                StreamIndex::new(1),
                b"{\"type\":\"space.chat.message.create.v0\",\"id\":\"nope\"}"
            ),
            Err(DecodeError::InvalidId { field: "id", .. })
        ));
    }

    #[test]
    fn test_body_schema_mismatch_is_reported_with_tag() {
        let payload = format!(
            r#"{{"id":"{}","type":"space.chat.message.edit.v0","body":{{"content":"x"}}}}"#,
            EventId::generate()
        );
        let err = decode(author(), StreamIndex::new(2), payload.as_bytes()).unwrap_err();
        match err {
            DecodeError::Body { tag, .. } => assert_eq!(tag, tags::MESSAGE_EDIT),
            other => panic!("expected Body error, got {other:?}"),
        }
    }

    #[test]
    fn test_edit_body_round_trip() {
        let target = EventId::generate();
        let body = EventBody::MessageEdit(MessageEdit {
            target,
            content: "fixed typo".to_string(),
        });
        let bytes = encode(EventId::generate(), None, &body).unwrap();
        let event = decode(author(), StreamIndex::new(5), &bytes).unwrap();
        match event.body {
            EventBody::MessageEdit(edit) => assert_eq!(edit.target, target),
            other => panic!("expected edit, got {other:?}"),
        }
    }
}
