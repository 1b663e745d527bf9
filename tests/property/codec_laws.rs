// Copyright (c) 2025 - Cowboy AI, Inc.
//! Codec Laws
//!
//! `decode(encode(e)) == e` for every recognized body shape, and
//! decoding never panics on arbitrary byte soup.

use proptest::prelude::*;
use ulid::Ulid;

use tidemark::event::codec::{decode, encode};
use tidemark::{
    EventBody, EventId, LastReadSet, MessageCreate, MessageDelete, MessageEdit, MessageReact,
    MessageReorder, ProfileUpdate, RoomCreate, RoomId, RoomUpdate, SpaceInfo, SpaceJoin,
    SpaceLeave, StreamId, StreamIndex, UserId,
};

fn arb_event_id() -> impl Strategy<Value = EventId> {
    (0u64..1u64 << 40, any::<u128>())
        .prop_map(|(ts, random)| EventId::from_ulid(Ulid::from_parts(ts, random)))
}

fn arb_room_id() -> impl Strategy<Value = RoomId> {
    (0u64..1u64 << 40, any::<u128>())
        .prop_map(|(ts, random)| RoomId::from_ulid(Ulid::from_parts(ts, random)))
}

fn arb_user() -> impl Strategy<Value = UserId> {
    "[a-z0-9]{4,16}".prop_map(|suffix| UserId::new(format!("did:plc:{suffix}")).unwrap())
}

fn arb_stream() -> impl Strategy<Value = StreamId> {
    "[a-z0-9-]{4,24}".prop_map(|id| StreamId::new(id).unwrap())
}

fn arb_text() -> impl Strategy<Value = String> {
    ".{1,64}"
}

fn arb_timestamp() -> impl Strategy<Value = chrono::DateTime<chrono::Utc>> {
    (0i64..4_102_444_800_000i64).prop_map(|ms| {
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or(chrono::DateTime::UNIX_EPOCH)
    })
}

fn arb_body() -> impl Strategy<Value = EventBody> {
    prop_oneof![
        (arb_text(), proptest::option::of(arb_event_id())).prop_map(|(content, reply_to)| {
            EventBody::MessageCreate(MessageCreate { content, reply_to })
        }),
        (arb_event_id(), arb_text())
            .prop_map(|(target, content)| EventBody::MessageEdit(MessageEdit { target, content })),
        arb_event_id().prop_map(|target| EventBody::MessageDelete(MessageDelete { target })),
        (arb_event_id(), arb_text())
            .prop_map(|(target, key)| EventBody::MessageReact(MessageReact { target, key })),
        (arb_event_id(), proptest::option::of(arb_event_id()))
            .prop_map(|(target, after)| EventBody::MessageReorder(MessageReorder { target, after })),
        (arb_text(), proptest::option::of(arb_text()))
            .prop_map(|(name, topic)| EventBody::RoomCreate(RoomCreate { name, topic })),
        (
            proptest::option::of(arb_text()),
            proptest::option::of(arb_text()),
            proptest::option::of(any::<bool>()),
        )
            .prop_map(|(name, topic, archived)| {
                EventBody::RoomUpdate(RoomUpdate {
                    name,
                    topic,
                    archived,
                })
            }),
        (arb_text(), proptest::option::of(arb_text()), arb_user()).prop_map(
            |(name, avatar, admin)| {
                EventBody::SpaceInfo(SpaceInfo {
                    name,
                    avatar,
                    admin,
                })
            }
        ),
        (
            proptest::option::of(arb_text()),
            proptest::option::of(arb_text()),
            proptest::option::of(arb_text()),
        )
            .prop_map(|(display_name, avatar, status_line)| {
                EventBody::ProfileUpdate(ProfileUpdate {
                    display_name,
                    avatar,
                    status_line,
                })
            }),
        arb_stream().prop_map(|stream| EventBody::SpaceJoin(SpaceJoin { stream })),
        arb_stream().prop_map(|stream| EventBody::SpaceLeave(SpaceLeave { stream })),
        (arb_stream(), arb_room_id(), arb_timestamp()).prop_map(|(stream, room, at)| {
            EventBody::LastReadSet(LastReadSet { stream, room, at })
        }),
    ]
}

proptest! {
    /// decode ∘ encode is the identity on every recognized body
    #[test]
    fn prop_decode_encode_round_trip(
        id in arb_event_id(),
        room in proptest::option::of(arb_room_id()),
        user in arb_user(),
        idx in 1u64..1_000_000,
        body in arb_body(),
    ) {
        let bytes = encode(id, room, &body).unwrap();
        let event = decode(user.clone(), StreamIndex::new(idx), &bytes).unwrap();

        prop_assert_eq!(event.id, id);
        prop_assert_eq!(event.room, room);
        prop_assert_eq!(event.user, user);
        prop_assert_eq!(event.stream_index, StreamIndex::new(idx));
        prop_assert_eq!(event.body, body);
    }

    /// Encoding is deterministic
    #[test]
    fn prop_encode_is_deterministic(
        id in arb_event_id(),
        room in proptest::option::of(arb_room_id()),
        body in arb_body(),
    ) {
        prop_assert_eq!(
            encode(id, room, &body).unwrap(),
            encode(id, room, &body).unwrap()
        );
    }

    /// Decoding arbitrary bytes never panics; it returns an error or an
    /// event
    #[test]
    fn prop_decode_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
        let user = UserId::new("did:plc:fuzz").unwrap();
        let _ = decode(user, StreamIndex::new(1), &payload);
    }
}
