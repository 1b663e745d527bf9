// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transform Laws
//!
//! Registry transforms are pure functions and only emit idempotent
//! statement shapes, which together are what make replay after
//! reconnect safe.

use proptest::prelude::*;
use ulid::Ulid;

use tidemark::registry::{lookup, TransformContext};
use tidemark::{
    Event, EventBody, EventId, MessageCreate, MessageDelete, MessageEdit, MessageReact, RoomId,
    StreamId, StreamIndex, UserId,
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

/// Space-stream bodies with the envelope fields they require
fn arb_space_event() -> impl Strategy<Value = Event> {
    let body = prop_oneof![
        (".{1,64}", proptest::option::of(arb_event_id())).prop_map(|(content, reply_to)| {
            EventBody::MessageCreate(MessageCreate { content, reply_to })
        }),
        (arb_event_id(), ".{1,64}")
            .prop_map(|(target, content)| EventBody::MessageEdit(MessageEdit { target, content })),
        arb_event_id().prop_map(|target| EventBody::MessageDelete(MessageDelete { target })),
        (arb_event_id(), "[a-z+1-9-]{1,16}")
            .prop_map(|(target, key)| EventBody::MessageReact(MessageReact { target, key })),
    ];

    (arb_event_id(), arb_room_id(), arb_user(), 1u64..1_000_000, body).prop_map(
        |(id, room, user, idx, body)| Event {
            id,
            room: Some(room),
            user,
            stream_index: StreamIndex::new(idx),
            body,
        },
    )
}

fn context(event: &Event) -> TransformContext {
    TransformContext {
        stream_id: StreamId::new("prop-stream").unwrap(),
        user: event.user.clone(),
    }
}

/// Statement shapes that are no-ops when replayed against the state
/// they produced
fn is_idempotent_shape(sql: &str) -> bool {
    let sql = sql.trim_start();
    sql.starts_with("INSERT OR IGNORE")
        || sql.starts_with("INSERT OR REPLACE")
        || (sql.starts_with("INSERT INTO") && sql.contains("ON CONFLICT"))
        || sql.starts_with("UPDATE")
        || sql.starts_with("DELETE")
}

proptest! {
    /// Same context and event always produce the same mutations
    #[test]
    fn prop_transform_is_pure(event in arb_space_event()) {
        let entry = lookup(event.type_tag()).unwrap();
        let ctx = context(&event);

        let first = (entry.transform)(&ctx, &event);
        let second = (entry.transform)(&ctx, &event);
        prop_assert_eq!(first, second);
    }

    /// Every emitted statement is an idempotent shape
    #[test]
    fn prop_mutations_are_idempotent_shapes(event in arb_space_event()) {
        let entry = lookup(event.type_tag()).unwrap();
        let mutations = (entry.transform)(&context(&event), &event);

        for mutation in &mutations {
            prop_assert!(
                is_idempotent_shape(&mutation.sql),
                "non-idempotent statement: {}",
                mutation.sql
            );
        }
    }

    /// Validation accepts exactly what transforms expect: a valid space
    /// event validates, and its dependency list names only the target
    #[test]
    fn prop_follow_ups_depend_on_their_target(event in arb_space_event()) {
        let entry = lookup(event.type_tag()).unwrap();
        prop_assert!((entry.validate)(&event).is_ok());

        let deps = (entry.depends_on)(&event);
        match &event.body {
            EventBody::MessageEdit(b) => prop_assert_eq!(deps, vec![b.target]),
            EventBody::MessageDelete(b) => prop_assert_eq!(deps, vec![b.target]),
            EventBody::MessageReact(b) => prop_assert_eq!(deps, vec![b.target]),
            EventBody::MessageCreate(_) => prop_assert!(deps.is_empty()),
            _ => {}
        }
    }
}
