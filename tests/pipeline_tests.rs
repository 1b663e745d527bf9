// Copyright (c) 2025 - Cowboy AI, Inc.
//! End-to-end materialization scenarios over the channel and store:
//! ordering, causal stash, replay idempotence, priority preemption,
//! unknown types, and partial statement failure.

mod fixtures;

use bytes::Bytes;
use fixtures::{delivered, delivered_with_id, fetched, live, pipeline};
use pretty_assertions::assert_eq;
use tidemark::{
    Disposition, EventBody, EventId, MessageCreate, MessageEdit, Priority, RoomId, SqlValue,
    Store, StreamId, StreamIndex,
};

fn message(content: &str) -> EventBody {
    EventBody::MessageCreate(MessageCreate {
        content: content.to_string(),
        reply_to: None,
    })
}

fn stream() -> StreamId {
    StreamId::new("space-under-test").unwrap()
}

// --------------------------------------------------------------------
// Scenario: out-of-order dependency within one batch
// --------------------------------------------------------------------

#[tokio::test]
async fn test_edit_before_create_stashes_then_applies() {
    let mut pipeline = pipeline().await;
    let stream = stream();
    let room = RoomId::generate();

    let create_id = EventId::generate();
    // Server ordering bug: the edit carries a lower index than the
    // message it edits.
    let edit = delivered(
        &pipeline.user,
        1,
        Some(room),
        EventBody::MessageEdit(MessageEdit {
            target: create_id,
            content: "hello, edited".to_string(),
        }),
    );
    let create = delivered_with_id(
        create_id,
        &pipeline.user,
        2,
        Some(room),
        message("hello"),
    );

    pipeline
        .channel
        .push(fetched(&stream, vec![edit, create], Priority::Background));

    // First pass: create applies, edit is stashed.
    let first = pipeline.reports.recv().await.unwrap();
    assert_eq!(first.summary.applied, 1);
    assert_eq!(first.summary.stashed, 1);
    assert_eq!(first.warnings.stashed_waiting.len(), 1);

    // The stash released the edit into a follow-up batch.
    let second = pipeline.reports.recv().await.unwrap();
    assert_eq!(second.summary.applied, 1);
    assert_eq!(second.summary.stashed, 0);
    assert!(second.warnings.stashed_waiting.is_empty());

    let content = fixtures::text_cell(
        &pipeline.store,
        "SELECT content FROM messages WHERE message_id = ?1",
        &[SqlValue::from(create_id.to_string())],
    )
    .await;
    assert_eq!(content, Some("hello, edited".to_string()));
}

// --------------------------------------------------------------------
// Scenario: duplicate replay after reconnect
// --------------------------------------------------------------------

#[tokio::test]
async fn test_replayed_window_applies_exactly_once() {
    let mut pipeline = pipeline().await;
    let stream = stream();
    let room = RoomId::generate();

    let first_window: Vec<_> = (1..=10)
        .map(|i| delivered(&pipeline.user, i, Some(room), message(&format!("m{i}"))))
        .collect();
    let overlap: Vec<_> = first_window[4..].to_vec();

    pipeline
        .channel
        .push(fetched(&stream, first_window, Priority::Background));
    let report = pipeline.reports.recv().await.unwrap();
    assert_eq!(report.summary.applied, 10);
    assert_eq!(report.summary.cursor, StreamIndex::new(10));

    // Reconnect re-delivers 5..10 plus fresh 11..15.
    let mut replay = overlap;
    for i in 11..=15 {
        replay.push(delivered(&pipeline.user, i, Some(room), message(&format!("m{i}"))));
    }
    pipeline
        .channel
        .push(fetched(&stream, replay, Priority::Background));

    let report = pipeline.reports.recv().await.unwrap();
    assert_eq!(report.summary.applied, 5);
    assert_eq!(report.summary.duplicates, 6);
    assert_eq!(report.summary.cursor, StreamIndex::new(15));

    let count = fixtures::int_cell(
        &pipeline.store,
        "SELECT COUNT(*) FROM messages WHERE stream_id = ?1",
        &[SqlValue::from(stream.as_str())],
    )
    .await;
    assert_eq!(count, Some(15));
}

// --------------------------------------------------------------------
// Scenario: applying the same batch twice is a no-op
// --------------------------------------------------------------------

#[tokio::test]
async fn test_reapplying_a_batch_leaves_state_unchanged() {
    let mut pipeline = pipeline().await;
    let stream = stream();
    let room = RoomId::generate();

    let events: Vec<_> = (1..=4)
        .map(|i| delivered(&pipeline.user, i, Some(room), message(&format!("m{i}"))))
        .collect();

    pipeline
        .channel
        .push(fetched(&stream, events.clone(), Priority::Background));
    pipeline.reports.recv().await.unwrap();

    let snapshot = pipeline
        .store
        .query("SELECT * FROM messages ORDER BY message_id", &[])
        .await
        .unwrap();

    pipeline
        .channel
        .push(fetched(&stream, events, Priority::Background));
    let report = pipeline.reports.recv().await.unwrap();
    assert_eq!(report.summary.applied, 0);
    assert_eq!(report.summary.duplicates, 4);

    let after = pipeline
        .store
        .query("SELECT * FROM messages ORDER BY message_id", &[])
        .await
        .unwrap();
    assert_eq!(snapshot, after);
}

// --------------------------------------------------------------------
// Scenario: priority preemption at the batch boundary
// --------------------------------------------------------------------

#[tokio::test]
async fn test_live_foreground_batch_preempts_queued_backfill() {
    let mut pipeline = pipeline().await;
    let personal = StreamId::new("personal").unwrap();
    let space = StreamId::new("space-big").unwrap();
    let room = RoomId::generate();

    // A large backfill is queued; a live personal push arrives after.
    // Strict priority drains the push before any queued backfill batch.
    let backfill_one: Vec<_> = (1..=100)
        .map(|i| delivered(&pipeline.user, i, Some(room), message(&format!("a{i}"))))
        .collect();
    let backfill_two: Vec<_> = (101..=200)
        .map(|i| delivered(&pipeline.user, i, Some(room), message(&format!("b{i}"))))
        .collect();
    let push = vec![delivered(&pipeline.user, 1, Some(room), message("ping"))];

    let live_batch = live(&personal, push, Priority::Foreground);
    let live_id = live_batch.batch_id();
    pipeline
        .channel
        .push(fetched(&space, backfill_one, Priority::Background));
    pipeline
        .channel
        .push(fetched(&space, backfill_two, Priority::Background));
    pipeline.channel.push(live_batch);

    // The first report may be the backfill batch that was already in
    // flight; the push must land no later than one batch after it.
    let first = pipeline.reports.recv().await.unwrap();
    let second = pipeline.reports.recv().await.unwrap();
    assert!(
        first.batch_id == live_id || second.batch_id == live_id,
        "live push materialized later than one background batch"
    );
}

// --------------------------------------------------------------------
// Scenario: unknown event type
// --------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_type_skips_warns_and_advances_cursor() {
    let mut pipeline = pipeline().await;
    let stream = stream();
    let room = RoomId::generate();

    let future_id = EventId::generate();
    let events = vec![
        delivered(&pipeline.user, 1, Some(room), message("before")),
        delivered_with_id(
            future_id,
            &pipeline.user,
            2,
            None,
            EventBody::Unknown {
                type_tag: "space.example.future.v0".to_string(),
                raw: Bytes::from_static(b"{}"),
            },
        ),
        delivered(&pipeline.user, 3, Some(room), message("after")),
    ];

    pipeline
        .channel
        .push(fetched(&stream, events, Priority::Background));

    let report = pipeline.reports.recv().await.unwrap();
    assert_eq!(report.summary.applied, 2);
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.summary.cursor, StreamIndex::new(3));

    // The warning names the skipped event.
    assert_eq!(report.warnings.invalid_events.len(), 1);
    assert_eq!(report.warnings.invalid_events[0].0, Some(future_id));
    assert!(report.warnings.invalid_events[0]
        .1
        .contains("space.example.future.v0"));
}

// --------------------------------------------------------------------
// Scenario: one failing statement inside a batch
// --------------------------------------------------------------------

#[tokio::test]
async fn test_failing_statement_errors_one_event_batch_continues() {
    let mut pipeline = pipeline().await;
    let stream = stream();
    let room = RoomId::generate();

    // Content over the schema's check constraint passes validation but
    // fails the middle statement of the message-create transform.
    let oversized = "x".repeat(65_537);

    let mut events: Vec<_> = (1..=4)
        .map(|i| delivered(&pipeline.user, i, Some(room), message(&format!("m{i}"))))
        .collect();
    let failing = delivered(&pipeline.user, 5, Some(room), message(&oversized));
    let failing_id = failing.id;
    events.push(failing);
    events.push(delivered(&pipeline.user, 6, Some(room), message("m6")));

    pipeline
        .channel
        .push(fetched(&stream, events, Priority::Background));

    let report = pipeline.reports.recv().await.unwrap();
    assert_eq!(report.summary.applied, 5);
    assert_eq!(report.summary.errored, 1);
    assert_eq!(report.summary.cursor, StreamIndex::new(6));

    assert_eq!(report.warnings.failed_statements.len(), 1);
    assert_eq!(
        report.warnings.failed_statements[0].event_id,
        Some(failing_id)
    );
    assert_eq!(report.warnings.failed_events.len(), 1);

    // The errored event's outcome is recorded in the applied batch.
    let tidemark::Batch::Applied { results, .. } = &report.outcome else {
        panic!("expected applied outcome");
    };
    let errored = results
        .iter()
        .find(|r| r.event_id == Some(failing_id))
        .unwrap();
    assert_eq!(errored.disposition, Disposition::Errored);

    // Its mutations rolled back; the rest of the batch landed.
    let count = fixtures::int_cell(
        &pipeline.store,
        "SELECT COUNT(*) FROM messages WHERE stream_id = ?1",
        &[SqlValue::from(stream.as_str())],
    )
    .await;
    assert_eq!(count, Some(5));
}

// --------------------------------------------------------------------
// Dependency gate boundary: satisfied dependencies pass first try
// --------------------------------------------------------------------

#[tokio::test]
async fn test_satisfied_dependency_passes_gate_first_attempt() {
    let mut pipeline = pipeline().await;
    let stream = stream();
    let room = RoomId::generate();

    let create_id = EventId::generate();
    pipeline.channel.push(fetched(
        &stream,
        vec![delivered_with_id(
            create_id,
            &pipeline.user,
            1,
            Some(room),
            message("original"),
        )],
        Priority::Background,
    ));
    pipeline.reports.recv().await.unwrap();

    pipeline.channel.push(fetched(
        &stream,
        vec![delivered(
            &pipeline.user,
            2,
            Some(room),
            EventBody::MessageEdit(MessageEdit {
                target: create_id,
                content: "revised".to_string(),
            }),
        )],
        Priority::Background,
    ));

    let report = pipeline.reports.recv().await.unwrap();
    assert_eq!(report.summary.applied, 1);
    assert_eq!(report.summary.stashed, 0);
}

// --------------------------------------------------------------------
// Cursor invariant: bounded by the event log
// --------------------------------------------------------------------

#[tokio::test]
async fn test_cursor_never_exceeds_event_log_max() {
    let mut pipeline = pipeline().await;
    let stream = stream();
    let room = RoomId::generate();

    let events: Vec<_> = (1..=7)
        .map(|i| delivered(&pipeline.user, i, Some(room), message(&format!("m{i}"))))
        .collect();
    pipeline
        .channel
        .push(fetched(&stream, events, Priority::Background));
    pipeline.reports.recv().await.unwrap();

    let cursor = pipeline.store.cursor(&stream).await.unwrap();
    let log_max = fixtures::int_cell(
        &pipeline.store,
        "SELECT MAX(stream_index) FROM event_log WHERE stream_id = ?1",
        &[SqlValue::from(stream.as_str())],
    )
    .await
    .unwrap();
    assert!(cursor.value() as i64 <= log_max);
    assert_eq!(cursor, StreamIndex::new(7));
}
