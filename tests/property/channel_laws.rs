// Copyright (c) 2025 - Cowboy AI, Inc.
//! Channel Scheduling Laws
//!
//! For any push sequence, a consumer that starts afterwards drains
//! every foreground batch before any background batch, FIFO within
//! each class.

use futures::executor::block_on;
use proptest::prelude::*;

use tidemark::{Batch, BatchId, EventChannel, Priority, StreamId};

fn batch(label: usize, priority: Priority) -> Batch {
    let class = match priority {
        Priority::Foreground => "fg",
        Priority::Background => "bg",
    };
    Batch::Fetched {
        batch_id: BatchId::generate(),
        stream_id: StreamId::new(format!("{class}-{label}")).unwrap(),
        events: vec![],
        priority,
    }
}

proptest! {
    /// Strict priority with FIFO per class, for any push order
    #[test]
    fn prop_drain_order_is_stable_partition(
        priorities in proptest::collection::vec(any::<bool>(), 0..40)
    ) {
        let channel = EventChannel::default();

        let mut expected_foreground = Vec::new();
        let mut expected_background = Vec::new();
        for (i, foreground) in priorities.iter().enumerate() {
            let priority = if *foreground {
                Priority::Foreground
            } else {
                Priority::Background
            };
            let label = format!("{}-{}", if *foreground { "fg" } else { "bg" }, i);
            if *foreground {
                expected_foreground.push(label);
            } else {
                expected_background.push(label);
            }
            channel.push(batch(i, priority));
        }
        channel.close();

        let mut drained = Vec::new();
        while let Some(batch) = block_on(channel.recv()) {
            drained.push(batch.stream_id().unwrap().to_string());
        }

        let mut expected = expected_foreground;
        expected.extend(expected_background);
        prop_assert_eq!(drained, expected);
    }

    /// Close terminates after the drain, never before
    #[test]
    fn prop_close_drains_all_items(count in 0usize..30) {
        let channel = EventChannel::default();
        for i in 0..count {
            channel.push(batch(i, Priority::Background));
        }
        channel.close();

        let mut seen = 0;
        while block_on(channel.recv()).is_some() {
            seen += 1;
        }
        prop_assert_eq!(seen, count);
    }
}
