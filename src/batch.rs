// Copyright (c) 2025 - Cowboy AI, Inc.
//! Pipeline Batch Types
//!
//! A batch is the unit that moves through the pipeline: delivered by a
//! stream connection, transformed by the schema registry, applied by
//! the materializer. Each stage is a variant of [`Batch`], so the stage
//! an item is in is always explicit in its type.

use crate::event::Event;
use crate::ids::{BatchId, EventId, StreamId, StreamIndex, UserId};
use crate::store::Mutation;

/// Two-class scheduling label carried by every batch
///
/// Foreground batches (personal stream, live pushes) always drain
/// before background batches (backfill) at the channel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Foreground,
    Background,
}

/// A batch at one stage of the pipeline
#[derive(Debug, Clone)]
pub enum Batch {
    /// Rows delivered by backfill
    Fetched {
        batch_id: BatchId,
        stream_id: StreamId,
        events: Vec<Event>,
        priority: Priority,
    },

    /// Rows delivered by the live tail
    Live {
        batch_id: BatchId,
        stream_id: StreamId,
        events: Vec<Event>,
        priority: Priority,
    },

    /// Events already transformed into mutation bundles; produced when
    /// the stash releases events whose dependencies arrived
    Transformed {
        batch_id: BatchId,
        stream_id: StreamId,
        bundles: Vec<Bundle>,
        latest_index: StreamIndex,
        priority: Priority,
    },

    /// Outcome record for an applied batch
    Applied {
        batch_id: BatchId,
        results: Vec<ApplyResult>,
        priority: Priority,
    },
}

impl Batch {
    pub fn batch_id(&self) -> BatchId {
        match self {
            Batch::Fetched { batch_id, .. }
            | Batch::Live { batch_id, .. }
            | Batch::Transformed { batch_id, .. }
            | Batch::Applied { batch_id, .. } => *batch_id,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Batch::Fetched { priority, .. }
            | Batch::Live { priority, .. }
            | Batch::Transformed { priority, .. }
            | Batch::Applied { priority, .. } => *priority,
        }
    }

    /// Stream this batch belongs to; outcome batches aggregate per
    /// batch id and carry no stream
    pub fn stream_id(&self) -> Option<&StreamId> {
        match self {
            Batch::Fetched { stream_id, .. }
            | Batch::Live { stream_id, .. }
            | Batch::Transformed { stream_id, .. } => Some(stream_id),
            Batch::Applied { .. } => None,
        }
    }
}

/// One event's worth of work inside a transformed batch
#[derive(Debug, Clone)]
pub enum Bundle {
    /// Event transformed successfully and ready to apply once its
    /// dependencies are present
    Ready {
        event_id: EventId,
        stream_index: StreamIndex,
        mutations: Vec<Mutation>,
        depends_on: Vec<EventId>,
    },

    /// Collapsed out-of-band profile lookup for the whole batch
    ProfileFetch {
        user_ids: Vec<UserId>,
        mutations: Vec<Mutation>,
    },

    /// Validation or registry failure; the event is skipped with a
    /// warning and never blocks the rest of the batch
    InvalidEvent {
        event_id: Option<EventId>,
        stream_index: Option<StreamIndex>,
        message: String,
    },
}

/// Terminal disposition of one event after an apply pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Mutations committed
    Applied,
    /// Already present in the event log; replay was a no-op
    Duplicate,
    /// Skipped with a warning (unknown type, validation failure)
    Skipped,
    /// Waiting in the stash for missing dependencies
    Stashed,
    /// A mutation failed; the event's changes were rolled back
    Errored,
}

/// Per-event outcome record inside an [`Batch::Applied`]
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub event_id: Option<EventId>,
    pub stream_index: Option<StreamIndex>,
    pub disposition: Disposition,
    pub detail: Option<String>,
}
