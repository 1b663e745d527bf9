// Copyright (c) 2025 - Cowboy AI, Inc.
//! Priority Event Channel
//!
//! The single shared structure between the stream connections (many
//! producers) and the materializer (one consumer). Two priority
//! classes, strict precedence, FIFO within a class:
//!
//! ```text
//! ConnectedStream ──┐
//! ConnectedStream ──┼── push ──> [foreground | background] ── recv ──> Materializer
//! ConnectedStream ──┘
//! ```
//!
//! A consumer fetching while both queues hold items always receives
//! every foreground item before any background item. There is no aging;
//! preemption happens at batch boundaries only, because the consumer
//! finishes one batch before fetching the next.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

use crate::batch::{Batch, Priority};
use crate::ids::StreamId;

/// Tuning for the channel's advisory depth warning
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Queue depth at which a warning is logged. Pushes never block or
    /// fail; the warning is advisory only.
    pub warn_depth: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { warn_depth: 1024 }
    }
}

#[derive(Default)]
struct Queues {
    foreground: VecDeque<Batch>,
    background: VecDeque<Batch>,
    closed: bool,
}

impl Queues {
    fn len(&self) -> usize {
        self.foreground.len() + self.background.len()
    }

    fn pop(&mut self) -> Option<Batch> {
        self.foreground
            .pop_front()
            .or_else(|| self.background.pop_front())
    }
}

/// Two-class strict-priority mailbox with a single consumer
///
/// Cloning shares the same queues; the consumer discipline (exactly one
/// task calling [`EventChannel::recv`]) is the caller's responsibility.
#[derive(Clone)]
pub struct EventChannel {
    queues: Arc<Mutex<Queues>>,
    notify: Arc<Notify>,
    config: ChannelConfig,
}

impl EventChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues::default())),
            notify: Arc::new(Notify::new()),
            config,
        }
    }

    /// Append a batch to the tail of its priority class. Non-blocking;
    /// pushing after close drops the batch.
    pub fn push(&self, batch: Batch) {
        {
            let mut queues = match self.queues.lock() {
                Ok(queues) => queues,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queues.closed {
                warn!(batch_id = %batch.batch_id(), "Channel closed, dropping batch");
                return;
            }
            match batch.priority() {
                Priority::Foreground => queues.foreground.push_back(batch),
                Priority::Background => queues.background.push_back(batch),
            }
            if queues.len() == self.config.warn_depth {
                warn!(
                    depth = queues.len(),
                    "Event channel depth reached warning threshold"
                );
            }
        }
        self.notify.notify_one();
    }

    /// Mark end-of-stream. Already queued items still drain; after
    /// that, [`EventChannel::recv`] returns `None`.
    pub fn close(&self) {
        {
            let mut queues = match self.queues.lock() {
                Ok(queues) => queues,
                Err(poisoned) => poisoned.into_inner(),
            };
            queues.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Fetch the next batch: all foreground items first, then
    /// background, FIFO within each class. Returns `None` once the
    /// channel is closed and drained.
    pub async fn recv(&self) -> Option<Batch> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queues = match self.queues.lock() {
                    Ok(queues) => queues,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(batch) = queues.pop() {
                    return Some(batch);
                }
                if queues.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Discard pending batches for one stream (unsubscribe support)
    pub fn drop_stream(&self, stream_id: &StreamId) {
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        queues
            .foreground
            .retain(|b| b.stream_id() != Some(stream_id));
        queues
            .background
            .retain(|b| b.stream_id() != Some(stream_id));
    }

    /// Current total depth across both classes
    pub fn depth(&self) -> usize {
        match self.queues.lock() {
            Ok(queues) => queues.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}
