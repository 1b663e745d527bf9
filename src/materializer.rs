// Copyright (c) 2025 - Cowboy AI, Inc.
//! Materializer
//!
//! The single consumer of the event channel. Pulls one batch at a time,
//! looks up each event's transform in the schema registry, gates on
//! causal dependencies, applies mutations inside savepoints, advances
//! the stream cursor, and reports a summary with warnings.
//!
//! # Per-batch algorithm
//!
//! ```text
//! Batch ─> transform ─> profile fetch ─> apply (savepoints) ─> cursor
//!             │                             │
//!         InvalidEvent                  stash on missing deps
//!             │                             │
//!             └──────── warnings <── stash scan ──> re-enqueue ready
//! ```
//!
//! Events apply in ascending stream index, ties broken by event id.
//! Batches never interleave: everything in one batch settles before the
//! next batch is fetched, which is also the priority preemption
//! boundary.
//!
//! The event log records every terminally-disposed event (applied,
//! duplicate, skipped, errored); stashed events are non-terminal and
//! leave no trace until their dependencies arrive. The cursor advances
//! to the highest terminally-disposed index of the batch and never
//! regresses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::{ApplyResult, Batch, Bundle, Disposition, Priority};
use crate::channel::EventChannel;
use crate::errors::{SyncError, SyncResult};
use crate::event::Event;
use crate::identity::ProfileFetcher;
use crate::ids::{BatchId, EventId, StreamId, StreamIndex, UserId};
use crate::registry::{self, TransformContext};
use crate::store::{Store, StoreError};

/// Counts for one materialized batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializationSummary {
    pub applied: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub stashed: usize,
    pub errored: usize,
    pub statements_ok: usize,
    pub statements_failed: usize,
    /// Cursor after the batch committed
    pub cursor: StreamIndex,
    pub duration: Duration,
}

/// One failed store statement, with truncated SQL for the report
#[derive(Debug, Clone)]
pub struct FailedStatement {
    pub event_id: Option<EventId>,
    pub sql: String,
    pub message: String,
}

/// Warnings accumulated while materializing one batch
#[derive(Debug, Clone, Default)]
pub struct MaterializationWarnings {
    /// Events still waiting in the stash after this batch, with the
    /// dependencies they are missing
    pub stashed_waiting: Vec<(EventId, Vec<EventId>)>,

    /// Statements that failed inside event savepoints
    pub failed_statements: Vec<FailedStatement>,

    /// Events marked errored, with the failure message
    pub failed_events: Vec<(EventId, String)>,

    /// Unknown-type and validation failures
    pub invalid_events: Vec<(Option<EventId>, String)>,

    /// Out-of-band profile fetch failures
    pub profile_errors: Vec<String>,
}

impl MaterializationWarnings {
    pub fn is_empty(&self) -> bool {
        self.stashed_waiting.is_empty()
            && self.failed_statements.is_empty()
            && self.failed_events.is_empty()
            && self.invalid_events.is_empty()
            && self.profile_errors.is_empty()
    }
}

/// Emitted on the reporting channel after every batch
#[derive(Debug)]
pub struct MaterializationReport {
    pub batch_id: BatchId,
    pub stream_id: Option<StreamId>,
    pub summary: MaterializationSummary,
    pub warnings: MaterializationWarnings,
    /// The applied-stage batch with per-event outcomes
    pub outcome: Batch,
}

/// An event parked until its causal prerequisites materialize
#[derive(Debug, Clone)]
struct StashedEvent {
    stream_id: StreamId,
    event_id: EventId,
    stream_index: StreamIndex,
    mutations: Vec<crate::store::Mutation>,
    depends_on: Vec<EventId>,
    priority: Priority,
}

/// The single-consumer materialization loop
pub struct Materializer {
    channel: EventChannel,
    store: Arc<dyn Store>,
    profiles: Arc<dyn ProfileFetcher>,
    reports: mpsc::UnboundedSender<MaterializationReport>,
    /// Stash keyed by the first missing dependency of each parked event
    stash: HashMap<EventId, Vec<StashedEvent>>,
    savepoint_seq: u64,
}

impl Materializer {
    /// Build the materializer; the returned receiver is the reporting
    /// channel consumed by observability collaborators
    pub fn new(
        channel: EventChannel,
        store: Arc<dyn Store>,
        profiles: Arc<dyn ProfileFetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<MaterializationReport>) {
        let (reports, receiver) = mpsc::unbounded_channel();
        (
            Self {
                channel,
                store,
                profiles,
                reports,
                stash: HashMap::new(),
                savepoint_seq: 0,
            },
            receiver,
        )
    }

    /// Run until the channel closes
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consume batches one at a time; a catastrophic store failure
    /// aborts the batch (cursor untouched) and the loop continues — the
    /// events replay from the persisted cursor on reconnect.
    pub async fn run(mut self) {
        while let Some(batch) = self.channel.recv().await {
            let batch_id = batch.batch_id();
            if let Err(e) = self.process(batch).await {
                error!(batch = %batch_id, error = %e, "Batch aborted, will replay from cursor");
            }
        }
        debug!("Event channel closed, materializer stopping");
    }

    /// Number of events currently parked in the stash
    pub fn stash_len(&self) -> usize {
        self.stash.values().map(Vec::len).sum()
    }

    async fn process(&mut self, batch: Batch) -> SyncResult<()> {
        let started = Instant::now();
        let mut warnings = MaterializationWarnings::default();

        let (batch_id, stream_id, priority, mut bundles) = match batch {
            Batch::Fetched {
                batch_id,
                stream_id,
                events,
                priority,
            }
            | Batch::Live {
                batch_id,
                stream_id,
                events,
                priority,
            } => {
                let bundles = self
                    .transform_stage(&stream_id, &events, &mut warnings)
                    .await?;
                (batch_id, stream_id, priority, bundles)
            }
            Batch::Transformed {
                batch_id,
                stream_id,
                bundles,
                priority,
                ..
            } => (batch_id, stream_id, priority, bundles),
            Batch::Applied { batch_id, .. } => {
                debug!(batch = %batch_id, "Outcome batch on channel, ignoring");
                return Ok(());
            }
        };

        // Ascending stream index, ties by event id.
        bundles.sort_by_key(|bundle| match bundle {
            Bundle::Ready {
                stream_index,
                event_id,
                ..
            } => (1, *stream_index, Some(*event_id)),
            Bundle::InvalidEvent {
                stream_index,
                event_id,
                ..
            } => (
                1,
                stream_index.unwrap_or(StreamIndex::ZERO),
                *event_id,
            ),
            // Profile bundles run before any event mutation.
            Bundle::ProfileFetch { .. } => (0, StreamIndex::ZERO, None),
        });

        let (results, summary) = self
            .apply_stage(&stream_id, priority, bundles, &mut warnings, started)
            .await?;

        let outcome = Batch::Applied {
            batch_id,
            results,
            priority,
        };

        info!(
            batch = %batch_id,
            stream = %stream_id,
            applied = summary.applied,
            duplicates = summary.duplicates,
            stashed = summary.stashed,
            skipped = summary.skipped,
            errored = summary.errored,
            cursor = %summary.cursor,
            "Materialized batch"
        );
        if !warnings.is_empty() {
            warn!(
                batch = %batch_id,
                stream = %stream_id,
                stashed_waiting = warnings.stashed_waiting.len(),
                failed_statements = warnings.failed_statements.len(),
                invalid = warnings.invalid_events.len(),
                profile_errors = warnings.profile_errors.len(),
                "Materialization warnings"
            );
        }

        let _ = self.reports.send(MaterializationReport {
            batch_id,
            stream_id: Some(stream_id),
            summary,
            warnings,
            outcome,
        });
        Ok(())
    }

    /// Registry lookup, validation, transform, and the collapsed
    /// profile-fetch bundle
    async fn transform_stage(
        &self,
        stream_id: &StreamId,
        events: &[Event],
        warnings: &mut MaterializationWarnings,
    ) -> SyncResult<Vec<Bundle>> {
        let mut bundles = Vec::with_capacity(events.len());
        let mut profile_users: Vec<UserId> = Vec::new();

        for event in events {
            let Some(entry) = registry::lookup(event.type_tag()) else {
                let message = format!("unknown event type {}", event.type_tag());
                warnings
                    .invalid_events
                    .push((Some(event.id), message.clone()));
                bundles.push(Bundle::InvalidEvent {
                    event_id: Some(event.id),
                    stream_index: Some(event.stream_index),
                    message,
                });
                continue;
            };

            if let Err(e) = (entry.validate)(event) {
                let message = format!("validation failed: {e}");
                warnings
                    .invalid_events
                    .push((Some(event.id), message.clone()));
                bundles.push(Bundle::InvalidEvent {
                    event_id: Some(event.id),
                    stream_index: Some(event.stream_index),
                    message,
                });
                continue;
            }

            let ctx = TransformContext {
                stream_id: stream_id.clone(),
                user: event.user.clone(),
            };
            bundles.push(Bundle::Ready {
                event_id: event.id,
                stream_index: event.stream_index,
                mutations: (entry.transform)(&ctx, event),
                depends_on: (entry.depends_on)(event),
            });

            for user in (entry.profile_fetch)(event) {
                if !profile_users.contains(&user) {
                    profile_users.push(user);
                }
            }
        }

        // Deduplicated across the batch; users already materialized are
        // not fetched again.
        let mut missing_users = Vec::new();
        for user in profile_users {
            if !self.store.has_profile(&user).await.map_err(store_fatal)? {
                missing_users.push(user);
            }
        }
        if !missing_users.is_empty() {
            match self.profiles.fetch(&missing_users).await {
                Ok(profiles) => {
                    let mutations = profiles
                        .iter()
                        .flat_map(registry::profile_mutations)
                        .collect();
                    bundles.push(Bundle::ProfileFetch {
                        user_ids: missing_users,
                        mutations,
                    });
                }
                Err(e) => {
                    // Profile-derived rows are skipped; everything else
                    // in the batch continues.
                    warnings.profile_errors.push(e.to_string());
                }
            }
        }

        Ok(bundles)
    }

    /// Apply bundles inside a batch savepoint with one nested savepoint
    /// per event, then advance the cursor and rescan the stash
    async fn apply_stage(
        &mut self,
        stream_id: &StreamId,
        priority: Priority,
        bundles: Vec<Bundle>,
        warnings: &mut MaterializationWarnings,
        started: Instant,
    ) -> SyncResult<(Vec<ApplyResult>, MaterializationSummary)> {
        let mut summary = MaterializationSummary::default();
        let mut results = Vec::with_capacity(bundles.len());
        let mut recorded: Vec<EventId> = Vec::new();

        let cursor_start = self.store.cursor(stream_id).await.map_err(store_fatal)?;
        let mut terminal_max = cursor_start;

        self.store.savepoint("batch").await.map_err(store_fatal)?;

        let apply = async {
            for bundle in bundles {
                match bundle {
                    Bundle::ProfileFetch { user_ids, mutations } => {
                        debug!(users = user_ids.len(), "Applying fetched profiles");
                        for mutation in &mutations {
                            match self.store.execute(mutation).await {
                                Ok(_) => summary.statements_ok += 1,
                                Err(StoreError::Statement { sql, message }) => {
                                    summary.statements_failed += 1;
                                    warnings.failed_statements.push(FailedStatement {
                                        event_id: None,
                                        sql,
                                        message,
                                    });
                                }
                                Err(e) => return Err(store_fatal(e)),
                            }
                        }
                    }

                    Bundle::InvalidEvent {
                        event_id,
                        stream_index,
                        message,
                    } => {
                        if let Some(idx) = stream_index {
                            if idx <= cursor_start {
                                summary.duplicates += 1;
                                results.push(ApplyResult {
                                    event_id,
                                    stream_index,
                                    disposition: Disposition::Duplicate,
                                    detail: None,
                                });
                                continue;
                            }
                            // Record the skip so the cursor can pass it
                            // and replay stays silent.
                            if let Some(id) = event_id {
                                self.store
                                    .record_event(stream_id, &id, idx)
                                    .await
                                    .map_err(store_fatal)?;
                                recorded.push(id);
                            }
                            terminal_max = terminal_max.max(idx);
                        }
                        summary.skipped += 1;
                        results.push(ApplyResult {
                            event_id,
                            stream_index,
                            disposition: Disposition::Skipped,
                            detail: Some(message),
                        });
                    }

                    Bundle::Ready {
                        event_id,
                        stream_index,
                        mutations,
                        depends_on,
                    } => {
                        if stream_index <= cursor_start {
                            summary.duplicates += 1;
                            results.push(ApplyResult {
                                event_id: Some(event_id),
                                stream_index: Some(stream_index),
                                disposition: Disposition::Duplicate,
                                detail: None,
                            });
                            continue;
                        }

                        // Causal gate: every dependency must be in the
                        // event log (earlier batch events included).
                        let mut missing = Vec::new();
                        for dep in &depends_on {
                            if !self
                                .store
                                .contains_event(stream_id, dep)
                                .await
                                .map_err(store_fatal)?
                            {
                                missing.push(*dep);
                            }
                        }
                        if !missing.is_empty() {
                            debug!(
                                event = %event_id,
                                missing = missing.len(),
                                "Dependencies missing, stashing"
                            );
                            self.stash.entry(missing[0]).or_default().push(StashedEvent {
                                stream_id: stream_id.clone(),
                                event_id,
                                stream_index,
                                mutations,
                                depends_on,
                                priority,
                            });
                            summary.stashed += 1;
                            results.push(ApplyResult {
                                event_id: Some(event_id),
                                stream_index: Some(stream_index),
                                disposition: Disposition::Stashed,
                                detail: None,
                            });
                            continue;
                        }

                        let inserted = self
                            .store
                            .record_event(stream_id, &event_id, stream_index)
                            .await
                            .map_err(store_fatal)?;
                        terminal_max = terminal_max.max(stream_index);
                        if !inserted {
                            summary.duplicates += 1;
                            results.push(ApplyResult {
                                event_id: Some(event_id),
                                stream_index: Some(stream_index),
                                disposition: Disposition::Duplicate,
                                detail: None,
                            });
                            continue;
                        }
                        recorded.push(event_id);

                        self.savepoint_seq += 1;
                        let savepoint = format!("ev_{}", self.savepoint_seq);
                        self.store.savepoint(&savepoint).await.map_err(store_fatal)?;

                        let mut failed: Option<String> = None;
                        for mutation in &mutations {
                            match self.store.execute(mutation).await {
                                Ok(_) => summary.statements_ok += 1,
                                Err(StoreError::Statement { sql, message }) => {
                                    summary.statements_failed += 1;
                                    warnings.failed_statements.push(FailedStatement {
                                        event_id: Some(event_id),
                                        sql,
                                        message: message.clone(),
                                    });
                                    failed = Some(message);
                                    break;
                                }
                                Err(e) => return Err(store_fatal(e)),
                            }
                        }

                        match failed {
                            Some(message) => {
                                // The event's own mutations roll back;
                                // its event-log row (outside this
                                // savepoint) stays, so it is terminal.
                                self.store
                                    .rollback_to(&savepoint)
                                    .await
                                    .map_err(store_fatal)?;
                                self.store.release(&savepoint).await.map_err(store_fatal)?;
                                warnings.failed_events.push((event_id, message.clone()));
                                summary.errored += 1;
                                results.push(ApplyResult {
                                    event_id: Some(event_id),
                                    stream_index: Some(stream_index),
                                    disposition: Disposition::Errored,
                                    detail: Some(message),
                                });
                            }
                            None => {
                                self.store.release(&savepoint).await.map_err(store_fatal)?;
                                summary.applied += 1;
                                results.push(ApplyResult {
                                    event_id: Some(event_id),
                                    stream_index: Some(stream_index),
                                    disposition: Disposition::Applied,
                                    detail: None,
                                });
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = apply {
            // Catastrophic: abort the whole batch, cursor untouched.
            if let Err(rollback) = self.store.rollback_to("batch").await {
                error!(error = %rollback, "Rollback after batch failure also failed");
            }
            let _ = self.store.release("batch").await;
            return Err(e);
        }

        if terminal_max > cursor_start {
            self.store
                .set_cursor(stream_id, terminal_max)
                .await
                .map_err(store_fatal)?;
        }
        // Commit boundary: live queries fire here.
        self.store.release("batch").await.map_err(store_fatal)?;

        self.rescan_stash(&recorded).await?;
        warnings.stashed_waiting = self
            .stash
            .values()
            .flatten()
            .map(|stashed| (stashed.event_id, stashed.depends_on.clone()))
            .collect();

        summary.cursor = self.store.cursor(stream_id).await.map_err(store_fatal)?;
        summary.duration = started.elapsed();
        Ok((results, summary))
    }

    /// Release stashed events whose missing dependencies have arrived,
    /// re-enqueuing them as a transformed batch for the next iteration
    async fn rescan_stash(&mut self, recorded: &[EventId]) -> SyncResult<()> {
        let mut released: Vec<StashedEvent> = Vec::new();

        for id in recorded {
            let Some(candidates) = self.stash.remove(id) else {
                continue;
            };
            for stashed in candidates {
                let mut missing = Vec::new();
                for dep in &stashed.depends_on {
                    if !self
                        .store
                        .contains_event(&stashed.stream_id, dep)
                        .await
                        .map_err(store_fatal)?
                    {
                        missing.push(*dep);
                    }
                }
                if missing.is_empty() {
                    released.push(stashed);
                } else {
                    self.stash.entry(missing[0]).or_default().push(stashed);
                }
            }
        }

        if released.is_empty() {
            return Ok(());
        }

        // Group per stream so each re-enqueued batch stays single-stream.
        let mut by_stream: HashMap<StreamId, Vec<StashedEvent>> = HashMap::new();
        for stashed in released {
            by_stream
                .entry(stashed.stream_id.clone())
                .or_default()
                .push(stashed);
        }

        for (stream_id, group) in by_stream {
            let priority = if group
                .iter()
                .any(|stashed| stashed.priority == Priority::Foreground)
            {
                Priority::Foreground
            } else {
                Priority::Background
            };
            let latest_index = group
                .iter()
                .map(|stashed| stashed.stream_index)
                .max()
                .unwrap_or(StreamIndex::ZERO);
            let bundles = group
                .into_iter()
                .map(|stashed| Bundle::Ready {
                    event_id: stashed.event_id,
                    stream_index: stashed.stream_index,
                    mutations: stashed.mutations,
                    depends_on: stashed.depends_on,
                })
                .collect::<Vec<_>>();

            debug!(
                stream = %stream_id,
                released = bundles.len(),
                "Stash released events for re-application"
            );
            self.channel.push(Batch::Transformed {
                batch_id: BatchId::generate(),
                stream_id,
                bundles,
                latest_index,
                priority,
            });
        }
        Ok(())
    }
}

/// Store failures outside single-statement scope abort the batch
fn store_fatal(err: StoreError) -> SyncError {
    match err {
        StoreError::Statement { sql, message } => {
            SyncError::StoreTransaction(format!("{message} ({sql})"))
        }
        StoreError::Transaction(message) | StoreError::Connection(message) => {
            SyncError::StoreTransaction(message)
        }
    }
}
