// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transforms for Personal-Stream Events
//!
//! The personal stream materializes into the profile, membership, and
//! read-marker tables that drive the supervisor's reactions: a join row
//! appearing opens a stream connection, a join row vanishing closes
//! one.

use crate::event::{Event, EventBody, ValidationError};
use crate::identity::FetchedProfile;
use crate::store::{Mutation, SqlValue};

use super::{event_time, TransformContext};

fn body_mismatch(tag: &'static str) -> ValidationError {
    ValidationError::InvalidField {
        field: "type",
        reason: format!("body does not match tag {tag}"),
    }
}

// ---------------------------------------------------------------------
// profile.update
// ---------------------------------------------------------------------

pub(super) fn validate_profile_update(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::ProfileUpdate(b) => b.validate(),
        _ => Err(body_mismatch("user.profile.update.v0")),
    }
}

pub(super) fn transform_profile_update(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let body = match &event.body {
        EventBody::ProfileUpdate(b) => b,
        _ => return Vec::new(),
    };

    // Patch semantics: absent fields keep their current value.
    vec![Mutation::new(
        "INSERT INTO profiles (user_id, display_name, avatar, status_line) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(user_id) DO UPDATE SET \
         display_name = COALESCE(excluded.display_name, display_name), \
         avatar = COALESCE(excluded.avatar, avatar), \
         status_line = COALESCE(excluded.status_line, status_line)",
        vec![
            SqlValue::from(ctx.user.as_str()),
            SqlValue::from(body.display_name.clone()),
            SqlValue::from(body.avatar.clone()),
            SqlValue::from(body.status_line.clone()),
        ],
    )]
}

// ---------------------------------------------------------------------
// space.join / space.leave
// ---------------------------------------------------------------------

pub(super) fn validate_space_join(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::SpaceJoin(b) => b.validate(),
        _ => Err(body_mismatch("user.space.join.v0")),
    }
}

pub(super) fn transform_space_join(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let body = match &event.body {
        EventBody::SpaceJoin(b) => b,
        _ => return Vec::new(),
    };

    vec![Mutation::new(
        "INSERT OR IGNORE INTO joined_spaces (user_id, stream_id, joined_at) \
         VALUES (?1, ?2, ?3)",
        vec![
            SqlValue::from(ctx.user.as_str()),
            SqlValue::from(body.stream.as_str()),
            SqlValue::from(event_time(event.id)),
        ],
    )]
}

pub(super) fn validate_space_leave(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::SpaceLeave(b) => b.validate(),
        _ => Err(body_mismatch("user.space.leave.v0")),
    }
}

/// Membership row is removed; materialized space rows are retained so
/// history is still there on a later re-join.
pub(super) fn transform_space_leave(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let body = match &event.body {
        EventBody::SpaceLeave(b) => b,
        _ => return Vec::new(),
    };

    vec![Mutation::new(
        "DELETE FROM joined_spaces WHERE user_id = ?1 AND stream_id = ?2",
        vec![
            SqlValue::from(ctx.user.as_str()),
            SqlValue::from(body.stream.as_str()),
        ],
    )]
}

// ---------------------------------------------------------------------
// room.lastRead
// ---------------------------------------------------------------------

pub(super) fn validate_last_read(event: &Event) -> Result<(), ValidationError> {
    match &event.body {
        EventBody::LastReadSet(b) => b.validate(),
        _ => Err(body_mismatch("user.room.lastRead.v0")),
    }
}

pub(super) fn transform_last_read(ctx: &TransformContext, event: &Event) -> Vec<Mutation> {
    let body = match &event.body {
        EventBody::LastReadSet(b) => b,
        _ => return Vec::new(),
    };

    // Markers only move forward; a replayed older marker is a no-op.
    vec![Mutation::new(
        "INSERT INTO read_markers (user_id, stream_id, room_id, last_read_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(user_id, stream_id, room_id) DO UPDATE SET \
         last_read_at = MAX(last_read_at, excluded.last_read_at)",
        vec![
            SqlValue::from(ctx.user.as_str()),
            SqlValue::from(body.stream.as_str()),
            SqlValue::from(body.room.to_string()),
            SqlValue::from(body.at.to_rfc3339()),
        ],
    )]
}

// ---------------------------------------------------------------------
// Out-of-band profile fetches
// ---------------------------------------------------------------------

/// Mutations for a profile record fetched from the identity service.
///
/// Fetched values never clobber values the user set through
/// `profile.update` events; they only fill gaps.
pub fn profile_mutations(profile: &FetchedProfile) -> Vec<Mutation> {
    vec![Mutation::new(
        "INSERT INTO profiles (user_id, display_name, avatar) VALUES (?1, ?2, ?3) \
         ON CONFLICT(user_id) DO UPDATE SET \
         display_name = COALESCE(display_name, excluded.display_name), \
         avatar = COALESCE(avatar, excluded.avatar)",
        vec![
            SqlValue::from(profile.user.as_str()),
            SqlValue::from(profile.display_name.clone()),
            SqlValue::from(profile.avatar.clone()),
        ],
    )]
}
