//! Sync protocol payloads
//!
//! Channel-agnostic message shapes exchanged with member transports. The
//! engine consumes an ordered, at-least-once channel; duplicate delivery of
//! a `State` broadcast is harmless because replay with an unchanged
//! sequence is a no-op on the receiving state machine.

use serde::{Deserialize, Serialize};

use crate::clock::ClockSample;
use crate::playback::PlaybackState;
use crate::session::roster::Role;

/// The closed set of member actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Play,
    Pause,
    Seek,
    Heartbeat,
}

/// A member action submitted for reconciliation. Transient: it is either
/// accepted (becomes the next `PlaybackState`) or dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub kind: EventKind,

    /// Seek destination in seconds; required for `Seek`, ignored otherwise.
    pub target_position_seconds: Option<f64>,

    /// The member's local clock when the action happened.
    pub member_local_ms: u64,

    /// The member's view of the latest accepted sequence, used to spot
    /// stale submissions in logs.
    pub member_sequence_hint: Option<u64>,

    /// Heartbeat only: the position the member's player currently shows.
    pub reported_position_seconds: Option<f64>,

    /// Heartbeat only: video duration once the member's player metadata
    /// has loaded. Advisory until every client agrees.
    pub known_duration_seconds: Option<f64>,

    /// Heartbeat only: the completed four-timestamp round trip echoing the
    /// previous `TimeSync` reply, which feeds the member's clock estimate.
    pub time_sync_echo: Option<ClockSample>,
}

impl CandidateEvent {
    pub fn heartbeat(member_local_ms: u64, reported_position_seconds: f64) -> Self {
        Self {
            kind: EventKind::Heartbeat,
            target_position_seconds: None,
            member_local_ms,
            member_sequence_hint: None,
            reported_position_seconds: Some(reported_position_seconds),
            known_duration_seconds: None,
            time_sync_echo: None,
        }
    }

    pub fn play(member_local_ms: u64) -> Self {
        Self {
            kind: EventKind::Play,
            target_position_seconds: None,
            member_local_ms,
            member_sequence_hint: None,
            reported_position_seconds: None,
            known_duration_seconds: None,
            time_sync_echo: None,
        }
    }

    pub fn pause(member_local_ms: u64) -> Self {
        Self {
            kind: EventKind::Pause,
            ..Self::play(member_local_ms)
        }
    }

    pub fn seek(member_local_ms: u64, target_position_seconds: f64) -> Self {
        Self {
            kind: EventKind::Seek,
            target_position_seconds: Some(target_position_seconds),
            ..Self::play(member_local_ms)
        }
    }
}

/// Messages a member sends to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    Join { member_id: String, role: Role },
    Event { member_id: String, event: CandidateEvent },
    Leave { member_id: String },
}

/// Messages the coordinator pushes to a member's transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The authoritative state. Sent on every accepted transition, as the
    /// join reply, and restated verbatim as a drift correction.
    State(PlaybackState),

    /// Reply to a heartbeat carrying the timestamps the member needs to
    /// complete a clock sample.
    TimeSync {
        client_send_ms: u64,
        server_receive_ms: u64,
        server_send_ms: u64,
    },

    /// The session cannot serve this member any longer (unknown member, or
    /// the session was torn down); a fresh join is required.
    Rejoin { reason: String },
}
