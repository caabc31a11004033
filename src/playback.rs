//! Authoritative playback state
//!
//! The state machine is advanced only through `apply`, called by the
//! reconciliation engine with already-arbitrated events. It performs no
//! validation of its own beyond asserting that `sequence` increases by
//! exactly one; a violation means the reconciler is broken and the session
//! cannot be safely patched.
//!
//! Position advances implicitly: the machine is a pure function of
//! (state, elapsed reference time) and is never driven by a timer.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Lifecycle phase of a session's playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// No playback yet (initial).
    Idle,
    Playing,
    Paused,
    /// A seek was accepted and we are waiting for the originator to report
    /// the target reached; collapses back to Playing/Paused.
    Seeking,
    /// Video exhausted (terminal).
    Ended,
    /// Session destroyed (terminal).
    Closed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Ended | Phase::Closed)
    }
}

/// The single authoritative playback snapshot all members are steered
/// toward. Immutable; a new one replaces the old atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub position_seconds: f64,
    pub is_playing: bool,
    pub rate: f64,
    /// Strictly increasing, unique per session.
    pub sequence: u64,
    /// Member whose event produced this state; `None` for the initial state.
    pub originating_member: Option<String>,
    /// Reference time at which this state took effect.
    pub accepted_at_reference_ms: u64,
}

impl PlaybackState {
    fn initial(now_ms: u64) -> Self {
        Self {
            position_seconds: 0.0,
            is_playing: false,
            rate: 1.0,
            sequence: 0,
            originating_member: None,
            accepted_at_reference_ms: now_ms,
        }
    }
}

/// What an accepted event does to playback.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptedAction {
    Play,
    Pause,
    Seek { target_seconds: f64 },
}

/// An event that won arbitration, stamped with its sequence number.
#[derive(Debug, Clone)]
pub struct AcceptedEvent {
    pub sequence: u64,
    pub member_id: String,
    pub action: AcceptedAction,
    pub reference_ms: u64,
}

/// Owns the authoritative state for one session.
#[derive(Debug)]
pub struct PlaybackStateMachine {
    phase: Phase,
    current: PlaybackState,
    known_duration_seconds: Option<f64>,
}

impl PlaybackStateMachine {
    pub fn new(now_ms: u64) -> Self {
        Self {
            phase: Phase::Idle,
            current: PlaybackState::initial(now_ms),
            known_duration_seconds: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current(&self) -> &PlaybackState {
        &self.current
    }

    pub fn known_duration_seconds(&self) -> Option<f64> {
        self.known_duration_seconds
    }

    /// Record the video duration once client metadata reports it. Advisory;
    /// only used to clamp seeks and detect the end of the video.
    pub fn set_known_duration(&mut self, duration_seconds: f64) {
        if duration_seconds > 0.0 {
            self.known_duration_seconds = Some(duration_seconds);
        }
    }

    /// Where the squad is at `reference_now_ms`, extrapolated from the last
    /// accepted state.
    pub fn position_at(&self, reference_now_ms: u64) -> f64 {
        let mut pos = self.current.position_seconds;
        if self.current.is_playing {
            let elapsed_ms =
                reference_now_ms.saturating_sub(self.current.accepted_at_reference_ms);
            pos += self.current.rate * elapsed_ms as f64 / 1000.0;
        }
        if let Some(duration) = self.known_duration_seconds {
            pos = pos.min(duration);
        }
        pos
    }

    /// Apply an arbitrated event, producing the next authoritative state.
    ///
    /// The only check is the sequence invariant: `event.sequence` must be
    /// exactly one more than the current sequence.
    pub fn apply(&mut self, event: AcceptedEvent) -> Result<&PlaybackState, SyncError> {
        if self.phase == Phase::Closed {
            return Err(SyncError::SessionClosed);
        }
        if event.sequence != self.current.sequence + 1 {
            return Err(SyncError::InvariantViolation(format!(
                "sequence {} applied on top of {}",
                event.sequence, self.current.sequence
            )));
        }

        let position_now = self.position_at(event.reference_ms);
        let (mut position, mut is_playing, mut phase) = match event.action {
            AcceptedAction::Play => (position_now, true, Phase::Playing),
            AcceptedAction::Pause => (position_now, false, Phase::Paused),
            AcceptedAction::Seek { target_seconds } => {
                // Preserves play/pause; collapses out of Seeking when the
                // originator reports the target reached.
                (target_seconds, self.current.is_playing, Phase::Seeking)
            }
        };

        // A transition landing at or past the known duration ends the video
        if let Some(duration) = self.known_duration_seconds {
            if position >= duration {
                position = duration;
                is_playing = false;
                phase = Phase::Ended;
            }
        }

        self.phase = phase;
        self.current = PlaybackState {
            position_seconds: position,
            is_playing,
            rate: self.current.rate,
            sequence: event.sequence,
            originating_member: Some(event.member_id),
            accepted_at_reference_ms: event.reference_ms,
        };
        Ok(&self.current)
    }

    /// Collapse a transient `Seeking` phase back to Playing/Paused.
    pub fn confirm_seek(&mut self) {
        if self.phase == Phase::Seeking {
            self.phase = if self.current.is_playing {
                Phase::Playing
            } else {
                Phase::Paused
            };
        }
    }

    /// Collapse a stuck `Seeking` phase when `member_id` was the seek
    /// originator and can no longer confirm it (left or timed out).
    pub fn abandon_seek(&mut self, member_id: &str) {
        if self.phase == Phase::Seeking
            && self.current.originating_member.as_deref() == Some(member_id)
        {
            tracing::debug!("seek originator {} gone, collapsing seek", member_id);
            self.confirm_seek();
        }
    }

    /// Whether continuous playback has run past the known duration. The
    /// transition itself goes through [`Self::finish`] so it is sequenced
    /// and broadcast like any other accepted transition.
    pub fn is_exhausted(&self, reference_now_ms: u64) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        match self.known_duration_seconds {
            Some(duration) => {
                self.current.is_playing && self.position_at(reference_now_ms) >= duration
            }
            None => false,
        }
    }

    /// End-of-video transition. Consumes a sequence number so members
    /// replaying the broadcast stream pick it up instead of discarding it
    /// as a duplicate.
    pub fn finish(
        &mut self,
        sequence: u64,
        reference_now_ms: u64,
    ) -> Result<&PlaybackState, SyncError> {
        if self.phase == Phase::Closed {
            return Err(SyncError::SessionClosed);
        }
        if sequence != self.current.sequence + 1 {
            return Err(SyncError::InvariantViolation(format!(
                "sequence {} applied on top of {}",
                sequence, self.current.sequence
            )));
        }
        let position = self
            .known_duration_seconds
            .unwrap_or_else(|| self.position_at(reference_now_ms));
        tracing::info!("playback reached end of video ({position:.1}s)");
        self.phase = Phase::Ended;
        self.current = PlaybackState {
            position_seconds: position,
            is_playing: false,
            rate: self.current.rate,
            sequence,
            originating_member: None,
            accepted_at_reference_ms: reference_now_ms,
        };
        Ok(&self.current)
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }

    /// Member-side replay of a broadcast state. Idempotent: a state with a
    /// sequence at or below the current one is a no-op, so duplicate
    /// delivery over an at-least-once channel is harmless.
    pub fn observe(&mut self, state: PlaybackState) -> bool {
        if state.sequence <= self.current.sequence && self.phase != Phase::Idle {
            return false;
        }
        if self.phase == Phase::Idle && state.sequence == 0 {
            // Initial snapshot on join; adopt position without a transition
            self.current = state;
            return false;
        }
        self.phase = if state.is_playing {
            Phase::Playing
        } else {
            Phase::Paused
        };
        self.current = state;
        true
    }
}
