//! Conflict resolution for candidate events
//!
//! Turns candidate events from multiple members into a single ordered
//! stream of accepted transitions. Candidates arrive already converted to
//! reference time (the coordinator does the clock lookup and falls back to
//! arrival time for unsynced members).
//!
//! The first play/pause/seek opens a debounce epoch; anything landing
//! inside the window contends against the provisional winner and exactly
//! one candidate survives the flush. The contest is deterministic and
//! total: a host event always beats a participant event; among hosts the
//! later adjusted time wins (last-writer-wins); among participants the
//! earlier adjusted time wins; exact ties break by member id. Losing a
//! contest is not an error - co-watching clients routinely fire a
//! near-simultaneous pause.

use std::collections::HashMap;

use crate::config::SyncConfig;
use crate::playback::{AcceptedAction, AcceptedEvent};
use crate::session::roster::Role;

/// A candidate already adjusted to reference time.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub member_id: String,
    pub role: Role,
    pub action: AcceptedAction,
    /// Ordering key: the member's local timestamp converted to reference
    /// time, or the arrival time when the member is unsynced.
    pub adjusted_ms: u64,
}

/// What happened to a submitted candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Opened a new epoch; the coordinator should flush at this deadline.
    Scheduled { flush_at_ms: u64 },
    /// Replaced the provisional winner of the open epoch.
    Superseded,
    /// Lost the contest and was dropped.
    Dropped,
}

/// Result of flushing a due epoch.
#[derive(Debug, Clone)]
pub enum Flush {
    /// The winner, stamped with the next sequence number.
    Accepted(AcceptedEvent),
    /// A seek landed within epsilon of the authoritative position; restate
    /// the current state to the originator instead of transitioning.
    Coalesced { member_id: String },
}

/// Per-member drift observed from heartbeats.
#[derive(Debug, Clone, Copy)]
pub struct DriftStats {
    /// Positive = member is ahead of the authoritative position.
    pub drift_seconds: f64,
    pub last_report_ms: u64,
    /// Whether the member's clock was synced when this was measured.
    pub synced: bool,
}

#[derive(Debug)]
struct Epoch {
    flush_at_ms: u64,
    winner: Candidate,
}

/// Orders, arbitrates, and sequences candidate events for one session.
#[derive(Debug)]
pub struct ReconciliationEngine {
    debounce_window_ms: u64,
    seek_epsilon_seconds: f64,
    epoch: Option<Epoch>,
    next_sequence: u64,
    drift: HashMap<String, DriftStats>,
}

impl ReconciliationEngine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            debounce_window_ms: config.debounce_window_ms,
            seek_epsilon_seconds: config.seek_epsilon_seconds,
            epoch: None,
            next_sequence: 1,
            drift: HashMap::new(),
        }
    }

    /// Deadline of the open epoch, if any; drives the coordinator's timer.
    pub fn next_flush_at_ms(&self) -> Option<u64> {
        self.epoch.as_ref().map(|e| e.flush_at_ms)
    }

    /// Submit a play/pause/seek candidate. Heartbeats do not come through
    /// here; they never open or join an epoch.
    pub fn submit(&mut self, candidate: Candidate, now_ms: u64) -> Submission {
        match &mut self.epoch {
            Some(epoch) => {
                if beats(&candidate, &epoch.winner) {
                    tracing::debug!(
                        "epoch contest: {} ({:?}) supersedes {} ({:?})",
                        candidate.member_id,
                        candidate.role,
                        epoch.winner.member_id,
                        epoch.winner.role,
                    );
                    epoch.winner = candidate;
                    Submission::Superseded
                } else {
                    tracing::debug!(
                        "epoch contest: dropping {} ({:?}), {} holds the epoch",
                        candidate.member_id,
                        candidate.role,
                        epoch.winner.member_id,
                    );
                    Submission::Dropped
                }
            }
            None => {
                let flush_at_ms = now_ms + self.debounce_window_ms;
                self.epoch = Some(Epoch {
                    flush_at_ms,
                    winner: candidate,
                });
                Submission::Scheduled { flush_at_ms }
            }
        }
    }

    /// Flush the open epoch if its window has elapsed.
    ///
    /// `position_now` is the current authoritative position and
    /// `known_duration` the advisory duration bound for seek clamping.
    pub fn flush_due(
        &mut self,
        now_ms: u64,
        position_now: f64,
        known_duration: Option<f64>,
    ) -> Option<Flush> {
        if self.epoch.as_ref()?.flush_at_ms > now_ms {
            return None;
        }
        let epoch = self.epoch.take()?;
        let Candidate {
            member_id, action, ..
        } = epoch.winner;

        let action = match action {
            AcceptedAction::Seek { target_seconds } => {
                let clamped = clamp_seek(target_seconds, known_duration);
                if (clamped - position_now).abs() < self.seek_epsilon_seconds {
                    tracing::debug!(
                        "seek by {} to {:.2}s within {:.1}s of current {:.2}s, coalescing",
                        member_id,
                        clamped,
                        self.seek_epsilon_seconds,
                        position_now,
                    );
                    return Some(Flush::Coalesced { member_id });
                }
                AcceptedAction::Seek {
                    target_seconds: clamped,
                }
            }
            other => other,
        };

        let sequence = self.allocate_sequence();
        Some(Flush::Accepted(AcceptedEvent {
            sequence,
            member_id,
            action,
            reference_ms: now_ms,
        }))
    }

    /// Allocate the next sequence number. Flushes consume these, as do
    /// transitions the coordinator originates itself (end of video), so
    /// the accepted stream stays contiguous.
    pub fn allocate_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Discard any pending epoch without consuming a sequence number.
    pub fn clear_pending(&mut self) {
        self.epoch = None;
    }

    /// Discard a pending epoch won by a member that left before the flush.
    /// A left member can never originate an accepted event.
    pub fn drop_pending_from(&mut self, member_id: &str) {
        if let Some(epoch) = &self.epoch {
            if epoch.winner.member_id == member_id {
                tracing::debug!("dropping pending epoch from departed member {}", member_id);
                self.epoch = None;
            }
        }
    }

    /// Record a heartbeat's position report. Returns true when the member
    /// has drifted past epsilon and deserves a corrective broadcast -
    /// but only for synced members: strict correction is suppressed until
    /// the clock estimate is trustworthy.
    pub fn record_heartbeat(
        &mut self,
        member_id: &str,
        reported_position: f64,
        expected_position: f64,
        synced: bool,
        now_ms: u64,
    ) -> bool {
        let drift_seconds = reported_position - expected_position;
        self.drift.insert(
            member_id.to_string(),
            DriftStats {
                drift_seconds,
                last_report_ms: now_ms,
                synced,
            },
        );
        let correct = synced && drift_seconds.abs() > self.seek_epsilon_seconds;
        if correct {
            tracing::debug!(
                "member {} drifted {:+.2}s, scheduling correction",
                member_id,
                drift_seconds
            );
        }
        correct
    }

    pub fn drift_stats(&self, member_id: &str) -> Option<DriftStats> {
        self.drift.get(member_id).copied()
    }

    pub fn all_drift_stats(&self) -> impl Iterator<Item = (&str, DriftStats)> {
        self.drift.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn forget_member(&mut self, member_id: &str) {
        self.drift.remove(member_id);
        self.drop_pending_from(member_id);
    }
}

/// Seek targets clamp to `[0, duration]`; the duration bound is advisory
/// and only applies once metadata has reported it.
fn clamp_seek(target_seconds: f64, known_duration: Option<f64>) -> f64 {
    let mut clamped = target_seconds.max(0.0);
    if let Some(duration) = known_duration {
        if clamped > duration {
            tracing::warn!(
                "seek target {:.2}s beyond known duration {:.2}s, clamping",
                clamped,
                duration
            );
            clamped = duration;
        }
    } else if clamped != target_seconds {
        tracing::warn!("negative seek target {:.2}s, clamping to 0", target_seconds);
    }
    clamped
}

/// Whether `challenger` takes the epoch from the provisional `holder`.
fn beats(challenger: &Candidate, holder: &Candidate) -> bool {
    use std::cmp::Ordering;
    match (challenger.role, holder.role) {
        (Role::Host, Role::Participant) => true,
        (Role::Participant, Role::Host) => false,
        // Host vs host: last writer wins
        (Role::Host, Role::Host) => match challenger.adjusted_ms.cmp(&holder.adjusted_ms) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => challenger.member_id < holder.member_id,
        },
        // Participant vs participant: earliest adjusted time wins
        (Role::Participant, Role::Participant) => {
            match challenger.adjusted_ms.cmp(&holder.adjusted_ms) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => challenger.member_id < holder.member_id,
            }
        }
    }
}
