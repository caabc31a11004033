//! Session membership records
//!
//! Tracks who is in the session, their role, and their liveness. The host
//! role is a liveness requirement for override arbitration, not a permanent
//! assignment: when the host leaves or times out, the longest-tenured
//! remaining connected participant is promoted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// Missed heartbeats; excluded from arbitration tie-breaks until it
    /// either recovers or is force-left.
    Reconnecting,
    Left,
}

/// One squad member's session record.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: String,
    pub role: Role,
    pub joined_at_ms: u64,
    pub last_seen_ms: u64,
    pub status: ConnectionStatus,
}

impl Member {
    /// Whether this member participates in override arbitration.
    pub fn is_arbitrating(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Membership map for one session.
#[derive(Debug, Default)]
pub struct Roster {
    members: HashMap<String, Member>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, or revive one that previously left (a fresh join
    /// resets tenure) or is reconnecting (tenure kept).
    pub fn join(&mut self, id: &str, role: Role, now_ms: u64) -> &Member {
        self.members
            .entry(id.to_string())
            .and_modify(|m| {
                if m.status == ConnectionStatus::Left {
                    m.joined_at_ms = now_ms;
                }
                m.role = role;
                m.status = ConnectionStatus::Connected;
                m.last_seen_ms = now_ms;
            })
            .or_insert_with(|| Member {
                id: id.to_string(),
                role,
                joined_at_ms: now_ms,
                last_seen_ms: now_ms,
                status: ConnectionStatus::Connected,
            })
    }

    pub fn get(&self, id: &str) -> Option<&Member> {
        self.members.get(id)
    }

    /// The member if it is present and has not left.
    pub fn active(&self, id: &str) -> Option<&Member> {
        self.members
            .get(id)
            .filter(|m| m.status != ConnectionStatus::Left)
    }

    pub fn host(&self) -> Option<&Member> {
        self.members
            .values()
            .find(|m| m.role == Role::Host && m.status != ConnectionStatus::Left)
    }

    pub fn is_host(&self, id: &str) -> bool {
        self.active(id).map(|m| m.role == Role::Host).unwrap_or(false)
    }

    /// Record liveness; a reconnecting member recovers to connected.
    pub fn mark_seen(&mut self, id: &str, now_ms: u64) {
        if let Some(m) = self.members.get_mut(id) {
            if m.status == ConnectionStatus::Left {
                return;
            }
            if m.status == ConnectionStatus::Reconnecting {
                tracing::info!("member {} recovered from reconnecting", id);
            }
            m.status = ConnectionStatus::Connected;
            m.last_seen_ms = now_ms;
        }
    }

    /// Mark a member as left. Returns true if it was the host.
    pub fn mark_left(&mut self, id: &str) -> bool {
        match self.members.get_mut(id) {
            Some(m) if m.status != ConnectionStatus::Left => {
                let was_host = m.role == Role::Host;
                m.status = ConnectionStatus::Left;
                m.role = Role::Participant;
                was_host
            }
            _ => false,
        }
    }

    /// Promote the longest-tenured connected participant to host. Ties on
    /// join time break by id so every node picks the same successor.
    pub fn promote_successor(&mut self) -> Option<String> {
        let successor = self
            .members
            .values()
            .filter(|m| m.is_arbitrating() && m.role == Role::Participant)
            .min_by(|a, b| {
                a.joined_at_ms
                    .cmp(&b.joined_at_ms)
                    .then_with(|| a.id.cmp(&b.id))
            })?
            .id
            .clone();

        if let Some(m) = self.members.get_mut(&successor) {
            m.role = Role::Host;
        }
        tracing::info!("promoted {} to host", successor);
        Some(successor)
    }

    /// Hand the host role to a named connected member.
    pub fn transfer_host(&mut self, from: &str, to: &str) -> bool {
        let target_ok = self
            .members
            .get(to)
            .map(|m| m.is_arbitrating())
            .unwrap_or(false);
        if !target_ok || !self.is_host(from) {
            return false;
        }
        if let Some(m) = self.members.get_mut(from) {
            m.role = Role::Participant;
        }
        if let Some(m) = self.members.get_mut(to) {
            m.role = Role::Host;
        }
        tracing::info!("host transferred from {} to {}", from, to);
        true
    }

    /// Time out silent members: connected -> reconnecting after
    /// `timeout_ms` without a heartbeat, reconnecting -> left after a
    /// further `grace_ms`. Returns the transitions applied.
    pub fn sweep(
        &mut self,
        now_ms: u64,
        timeout_ms: u64,
        grace_ms: u64,
    ) -> Vec<(String, ConnectionStatus)> {
        let mut transitions = Vec::new();
        for m in self.members.values_mut() {
            let silent_ms = now_ms.saturating_sub(m.last_seen_ms);
            match m.status {
                ConnectionStatus::Connected if silent_ms > timeout_ms => {
                    m.status = ConnectionStatus::Reconnecting;
                    transitions.push((m.id.clone(), ConnectionStatus::Reconnecting));
                }
                ConnectionStatus::Reconnecting if silent_ms > timeout_ms + grace_ms => {
                    m.status = ConnectionStatus::Left;
                    m.role = Role::Participant;
                    transitions.push((m.id.clone(), ConnectionStatus::Left));
                }
                _ => {}
            }
        }
        transitions
    }

    pub fn connected_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.status != ConnectionStatus::Left)
            .count()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(|m| m.status != ConnectionStatus::Left)
    }
}
