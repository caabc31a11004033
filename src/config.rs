//! Engine tunables
//!
//! The debounce window and seek epsilon are documented defaults, not
//! protocol constants; host applications may override them from their own
//! config files (hence `Deserialize`).

use serde::Deserialize;

/// Tunable parameters for one session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Competing play/pause/seek events within this window are treated as
    /// concurrent and arbitrated; exactly one survives.
    pub debounce_window_ms: u64,

    /// A seek landing within this distance of the current authoritative
    /// position is coalesced into a drift correction instead of a new state.
    /// Also the drift threshold for corrective rebroadcasts.
    pub seek_epsilon_seconds: f64,

    /// Expected interval between member heartbeats.
    pub heartbeat_interval_ms: u64,

    /// No heartbeat for this long moves a member to `Reconnecting`.
    pub member_timeout_ms: u64,

    /// A `Reconnecting` member with no heartbeat for this additional grace
    /// period is force-left.
    pub reconnect_grace_ms: u64,

    /// A session with no connected members is destroyed after this long.
    pub idle_timeout_ms: u64,

    /// Clock estimates below this confidence are treated as unsynced and
    /// the member's events are ordered by arrival time instead.
    pub min_clock_confidence: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 300,
            seek_epsilon_seconds: 1.0,
            heartbeat_interval_ms: 2_000,
            member_timeout_ms: 10_000,
            reconnect_grace_ms: 10_000,
            idle_timeout_ms: 60_000,
            min_clock_confidence: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.debounce_window_ms, 300);
        assert_eq!(cfg.seek_epsilon_seconds, 1.0);
        assert_eq!(cfg.member_timeout_ms, 10_000);
    }

    #[test]
    fn test_partial_override_from_json() {
        let cfg: SyncConfig = serde_json::from_str(r#"{"debounce_window_ms": 150}"#).unwrap();
        assert_eq!(cfg.debounce_window_ms, 150);
        // Everything else keeps its default
        assert_eq!(cfg.member_timeout_ms, 10_000);
    }
}
