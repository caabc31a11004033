//! Error types for the sync engine
//!
//! Not everything in the failure taxonomy is an error to the caller:
//! an out-of-range seek target is clamped (logged as a warning) and a
//! low-confidence clock estimate just degrades ordering to arrival time.
//! Only conditions the caller can act on surface here.

/// Errors surfaced by session operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// The member is not part of the session (never joined, or already left).
    #[error("unknown member: {0}")]
    UnknownMember(String),

    /// The session has been destroyed; the caller should not retry.
    #[error("session is closed")]
    SessionClosed,

    /// A non-monotonic sequence reached the state machine. This indicates
    /// state corruption that cannot be safely patched; the session is torn
    /// down and members are told to rejoin fresh.
    #[error("reconciliation invariant violated: {0}")]
    InvariantViolation(String),

    /// Host-only operation attempted by a non-host member.
    #[error("member {0} is not the host")]
    NotHost(String),
}
