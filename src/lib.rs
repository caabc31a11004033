//! squadsync - Playback Synchronization Engine
//!
//! Keeps a squad's video players on the same playback position, play/pause
//! state, and seek target within a bounded tolerance, despite independent
//! clocks, variable latency, and members joining or leaving mid-session.
//!
//! The engine consumes an abstract ordered-message channel per member (see
//! [`session::MemberTransport`]); it does not implement socket framing or
//! connection setup. Each session runs as a single actor, reached through a
//! [`session::SessionHandle`].

use std::sync::Once;

pub mod clock;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod session;

// Re-exports for convenience
pub use config::SyncConfig;
pub use error::SyncError;
pub use playback::{PlaybackState, PlaybackStateMachine};
pub use protocol::{CandidateEvent, ClientMessage, EventKind, ServerMessage};
pub use registry::SessionRegistry;
pub use session::{MemberTransport, Role, SessionCoordinator, SessionHandle, SquadDirectory};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing output for host binaries. Safe to call more than
/// once; only the first call takes effect.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("squadsync=debug")),
            )
            .with_writer(std::io::stderr)
            .init();
    });
}
