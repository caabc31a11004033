//! Multi-session registry
//!
//! Sessions run fully independently: each gets its own coordinator actor,
//! and the registry is just a handle map. Handles whose actor has
//! terminated (last member left, idle timeout, teardown) are pruned
//! lazily.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::config::SyncConfig;
use crate::session::coordinator::{SessionCoordinator, SessionHandle, SquadDirectory};

/// Characters used for generated session identifiers (no ambiguous 0/O/1/I).
const SESSION_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const SESSION_ID_LEN: usize = 6;

/// Generate a short shareable session identifier.
pub fn random_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect()
}

/// Owns the handles of all live sessions.
pub struct SessionRegistry {
    config: SyncConfig,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session for a squad and spawn its coordinator. The
    /// directory is the squad-membership service consulted on every join.
    pub fn create(&self, directory: Arc<dyn SquadDirectory>) -> SessionHandle {
        let session_id = random_session_id();
        let handle =
            SessionCoordinator::spawn(session_id.clone(), self.config.clone(), directory);
        self.sessions.write().insert(session_id, handle.clone());
        tracing::info!("created session {}", handle.id());
        handle
    }

    /// Look up a live session, pruning it if its actor has terminated.
    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        let handle = self.sessions.read().get(session_id).cloned()?;
        if handle.is_closed() {
            self.sessions.write().remove(session_id);
            return None;
        }
        Some(handle)
    }

    /// Destroy a session explicitly.
    pub fn remove(&self, session_id: &str) {
        if let Some(handle) = self.sessions.write().remove(session_id) {
            handle.close();
        }
    }

    /// Number of sessions with a live actor.
    pub fn live_count(&self) -> usize {
        let mut sessions = self.sessions.write();
        sessions.retain(|_, h| !h.is_closed());
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::roster::Role;

    struct OpenSquad;

    impl SquadDirectory for OpenSquad {
        fn authorize(&self, member_id: &str) -> Option<Role> {
            Some(if member_id == "host" {
                Role::Host
            } else {
                Role::Participant
            })
        }
    }

    #[test]
    fn test_session_id_shape() {
        let id = random_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id.bytes().all(|b| SESSION_ID_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let registry = SessionRegistry::new(SyncConfig::default());
        let a = registry.create(Arc::new(OpenSquad));
        let b = registry.create(Arc::new(OpenSquad));
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.live_count(), 2);

        registry.remove(a.id());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(registry.get(a.id()).is_none());
        assert!(registry.get(b.id()).is_some());
        assert_eq!(registry.live_count(), 1);
    }
}
