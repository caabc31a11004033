//! Per-session coordinator actor
//!
//! One coordinator owns one session end to end: it wires the clock sync,
//! the reconciliation engine, and the playback state machine together and
//! is the sole entry point for the transport layer. All events for a
//! session are processed on one sequential timeline (a single spawned
//! task), so playback state needs no locks; sessions run fully
//! independently of each other.
//!
//! External code talks to the actor through a cloneable [`SessionHandle`]
//! wrapping the command channel; request/reply operations use oneshot
//! channels.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clock::{reference_now_ms, ClockSync};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::playback::{AcceptedAction, Phase, PlaybackState, PlaybackStateMachine};
use crate::protocol::{CandidateEvent, EventKind, ServerMessage};
use crate::reconcile::{Candidate, Flush, ReconciliationEngine};
use crate::session::roster::{ConnectionStatus, Role, Roster};

/// Outbound half of a member's ordered message channel. Delivery is
/// fire-and-forget: implementations must enqueue and return, never block,
/// so a slow member cannot stall delivery to the rest of the session.
pub trait MemberTransport: Send + Sync {
    fn send(&self, message: ServerMessage);
}

/// External squad-membership service. Queried on join, never mutated.
pub trait SquadDirectory: Send + Sync {
    /// The member's role within the squad, or `None` if it does not belong.
    fn authorize(&self, member_id: &str) -> Option<Role>;
}

/// Per-member drift snapshot for debug/UI surfaces.
#[derive(Debug, Clone)]
pub struct MemberDrift {
    pub member_id: String,
    /// Positive = ahead of the authoritative position.
    pub drift_seconds: f64,
    pub synced: bool,
    pub last_report_ms: u64,
}

enum Command {
    Join {
        member_id: String,
        transport: Arc<dyn MemberTransport>,
        reply: oneshot::Sender<Result<PlaybackState, SyncError>>,
    },
    Submit {
        member_id: String,
        event: CandidateEvent,
    },
    Leave {
        member_id: String,
    },
    TransferHost {
        from: String,
        to: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    DriftReport {
        reply: oneshot::Sender<Vec<MemberDrift>>,
    },
    Close,
}

/// Handle to a running session coordinator.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Whether the session actor has terminated.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Add a member and receive the full current state, so the member can
    /// seek straight to the live position instead of starting from zero.
    pub async fn join(
        &self,
        member_id: impl Into<String>,
        transport: Arc<dyn MemberTransport>,
    ) -> Result<PlaybackState, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Join {
                member_id: member_id.into(),
                transport,
                reply: reply_tx,
            })
            .map_err(|_| SyncError::SessionClosed)?;
        reply_rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Enqueue a candidate event. Returns as soon as the event is queued;
    /// reconciliation and broadcast happen on the session timeline. An
    /// event from a member no longer in the session is dropped there and
    /// the member is told to rejoin.
    pub fn submit_event(
        &self,
        member_id: impl Into<String>,
        event: CandidateEvent,
    ) -> Result<(), SyncError> {
        self.tx
            .send(Command::Submit {
                member_id: member_id.into(),
                event,
            })
            .map_err(|_| SyncError::SessionClosed)
    }

    pub fn leave(&self, member_id: impl Into<String>) -> Result<(), SyncError> {
        self.tx
            .send(Command::Leave {
                member_id: member_id.into(),
            })
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Hand the host role to another connected member.
    pub async fn transfer_host(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Result<(), SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::TransferHost {
                from: from.into(),
                to: to.into(),
                reply: reply_tx,
            })
            .map_err(|_| SyncError::SessionClosed)?;
        reply_rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Snapshot of every member's last reported drift.
    pub async fn drift_report(&self) -> Result<Vec<MemberDrift>, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::DriftReport { reply: reply_tx })
            .map_err(|_| SyncError::SessionClosed)?;
        reply_rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Destroy the session.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

/// Owns one session's state and processes its timeline.
pub struct SessionCoordinator {
    session_id: String,
    config: SyncConfig,
    directory: Arc<dyn SquadDirectory>,
    roster: Roster,
    machine: PlaybackStateMachine,
    engine: ReconciliationEngine,
    clock: ClockSync,
    transports: HashMap<String, Arc<dyn MemberTransport>>,
    last_activity_ms: u64,
}

impl SessionCoordinator {
    /// Spawn the session actor and return its handle. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        session_id: String,
        config: SyncConfig,
        directory: Arc<dyn SquadDirectory>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = reference_now_ms();
        let coordinator = Self {
            engine: ReconciliationEngine::new(&config),
            clock: ClockSync::new(config.min_clock_confidence),
            machine: PlaybackStateMachine::new(now),
            roster: Roster::new(),
            transports: HashMap::new(),
            last_activity_ms: now,
            session_id: session_id.clone(),
            config,
            directory,
        };
        tokio::spawn(coordinator.run(rx));
        SessionHandle { session_id, tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("session {} started", self.session_id);
        let mut sweep = tokio::time::interval(Duration::from_millis(1_000));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let flush_deadline = self.engine.next_flush_at_ms();
            let flow = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => ControlFlow::Break(()),
                },
                _ = flush_timer(flush_deadline) => self.flush_epoch(),
                _ = sweep.tick() => self.sweep_members(),
            };
            if flow.is_break() {
                break;
            }
        }

        self.machine.close();
        info!("session {} closed", self.session_id);
    }

    fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Join {
                member_id,
                transport,
                reply,
            } => {
                let _ = reply.send(self.handle_join(&member_id, transport));
                ControlFlow::Continue(())
            }
            Command::Submit { member_id, event } => self.handle_event(&member_id, event),
            Command::Leave { member_id } => self.handle_leave(&member_id),
            Command::TransferHost { from, to, reply } => {
                let result = if !self.roster.is_host(&from) {
                    Err(SyncError::NotHost(from))
                } else if self.roster.transfer_host(&from, &to) {
                    Ok(())
                } else {
                    Err(SyncError::UnknownMember(to))
                };
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
            Command::DriftReport { reply } => {
                let report = self
                    .engine
                    .all_drift_stats()
                    .map(|(id, stats)| MemberDrift {
                        member_id: id.to_string(),
                        drift_seconds: stats.drift_seconds,
                        synced: stats.synced,
                        last_report_ms: stats.last_report_ms,
                    })
                    .collect();
                let _ = reply.send(report);
                ControlFlow::Continue(())
            }
            Command::Close => {
                info!("session {} closing on request", self.session_id);
                ControlFlow::Break(())
            }
        }
    }

    fn handle_join(
        &mut self,
        member_id: &str,
        transport: Arc<dyn MemberTransport>,
    ) -> Result<PlaybackState, SyncError> {
        let Some(role) = self.directory.authorize(member_id) else {
            warn!(
                "join rejected: {} does not belong to the squad of session {}",
                member_id, self.session_id
            );
            return Err(SyncError::UnknownMember(member_id.to_string()));
        };

        let now = reference_now_ms();
        self.roster.join(member_id, role, now);
        self.transports.insert(member_id.to_string(), transport);
        self.last_activity_ms = now;
        info!(
            "member {} joined session {} as {:?}",
            member_id, self.session_id, role
        );

        // The state is sent verbatim; the member extrapolates the live
        // position from accepted_at_reference_ms and its clock offset.
        Ok(self.machine.current().clone())
    }

    fn handle_event(&mut self, member_id: &str, event: CandidateEvent) -> ControlFlow<()> {
        let now = reference_now_ms();

        // A leave processed earlier on this timeline takes effect for every
        // event queued behind it.
        let Some(member) = self.roster.active(member_id) else {
            warn!(
                "event from member {} not in session {}, dropping",
                member_id, self.session_id
            );
            if let Some(transport) = self.transports.get(member_id) {
                transport.send(ServerMessage::Rejoin {
                    reason: "not in session".to_string(),
                });
            }
            return ControlFlow::Continue(());
        };
        let role = member.role;
        self.roster.mark_seen(member_id, now);
        self.last_activity_ms = now;

        if let Some(hint) = event.member_sequence_hint {
            let current = self.machine.current().sequence;
            if hint < current {
                debug!(
                    "member {} acting on stale sequence {} (current {})",
                    member_id, hint, current
                );
            }
        }

        if event.kind == EventKind::Heartbeat {
            return self.handle_heartbeat(member_id, &event, now);
        }

        if self.machine.phase().is_terminal() {
            debug!(
                "ignoring {:?} from {} in terminal phase {:?}",
                event.kind,
                member_id,
                self.machine.phase()
            );
            return ControlFlow::Continue(());
        }

        let action = match event.kind {
            EventKind::Play => AcceptedAction::Play,
            EventKind::Pause => AcceptedAction::Pause,
            EventKind::Seek => match event.target_position_seconds {
                Some(target) => AcceptedAction::Seek {
                    target_seconds: target,
                },
                None => {
                    warn!("seek from {} without a target, dropping", member_id);
                    return ControlFlow::Continue(());
                }
            },
            EventKind::Heartbeat => unreachable!("heartbeats handled above"),
        };

        // Order by the member's clock when it is synced; otherwise degrade
        // to time of arrival.
        let adjusted_ms = self
            .clock
            .to_reference(member_id, event.member_local_ms)
            .unwrap_or(now);

        self.engine.submit(
            Candidate {
                member_id: member_id.to_string(),
                role,
                action,
                adjusted_ms,
            },
            now,
        );
        ControlFlow::Continue(())
    }

    fn handle_heartbeat(
        &mut self,
        member_id: &str,
        event: &CandidateEvent,
        now_ms: u64,
    ) -> ControlFlow<()> {
        // The echo completes the round trip started by our previous
        // TimeSync reply.
        if let Some(sample) = event.time_sync_echo {
            self.clock.record_sample(member_id, sample, now_ms);
        }

        if let Some(duration) = event.known_duration_seconds {
            self.machine.set_known_duration(duration);
        }

        // Reply immediately with the stamps for the member's next sample.
        if let Some(transport) = self.transports.get(member_id) {
            transport.send(ServerMessage::TimeSync {
                client_send_ms: event.member_local_ms,
                server_receive_ms: now_ms,
                server_send_ms: reference_now_ms(),
            });
        }

        if let Some(reported) = event.reported_position_seconds {
            let expected = self.machine.position_at(now_ms);

            // The seek originator reporting on target collapses Seeking.
            if self.machine.phase() == Phase::Seeking
                && self.machine.current().originating_member.as_deref() == Some(member_id)
                && (reported - expected).abs() < self.config.seek_epsilon_seconds
            {
                self.machine.confirm_seek();
            }

            let synced = self.clock.is_synced(member_id);
            if self
                .engine
                .record_heartbeat(member_id, reported, expected, synced, now_ms)
            {
                // Restate the authoritative state to the drifter only.
                if let Some(transport) = self.transports.get(member_id) {
                    transport.send(ServerMessage::State(self.machine.current().clone()));
                }
            }
        }

        // Reaching the end of the video is a real transition: it takes the
        // next sequence number so members replaying the stream adopt it
        // rather than discarding it as a duplicate.
        if self.machine.is_exhausted(now_ms) {
            let sequence = self.engine.allocate_sequence();
            let ended = self.machine.finish(sequence, now_ms).map(PlaybackState::clone);
            match ended {
                Ok(state) => self.broadcast(ServerMessage::State(state)),
                Err(err) => return self.teardown_corrupted(err),
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_leave(&mut self, member_id: &str) -> ControlFlow<()> {
        if self.roster.active(member_id).is_none() {
            debug!("leave from member {} not in session", member_id);
            return ControlFlow::Continue(());
        }

        let was_host = self.roster.mark_left(member_id);
        self.transports.remove(member_id);
        self.clock.forget(member_id);
        self.engine.forget_member(member_id);
        // A departed originator can never confirm its pending seek.
        self.machine.abandon_seek(member_id);
        self.last_activity_ms = reference_now_ms();
        info!("member {} left session {}", member_id, self.session_id);

        if was_host {
            self.roster.promote_successor();
        }

        if self.roster.connected_count() == 0 {
            info!(
                "last member left, destroying session {}",
                self.session_id
            );
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn flush_epoch(&mut self) -> ControlFlow<()> {
        // Nothing can be accepted after the video ended or the session
        // closed; drop the epoch without consuming a sequence number.
        if self.machine.phase().is_terminal() {
            self.engine.clear_pending();
            return ControlFlow::Continue(());
        }

        let now = reference_now_ms();
        let position_now = self.machine.position_at(now);
        let duration = self.machine.known_duration_seconds();

        match self.engine.flush_due(now, position_now, duration) {
            Some(Flush::Accepted(accepted)) => {
                let sequence = accepted.sequence;
                let applied = self.machine.apply(accepted).map(PlaybackState::clone);
                match applied {
                    Ok(state) => {
                        debug!(
                            "session {} accepted sequence {}: playing={} position={:.2}s",
                            self.session_id,
                            sequence,
                            state.is_playing,
                            state.position_seconds
                        );
                        self.broadcast(ServerMessage::State(state));
                    }
                    Err(err) => return self.teardown_corrupted(err),
                }
            }
            Some(Flush::Coalesced { member_id }) => {
                if let Some(transport) = self.transports.get(&member_id) {
                    transport.send(ServerMessage::State(self.machine.current().clone()));
                }
            }
            None => {}
        }
        ControlFlow::Continue(())
    }

    fn sweep_members(&mut self) -> ControlFlow<()> {
        let now = reference_now_ms();
        let transitions = self.roster.sweep(
            now,
            self.config.member_timeout_ms,
            self.config.reconnect_grace_ms,
        );

        for (member_id, status) in transitions {
            match status {
                ConnectionStatus::Reconnecting => {
                    warn!(
                        "member {} missed heartbeats, marked reconnecting",
                        member_id
                    );
                }
                ConnectionStatus::Left => {
                    warn!("member {} timed out, forcing leave", member_id);
                    self.transports.remove(&member_id);
                    self.clock.forget(&member_id);
                    self.engine.forget_member(&member_id);
                    self.machine.abandon_seek(&member_id);
                    if self.roster.host().is_none() {
                        self.roster.promote_successor();
                    }
                }
                ConnectionStatus::Connected => {}
            }
        }

        if self.roster.connected_count() == 0 {
            let idle_ms = now.saturating_sub(self.last_activity_ms);
            if idle_ms > self.config.idle_timeout_ms {
                info!(
                    "session {} idle for {}ms, destroying",
                    self.session_id, idle_ms
                );
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// State corruption cannot be safely patched; tear down and make
    /// everyone rejoin fresh.
    fn teardown_corrupted(&self, err: SyncError) -> ControlFlow<()> {
        tracing::error!(
            "session {} state corrupted: {}, tearing down",
            self.session_id,
            err
        );
        self.broadcast(ServerMessage::Rejoin {
            reason: "session state corrupted".to_string(),
        });
        ControlFlow::Break(())
    }

    /// Push a message to every connected member, fire-and-forget.
    fn broadcast(&self, message: ServerMessage) {
        for member in self.roster.iter_active() {
            if member.status != ConnectionStatus::Connected {
                continue;
            }
            if let Some(transport) = self.transports.get(&member.id) {
                transport.send(message.clone());
            }
        }
    }
}

async fn flush_timer(deadline_ms: Option<u64>) {
    match deadline_ms {
        Some(at) => {
            let now = reference_now_ms();
            if at > now {
                tokio::time::sleep(Duration::from_millis(at - now)).await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSample;
    use pretty_assertions::assert_eq;

    /// Captures everything the coordinator pushes to one member.
    #[derive(Default)]
    struct TestTransport {
        messages: parking_lot::Mutex<Vec<ServerMessage>>,
    }

    impl TestTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn states(&self) -> Vec<PlaybackState> {
            self.messages
                .lock()
                .iter()
                .filter_map(|m| match m {
                    ServerMessage::State(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        }

        fn time_syncs(&self) -> usize {
            self.messages
                .lock()
                .iter()
                .filter(|m| matches!(m, ServerMessage::TimeSync { .. }))
                .count()
        }
    }

    impl MemberTransport for TestTransport {
        fn send(&self, message: ServerMessage) {
            self.messages.lock().push(message);
        }
    }

    /// Directory stub: "host" is the host, everyone listed is a participant.
    struct TestDirectory {
        members: Vec<String>,
    }

    impl TestDirectory {
        fn squad(members: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                members: members.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    impl SquadDirectory for TestDirectory {
        fn authorize(&self, member_id: &str) -> Option<Role> {
            if !self.members.iter().any(|m| m == member_id) {
                return None;
            }
            Some(if member_id == "host" {
                Role::Host
            } else {
                Role::Participant
            })
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            debounce_window_ms: 50,
            ..SyncConfig::default()
        }
    }

    fn spawn_session(directory: Arc<TestDirectory>) -> SessionHandle {
        SessionCoordinator::spawn("test-session".to_string(), fast_config(), directory)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_accepted_event_broadcasts_to_all_members() {
        let session = spawn_session(TestDirectory::squad(&["host", "p1"]));
        let host_tx = TestTransport::new();
        let p1_tx = TestTransport::new();

        let initial = session.join("host", host_tx.clone()).await.unwrap();
        assert_eq!(initial.sequence, 0);
        assert!(!initial.is_playing);
        session.join("p1", p1_tx.clone()).await.unwrap();

        session
            .submit_event("host", CandidateEvent::play(reference_now_ms()))
            .unwrap();
        settle().await;

        for transport in [&host_tx, &p1_tx] {
            let states = transport.states();
            assert_eq!(states.len(), 1);
            assert_eq!(states[0].sequence, 1);
            assert!(states[0].is_playing);
            assert_eq!(states[0].originating_member.as_deref(), Some("host"));
        }
    }

    #[tokio::test]
    async fn test_conflicting_seeks_resolve_to_host_in_one_transition() {
        let session = spawn_session(TestDirectory::squad(&["host", "p1"]));
        let host_tx = TestTransport::new();
        let p1_tx = TestTransport::new();
        session.join("host", host_tx.clone()).await.unwrap();
        session.join("p1", p1_tx.clone()).await.unwrap();

        // Participant's competing seek arrives first
        let now = reference_now_ms();
        session
            .submit_event("p1", CandidateEvent::seek(now, 121.0))
            .unwrap();
        session
            .submit_event("host", CandidateEvent::seek(now + 10, 120.0))
            .unwrap();
        settle().await;

        let states = p1_tx.states();
        assert_eq!(states.len(), 1, "exactly one transition expected");
        assert_eq!(states[0].sequence, 1);
        assert_eq!(states[0].position_seconds, 120.0);
        assert_eq!(states[0].originating_member.as_deref(), Some("host"));
    }

    #[tokio::test]
    async fn test_join_rejected_for_non_squad_member() {
        let session = spawn_session(TestDirectory::squad(&["host"]));
        let tx = TestTransport::new();
        let err = session.join("stranger", tx).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownMember(_)));
    }

    #[tokio::test]
    async fn test_event_from_departed_member_is_dropped() {
        let session = spawn_session(TestDirectory::squad(&["host", "p1"]));
        let host_tx = TestTransport::new();
        let p1_tx = TestTransport::new();
        session.join("host", host_tx.clone()).await.unwrap();
        session.join("p1", p1_tx.clone()).await.unwrap();

        session.leave("p1").unwrap();
        session
            .submit_event("p1", CandidateEvent::play(reference_now_ms()))
            .unwrap();
        settle().await;

        // Nothing was accepted on behalf of the departed member
        assert!(host_tx.states().is_empty());
    }

    #[tokio::test]
    async fn test_late_joiner_receives_live_state() {
        let session = spawn_session(TestDirectory::squad(&["host", "late"]));
        let host_tx = TestTransport::new();
        session.join("host", host_tx.clone()).await.unwrap();
        session
            .submit_event("host", CandidateEvent::play(reference_now_ms()))
            .unwrap();
        settle().await;

        let late_tx = TestTransport::new();
        let state = session.join("late", late_tx).await.unwrap();
        assert_eq!(state.sequence, 1);
        assert!(state.is_playing);
    }

    #[tokio::test]
    async fn test_host_leave_promotes_earliest_joiner() {
        let session = spawn_session(TestDirectory::squad(&["host", "bob", "alice"]));
        let host_tx = TestTransport::new();
        let bob_tx = TestTransport::new();
        let alice_tx = TestTransport::new();
        session.join("host", host_tx).await.unwrap();
        session.join("bob", bob_tx.clone()).await.unwrap();
        session.join("alice", alice_tx.clone()).await.unwrap();

        session.leave("host").unwrap();

        // Bob joined before alice, so bob now holds the host override:
        // alice pauses first, bob plays later, bob still wins.
        let now = reference_now_ms();
        session
            .submit_event("alice", CandidateEvent::pause(now))
            .unwrap();
        session
            .submit_event("bob", CandidateEvent::play(now + 10))
            .unwrap();
        settle().await;

        let states = alice_tx.states();
        assert_eq!(states.len(), 1);
        assert!(states[0].is_playing);
        assert_eq!(states[0].originating_member.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_session_destroyed_when_last_member_leaves() {
        let session = spawn_session(TestDirectory::squad(&["host"]));
        let tx = TestTransport::new();
        session.join("host", tx).await.unwrap();
        assert!(!session.is_closed());

        session.leave("host").unwrap();
        settle().await;
        assert!(session.is_closed());
        assert!(matches!(
            session.join("host", TestTransport::new()).await,
            Err(SyncError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_gets_time_sync_reply() {
        let session = spawn_session(TestDirectory::squad(&["host"]));
        let tx = TestTransport::new();
        session.join("host", tx.clone()).await.unwrap();

        session
            .submit_event("host", CandidateEvent::heartbeat(reference_now_ms(), 0.0))
            .unwrap();
        settle().await;

        assert_eq!(tx.time_syncs(), 1);
    }

    #[tokio::test]
    async fn test_synced_drifter_receives_correction() {
        let session = spawn_session(TestDirectory::squad(&["host", "p1"]));
        let host_tx = TestTransport::new();
        let p1_tx = TestTransport::new();
        session.join("host", host_tx.clone()).await.unwrap();
        session.join("p1", p1_tx.clone()).await.unwrap();

        // Five clean round trips bring p1's clock estimate above threshold
        for i in 0..5u64 {
            let base = 1_000 + i * 2_000;
            let mut hb = CandidateEvent::heartbeat(base, 0.0);
            hb.time_sync_echo = Some(ClockSample {
                client_send_ms: base,
                server_receive_ms: base + 170,
                server_send_ms: base + 170,
                client_receive_ms: base + 40,
            });
            session.submit_event("p1", hb).unwrap();
        }
        settle().await;
        let before = p1_tx.states().len();

        // Reporting a position far from the authoritative one (still 0.0,
        // nothing is playing) earns a corrective restate.
        session
            .submit_event("p1", CandidateEvent::heartbeat(reference_now_ms(), 50.0))
            .unwrap();
        settle().await;

        let states = p1_tx.states();
        assert_eq!(states.len(), before + 1);
        let correction = states.last().unwrap();
        assert_eq!(correction.sequence, 0);
        assert_eq!(correction.position_seconds, 0.0);

        let report = session.drift_report().await.unwrap();
        let p1 = report.iter().find(|d| d.member_id == "p1").unwrap();
        assert!((p1.drift_seconds - 50.0).abs() < 0.5);
        assert!(p1.synced);

        // The host, which never drifted, got no correction
        assert!(host_tx.states().is_empty());
    }

    #[tokio::test]
    async fn test_end_of_video_broadcasts_fresh_sequence() {
        let session = spawn_session(TestDirectory::squad(&["host"]));
        let tx = TestTransport::new();
        session.join("host", tx.clone()).await.unwrap();

        session
            .submit_event("host", CandidateEvent::play(reference_now_ms()))
            .unwrap();
        settle().await;

        // Duration metadata arrives; playback is already past it.
        let mut hb = CandidateEvent::heartbeat(reference_now_ms(), 0.05);
        hb.known_duration_seconds = Some(0.05);
        session.submit_event("host", hb).unwrap();
        settle().await;

        let states = tx.states();
        assert_eq!(states.len(), 2);
        let ended = &states[1];
        assert_eq!(ended.sequence, states[0].sequence + 1);
        assert!(!ended.is_playing);
        assert_eq!(ended.position_seconds, 0.05);

        // A member replaying the broadcast stream lands on the end state
        let mut member = PlaybackStateMachine::new(0);
        for state in states {
            assert!(member.observe(state));
        }
        assert!(!member.current().is_playing);
    }

    #[tokio::test]
    async fn test_members_converge_within_epsilon() {
        let session = spawn_session(TestDirectory::squad(&["host", "p1"]));
        let host_tx = TestTransport::new();
        let p1_tx = TestTransport::new();
        session.join("host", host_tx.clone()).await.unwrap();
        session.join("p1", p1_tx.clone()).await.unwrap();

        session
            .submit_event("host", CandidateEvent::play(reference_now_ms()))
            .unwrap();
        settle().await;
        session
            .submit_event("host", CandidateEvent::seek(reference_now_ms(), 120.0))
            .unwrap();
        settle().await;

        // Each member replays its own received stream; p1's arrives twice
        // to model at-least-once delivery.
        let mut host_player = PlaybackStateMachine::new(0);
        for state in host_tx.states() {
            host_player.observe(state);
        }
        let mut p1_player = PlaybackStateMachine::new(0);
        for state in p1_tx.states() {
            p1_player.observe(state.clone());
            p1_player.observe(state);
        }

        let now = reference_now_ms();
        let host_pos = host_player.position_at(now);
        let p1_pos = p1_player.position_at(now);
        assert_eq!(
            host_player.current().sequence,
            p1_player.current().sequence
        );
        assert!(host_player.current().is_playing);
        assert!(host_pos >= 120.0);
        assert!(
            (host_pos - p1_pos).abs() < fast_config().seek_epsilon_seconds,
            "positions diverged: {host_pos} vs {p1_pos}"
        );
    }

    #[tokio::test]
    async fn test_transfer_host_moves_override_authority() {
        let session = spawn_session(TestDirectory::squad(&["host", "p1"]));
        let host_tx = TestTransport::new();
        let p1_tx = TestTransport::new();
        session.join("host", host_tx.clone()).await.unwrap();
        session.join("p1", p1_tx.clone()).await.unwrap();

        // Only the host can transfer
        let err = session.transfer_host("p1", "host").await.unwrap_err();
        assert!(matches!(err, SyncError::NotHost(_)));

        session.transfer_host("host", "p1").await.unwrap();

        // p1 now wins conflicts against the former host
        let now = reference_now_ms();
        session
            .submit_event("host", CandidateEvent::pause(now))
            .unwrap();
        session
            .submit_event("p1", CandidateEvent::play(now + 10))
            .unwrap();
        settle().await;

        let states = host_tx.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].originating_member.as_deref(), Some("p1"));
    }
}
