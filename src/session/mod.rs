//! Session ownership: membership records and the per-session coordinator.

pub mod coordinator;
pub mod roster;

pub use coordinator::{MemberTransport, SessionCoordinator, SessionHandle, SquadDirectory};
pub use roster::{ConnectionStatus, Member, Role, Roster};
