//! Peer membership and liveness
//!
//! `PeerCoordinator` runs the STARTING/DISCOVER/RUNNING/STOPPING/PING/PONG
//! protocol over one peer channel and keeps a `PeerRegistry` of who is up.

mod events;
mod heartbeat;
mod membership;
mod registry;

pub use events::{plugin_id, CoordinatorEvent, CoordinatorSettings, CoordinatorState, LeaveReason};
pub use heartbeat::{ping_delay, Heartbeat};
pub use membership::PeerCoordinator;
pub use registry::{PeerRecord, PeerRegistry, PEER_TIMEOUT};
