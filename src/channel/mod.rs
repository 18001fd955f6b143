//! Addressed channels over a reconnecting bus session

mod descriptor;
mod manager;

pub use descriptor::{channel_name, ChannelListener, ChannelSpec, CHANNEL_PREFIX};
pub use manager::{Channel, ConnectionManager, ConnectionStatus, ManagerPhase};
