//! Broker discovery
//!
//! Finds the message broker through cluster service discovery and keeps
//! observers informed as it moves.

mod directory;
mod location;

pub use directory::{DiscoveryEvent, PeerService, ServiceDirectory, ServiceDiscovery};
pub use location::{AddressObserver, BrokerAddress, BrokerLocationSource, ObserverId, BROKER_SERVICE_ID};
