//! Wire-level message definitions
//!
//! Envelopes carried on peer channels, the frames used to talk to the relay
//! broker, and the boundary types of the storage-backed exchange channel.

mod envelope;
mod exchange;
mod frame;

pub use envelope::*;
pub use exchange::*;
pub use frame::*;
