//! peerlink - peer coordination over a pub/sub bus whose broker can move
//!
//! Instances of the same plugin running on different servers find each
//! other over a shared topic, track liveness with heartbeats, and exchange
//! addressed or broadcast messages. The transport follows the broker as
//! discovery reports it moving, reopening every channel on the new one.

pub mod channel;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod transport;
pub mod version;

pub use error::{Error, ErrorCode, Result};
