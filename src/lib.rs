//! Peer-to-peer audio/video calls between the participants of a room,
//! negotiated over a websocket relay.

pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use negotiation::ConnectionId;
pub use session::{Session, SessionEvent};
