use anyhow::Error as AnyhowError;
use thiserror::Error as ThisError;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::negotiation::ConnectionId;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("signaling relay unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("relay rejected join for room {0}")]
    RoomJoinRejected(String),
    #[error("media capture unavailable: {0}")]
    MediaUnavailable(String),
    #[error("protocol violation from {peer}: {reason}")]
    ProtocolViolation { peer: ConnectionId, reason: String },
    #[error("answer from {peer} arrived in state {state}")]
    UnexpectedAnswer { peer: ConnectionId, state: String },
    #[error("negotiation with {0} abandoned")]
    NegotiationAbandoned(ConnectionId),
    #[error("no answer from {peer} after {offers} offers")]
    AnswerTimeout { peer: ConnectionId, offers: u32 },
    #[error("structural description mismatch: {0}")]
    StructuralMismatch(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),
    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Other error: {0}")]
    Other(#[from] AnyhowError),
}

impl Error {
    /// Conditions that are logged and otherwise ignored by the negotiation
    /// engine. Everything else changes control flow somewhere.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ProtocolViolation { .. } | Error::UnexpectedAnswer { .. }
        )
    }

    /// Errors the UI must show before returning the user to a safe screen.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Error::RoomJoinRejected(_) | Error::MediaUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_conditions_are_not_fatal() {
        let peer = ConnectionId::from("9");
        assert!(!Error::UnexpectedAnswer { peer: peer.clone(), state: "stable".into() }.is_fatal());
        assert!(!Error::ProtocolViolation { peer: peer.clone(), reason: "repeat offer".into() }.is_fatal());
        assert!(Error::StructuralMismatch("m-line order".into()).is_fatal());
        assert!(Error::AnswerTimeout { peer: peer.clone(), offers: 3 }.is_fatal());
        assert!(Error::NegotiationAbandoned(peer).is_fatal());
    }

    #[test]
    fn only_join_and_media_failures_reach_the_user() {
        assert!(Error::RoomJoinRejected("lobby".into()).is_user_visible());
        assert!(Error::MediaUnavailable("no microphone".into()).is_user_visible());
        assert!(!Error::NotConnected.is_user_visible());
        assert!(!Error::ChannelUnavailable("refused".into()).is_user_visible());
    }
}
