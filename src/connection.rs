use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

/// Connectivity of the signaling channel as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Disconnected => write!(f, "Disconnected"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Connected => write!(f, "Connected"),
            ConnectivityState::Reconnecting => write!(f, "Reconnecting"),
            ConnectivityState::Failed => write!(f, "Failed"),
        }
    }
}

/// Negotiation handshake phase of one peer pairing. A fresh session starts
/// in `Stable` with no descriptions applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingState::Stable => write!(f, "stable"),
            SignalingState::HaveLocalOffer => write!(f, "have-local-offer"),
            SignalingState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

/// State of the direct media path (ICE) for one peer pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCIceConnectionState> for PathState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => PathState::Checking,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                PathState::Connected
            }
            RTCIceConnectionState::Disconnected => PathState::Disconnected,
            RTCIceConnectionState::Failed => PathState::Failed,
            RTCIceConnectionState::Closed => PathState::Closed,
            _ => PathState::New,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
    pub signaling_state: SignalingState,
    pub path_state: PathState,
    pub last_error: Option<String>,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            signaling_state: SignalingState::Stable,
            path_state: PathState::New,
            last_error: None,
        }
    }
}

/// Publishes the status of one peer session to any number of observers.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<PeerStatus>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(PeerStatus::default());
        Self {
            status: Arc::new(status),
        }
    }

    pub fn update_signaling_state(&self, state: SignalingState) {
        self.status.send_modify(|status| {
            status.signaling_state = state;
        });
    }

    pub fn update_path_state(&self, state: PathState) {
        self.status.send_modify(|status| {
            status.path_state = state;
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn snapshot(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.status.subscribe()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_ice_counts_as_connected() {
        assert_eq!(PathState::from(RTCIceConnectionState::Completed), PathState::Connected);
        assert_eq!(PathState::from(RTCIceConnectionState::Failed), PathState::Failed);
        assert_eq!(PathState::from(RTCIceConnectionState::Unspecified), PathState::New);
    }

    #[tokio::test]
    async fn subscribers_observe_updates() {
        let monitor = ConnectionMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.update_signaling_state(SignalingState::HaveLocalOffer);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().signaling_state, SignalingState::HaveLocalOffer);

        monitor.set_error("ice failed".to_string());
        assert_eq!(monitor.snapshot().last_error.as_deref(), Some("ice failed"));
        assert_eq!(monitor.snapshot().signaling_state, SignalingState::HaveLocalOffer);
    }
}
