//! Per-peer offer/answer negotiation.
//!
//! Every remote participant gets one [`session::PeerSession`] driven by its
//! own task, so transitions for one connection id never interleave while
//! different peers negotiate concurrently. The [`engine::NegotiationEngine`]
//! owns the registry of those tasks.

pub mod engine;
pub mod session;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::track::track_remote::TrackRemote;

use crate::media::TrackKind;
use crate::signaling::Signal;

pub use engine::{EngineSettings, NegotiationEngine};
pub use session::PeerSession;

/// Server-assigned identifier of a participant's signaling session.
///
/// Ordering is total: two purely numeric ids compare as integers, anything
/// else compares as text, and a numeric id sorts before a non-numeric one.
/// Glare resolution and the initiator rule both rely on this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u128> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.0.parse().ok()
    }

    /// The side with the higher id offers first and keeps its offer on glare.
    pub fn outranks(&self, other: &ConnectionId) -> bool {
        self > other
    }
}

impl Ord for ConnectionId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for ConnectionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A media track received from a remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    /// Handle for reading RTP; absent for transports that do not carry media.
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Tracks received from one peer. Grows as negotiation proceeds and is
/// emptied when the peer session closes.
#[derive(Clone)]
pub struct RemoteMedia {
    tracks: Arc<watch::Sender<Vec<RemoteTrack>>>,
}

impl RemoteMedia {
    pub fn new() -> Self {
        let (tracks, _) = watch::channel(Vec::new());
        Self {
            tracks: Arc::new(tracks),
        }
    }

    /// Returns false when a track with the same id was already present.
    pub fn push(&self, track: RemoteTrack) -> bool {
        self.tracks.send_if_modified(|tracks| {
            if tracks.iter().any(|t| t.id == track.id) {
                return false;
            }
            tracks.push(track);
            true
        })
    }

    pub fn clear(&self) {
        self.tracks.send_modify(|tracks| tracks.clear());
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.borrow().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<RemoteTrack>> {
        self.tracks.subscribe()
    }
}

impl Default for RemoteMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tracks.borrow().iter()).finish()
    }
}

/// A signal a peer session wants relayed to its remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: ConnectionId,
    pub signal: Signal,
}

/// What the engine reports upward to the session facade.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RemoteStream {
        peer: ConnectionId,
        media: RemoteMedia,
    },
    Abandoned {
        peer: ConnectionId,
    },
}
