use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::connection::PathState;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, TrackKind};
use crate::negotiation::{ConnectionId, RemoteTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub kind: SdpKind,
    pub sdp: String,
}

impl Description {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Things the transport reports on its own schedule.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    LocalCandidate(String),
    RemoteTrack(RemoteTrack),
    PathState(PathState),
}

/// The direct media transport a peer session drives.
///
/// Errors from applying a description that stem from media-line layout
/// disagreements must come back as [`Error::StructuralMismatch`].
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attaches the local tracks to the pre-declared transceivers.
    async fn sync_local_media(&self, media: &LocalMedia) -> Result<()>;
    async fn create_offer(&self, ice_restart: bool) -> Result<Description>;
    async fn create_answer(&self) -> Result<Description>;
    async fn set_local_description(&self, desc: Description) -> Result<()>;
    async fn set_remote_description(&self, desc: Description) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
    async fn add_remote_candidate(&self, candidate: &str) -> Result<()>;
    /// Restarts path discovery without renegotiating.
    async fn restart_path(&self) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open(
        &self,
        peer: &ConnectionId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}

/// Builds webrtc-rs peer connections sharing one API object.
pub struct RtcLinkFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcLinkFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn open(
        &self,
        peer: &ConnectionId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        // Declared once, in line order. Tracks are swapped into these senders
        // later, so the media sections never move.
        let mut transceivers = HashMap::new();
        for kind in TrackKind::LINE_ORDER {
            let transceiver = pc
                .add_transceiver_from_kind(
                    kind.codec_type(),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendrecv,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            transceivers.insert(kind, transceiver);
        }

        let candidate_tx = events.clone();
        let candidate_peer = peer.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let peer = candidate_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json().map_err(Error::from).and_then(|init| {
                    serde_json::to_string(&init).map_err(Error::from)
                }) {
                    Ok(json) => {
                        let _ = tx.send(LinkEvent::LocalCandidate(json));
                    }
                    Err(e) => warn!(%peer, "Failed to encode local candidate: {}", e),
                }
            })
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let tx = track_tx.clone();
                Box::pin(async move {
                    let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                        return;
                    };
                    let _ = tx.send(LinkEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        kind,
                        stream_id: track.stream_id(),
                        track: Some(track),
                    }));
                })
            },
        ));

        let state_tx = events;
        let state_peer = peer.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let tx = state_tx.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                debug!(%peer, "ICE Connection State has changed: {}", s);
                let _ = tx.send(LinkEvent::PathState(PathState::from(s)));
            })
        }));

        Ok(Arc::new(RtcPeerLink { pc, transceivers }))
    }
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    transceivers: HashMap<TrackKind, Arc<RTCRtpTransceiver>>,
}

impl RtcPeerLink {
    fn to_rtc(desc: Description) -> Result<RTCSessionDescription> {
        let desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        Ok(desc)
    }

    fn from_rtc(desc: RTCSessionDescription) -> Result<Description> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(Description::offer(desc.sdp)),
            RTCSdpType::Answer => Ok(Description::answer(desc.sdp)),
            other => Err(Error::Other(anyhow::anyhow!(
                "unexpected description type {}",
                other
            ))),
        }
    }
}

/// webrtc-rs reports media-section disagreements as plain errors; sort them
/// out by message so the session can rebuild instead of retrying.
fn classify_description_error(err: webrtc::Error) -> Error {
    let text = err.to_string().to_lowercase();
    let structural = ["m-line", "media section", "mid", "order", "does not match"]
        .iter()
        .any(|needle| text.contains(needle));
    if structural {
        Error::StructuralMismatch(err.to_string())
    } else {
        Error::WebRTC(err)
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn sync_local_media(&self, media: &LocalMedia) -> Result<()> {
        for kind in TrackKind::LINE_ORDER {
            let Some(transceiver) = self.transceivers.get(&kind) else {
                continue;
            };
            let sender = transceiver.sender().await;
            sender
                .replace_track(media.track(kind).map(|t| t.rtc_track()))
                .await?;
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<Description> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self.pc.create_offer(options).await?;
        Self::from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<Description> {
        let answer = self.pc.create_answer(None).await?;
        Self::from_rtc(answer)
    }

    async fn set_local_description(&self, desc: Description) -> Result<()> {
        let desc = Self::to_rtc(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(classify_description_error)
    }

    async fn set_remote_description(&self, desc: Description) -> Result<()> {
        let desc = Self::to_rtc(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(classify_description_error)
    }

    async fn rollback(&self) -> Result<()> {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        if self.pc.signaling_state() == RTCSignalingState::HaveRemoteOffer {
            self.pc.set_remote_description(desc).await?;
        } else {
            self.pc.set_local_description(desc).await?;
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn restart_path(&self) -> Result<()> {
        // webrtc-rs only restarts ICE through a new offer
        Err(Error::Other(anyhow::anyhow!(
            "in-place ICE restart is not available"
        )))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_line_errors_are_structural() {
        let err = classify_description_error(webrtc::Error::new(
            "order of m-lines in answer does not match offer".to_string(),
        ));
        assert!(matches!(err, Error::StructuralMismatch(_)));

        let err = classify_description_error(webrtc::Error::ErrConnectionClosed);
        assert!(matches!(err, Error::WebRTC(_)));
    }

    #[tokio::test]
    async fn transceivers_are_declared_video_first() {
        let factory = RtcLinkFactory::new(vec![]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.open(&ConnectionId::from("9"), tx).await.unwrap();

        let offer = link.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        let video = offer.sdp.find("m=video").unwrap();
        let audio = offer.sdp.find("m=audio").unwrap();
        assert!(video < audio);

        link.close().await;
    }
}
