use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionMonitor, PathState, SignalingState};
use crate::error::{Error, Result};
use crate::media::LocalMedia;
use crate::peer::{Description, LinkEvent, PeerLink};
use crate::signaling::Signal;

use super::{ConnectionId, EngineEvent, Outbound, RemoteMedia};

/// Offer/answer state machine for one remote participant.
///
/// Every method is one atomic transition; the engine guarantees that no two
/// run concurrently for the same session.
pub struct PeerSession {
    local: ConnectionId,
    remote: ConnectionId,
    link: Arc<dyn PeerLink>,
    state: SignalingState,
    has_remote_description: bool,
    pending_candidates: VecDeque<String>,
    /// Track changes or a failed path that arrived outside `Stable`.
    negotiation_pending: bool,
    ice_restart_pending: bool,
    media: LocalMedia,
    remote_media: RemoteMedia,
    monitor: ConnectionMonitor,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
    limits: SessionLimits,
    /// When the outstanding local offer expires. Only set in `HaveLocalOffer`.
    answer_deadline: Option<Instant>,
    unanswered_offers: u32,
}

pub(crate) struct SessionWiring {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub monitor: ConnectionMonitor,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionLimits {
    pub answer_timeout: Duration,
    pub max_answer_timeouts: u32,
}

impl PeerSession {
    pub(crate) fn new(
        local: ConnectionId,
        remote: ConnectionId,
        link: Arc<dyn PeerLink>,
        media: LocalMedia,
        wiring: SessionWiring,
        limits: SessionLimits,
    ) -> Self {
        let SessionWiring {
            outbound,
            events,
            monitor,
            cancel,
        } = wiring;
        monitor.update_signaling_state(SignalingState::Stable);
        Self {
            local,
            remote,
            link,
            state: SignalingState::Stable,
            has_remote_description: false,
            pending_candidates: VecDeque::new(),
            negotiation_pending: false,
            ice_restart_pending: false,
            media,
            remote_media: RemoteMedia::new(),
            monitor,
            outbound,
            events,
            cancel,
            limits,
            answer_deadline: None,
            unanswered_offers: 0,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn answer_deadline(&self) -> Option<Instant> {
        self.answer_deadline
    }

    pub fn remote_media(&self) -> &RemoteMedia {
        &self.remote_media
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub(crate) fn record_error(&self, err: &Error) {
        self.monitor.set_error(err.to_string());
    }

    fn is_live(&self) -> bool {
        self.state != SignalingState::Closed && !self.cancel.is_cancelled()
    }

    fn transition(&mut self, next: SignalingState) {
        if self.state != next {
            debug!(peer = %self.remote, from = %self.state, to = %next, "signaling transition");
        }
        self.state = next;
        self.answer_deadline = (next == SignalingState::HaveLocalOffer)
            .then(|| Instant::now() + self.limits.answer_timeout);
        self.monitor.update_signaling_state(next);
    }

    fn send(&self, signal: Signal) {
        let _ = self.outbound.send(Outbound {
            target: self.remote.clone(),
            signal,
        });
    }

    /// Attaches local media and, when this side initiates, sends the first offer.
    pub async fn start(&mut self, initiate: bool) -> Result<()> {
        self.link.sync_local_media(&self.media).await?;
        if initiate {
            self.negotiate().await?;
        }
        Ok(())
    }

    /// Local negotiation needed. Outside `Stable` the request is remembered
    /// and folded into one renegotiation once the handshake settles.
    pub async fn negotiate(&mut self) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        if self.state != SignalingState::Stable {
            debug!(peer = %self.remote, state = %self.state, "negotiation deferred");
            self.negotiation_pending = true;
            return Ok(());
        }
        let ice_restart = self.ice_restart_pending;
        self.negotiation_pending = false;
        self.ice_restart_pending = false;

        let offer = self.link.create_offer(ice_restart).await?;
        if !self.is_live() {
            debug!(peer = %self.remote, "discarding offer produced after close");
            return Ok(());
        }
        let sdp = offer.sdp.clone();
        self.link.set_local_description(offer).await?;
        self.transition(SignalingState::HaveLocalOffer);
        info!(peer = %self.remote, ice_restart, "sending offer");
        self.send(Signal::Offer(sdp));
        Ok(())
    }

    async fn resume_deferred(&mut self) -> Result<()> {
        if self.negotiation_pending || self.ice_restart_pending {
            self.negotiate().await?;
        }
        Ok(())
    }

    pub async fn on_remote_offer(&mut self, sdp: String) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        match self.state {
            SignalingState::Stable => self.accept_offer(sdp).await,
            SignalingState::HaveLocalOffer => {
                if self.remote.outranks(&self.local) {
                    info!(peer = %self.remote, "glare: rolling back local offer");
                    self.link.rollback().await?;
                    self.transition(SignalingState::Stable);
                    self.accept_offer(sdp).await
                } else {
                    info!(peer = %self.remote, "glare: keeping local offer");
                    Ok(())
                }
            }
            SignalingState::HaveRemoteOffer => Err(Error::ProtocolViolation {
                peer: self.remote.clone(),
                reason: "offer while a remote offer is pending".to_string(),
            }),
            SignalingState::Closed => Ok(()),
        }
    }

    async fn accept_offer(&mut self, sdp: String) -> Result<()> {
        self.link
            .set_remote_description(Description::offer(sdp))
            .await?;
        self.has_remote_description = true;
        self.transition(SignalingState::HaveRemoteOffer);
        self.flush_candidates().await;

        let answer = self.link.create_answer().await?;
        if !self.is_live() {
            debug!(peer = %self.remote, "discarding answer produced after close");
            return Ok(());
        }
        let sdp = answer.sdp.clone();
        self.link.set_local_description(answer).await?;
        self.transition(SignalingState::Stable);
        info!(peer = %self.remote, "sending answer");
        self.send(Signal::Answer(sdp));

        self.resume_deferred().await
    }

    pub async fn on_remote_answer(&mut self, sdp: String) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        if self.state != SignalingState::HaveLocalOffer {
            return Err(Error::UnexpectedAnswer {
                peer: self.remote.clone(),
                state: self.state.to_string(),
            });
        }
        self.link
            .set_remote_description(Description::answer(sdp))
            .await?;
        self.has_remote_description = true;
        self.unanswered_offers = 0;
        self.transition(SignalingState::Stable);
        self.flush_candidates().await;

        self.resume_deferred().await
    }

    /// The outstanding offer was never answered. It is rolled back and a
    /// fresh one is sent, at most `max_answer_timeouts` times in a row.
    pub async fn on_answer_timeout(&mut self) -> Result<()> {
        self.answer_deadline = None;
        if !self.is_live() || self.state != SignalingState::HaveLocalOffer {
            return Ok(());
        }
        self.unanswered_offers += 1;
        if self.unanswered_offers > self.limits.max_answer_timeouts {
            return Err(Error::AnswerTimeout {
                peer: self.remote.clone(),
                offers: self.unanswered_offers,
            });
        }
        warn!(peer = %self.remote, attempt = self.unanswered_offers, "offer unanswered, offering again");
        self.link.rollback().await?;
        self.transition(SignalingState::Stable);
        self.negotiate().await
    }

    /// Drops a half-finished handshake after a failed step so the session is
    /// back in `Stable`.
    pub(crate) async fn abort_negotiation(&mut self) {
        if matches!(
            self.state,
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer
        ) {
            if let Err(e) = self.link.rollback().await {
                debug!(peer = %self.remote, "rollback after failure: {}", e);
            }
            self.transition(SignalingState::Stable);
        }
        self.negotiation_pending = false;
        self.ice_restart_pending = false;
    }

    pub async fn on_remote_candidate(&mut self, candidate: String) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        if !self.has_remote_description {
            debug!(peer = %self.remote, queued = self.pending_candidates.len() + 1, "candidate queued");
            self.pending_candidates.push_back(candidate);
            return Ok(());
        }
        if let Err(e) = self.link.add_remote_candidate(&candidate).await {
            warn!(peer = %self.remote, "Failed to add remote candidate: {}", e);
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.link.add_remote_candidate(&candidate).await {
                warn!(peer = %self.remote, "Failed to add queued candidate: {}", e);
            }
        }
    }

    pub async fn on_local_media_changed(&mut self, media: LocalMedia) -> Result<()> {
        if !self.is_live() || media.same_tracks(&self.media) {
            return Ok(());
        }
        self.media = media;
        self.link.sync_local_media(&self.media).await?;
        self.negotiation_pending = true;
        self.negotiate().await
    }

    pub async fn on_link_event(&mut self, event: LinkEvent) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.send(Signal::Candidate(candidate));
                Ok(())
            }
            LinkEvent::RemoteTrack(track) => {
                debug!(peer = %self.remote, kind = %track.kind, id = %track.id, "remote track");
                if self.remote_media.push(track) {
                    let _ = self.events.send(EngineEvent::RemoteStream {
                        peer: self.remote.clone(),
                        media: self.remote_media.clone(),
                    });
                }
                Ok(())
            }
            LinkEvent::PathState(state) => self.on_path_state(state).await,
        }
    }

    async fn on_path_state(&mut self, state: PathState) -> Result<()> {
        self.monitor.update_path_state(state);
        if state != PathState::Failed {
            return Ok(());
        }
        match self.link.restart_path().await {
            Ok(()) => {
                info!(peer = %self.remote, "path rediscovery started");
                Ok(())
            }
            Err(e) => {
                info!(peer = %self.remote, "path rediscovery unavailable ({}), renegotiating", e);
                self.monitor.set_error(format!("path failed: {}", e));
                self.ice_restart_pending = true;
                self.negotiate().await
            }
        }
    }

    /// Terminal. Releases the transport and empties the remote aggregate.
    pub async fn close(&mut self) {
        if self.state == SignalingState::Closed {
            return;
        }
        self.transition(SignalingState::Closed);
        self.cancel.cancel();
        self.pending_candidates.clear();
        self.negotiation_pending = false;
        self.ice_restart_pending = false;
        self.link.close().await;
        self.remote_media.clear();
        self.monitor.update_path_state(PathState::Closed);
        info!(peer = %self.remote, "peer session closed");
    }
}
