use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{ConnectivityState, PeerStatus};
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaCapture, TrackKind};
use crate::negotiation::{
    ConnectionId, EngineEvent, EngineSettings, NegotiationEngine, Outbound, RemoteMedia,
};
use crate::peer::LinkFactory;
use crate::room::{MembershipAction, Participant, RoomMembership};
use crate::signaling::{SignalingChannel, SignalingEvent, Target};

/// What the UI layer observes. Delivered in order on one stream.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RemoteStream {
        peer: ConnectionId,
        media: RemoteMedia,
    },
    ParticipantJoined {
        peer: ConnectionId,
        display_name: String,
    },
    ParticipantLeft(ConnectionId),
    RoomNotFound(String),
    ConnectivityChanged(ConnectivityState),
    NegotiationAbandoned(ConnectionId),
    ConnectionIdChanged(ConnectionId),
}

struct SessionInner {
    channel: Arc<dyn SignalingChannel>,
    capture: AsyncMutex<Box<dyn MediaCapture>>,
    engine: NegotiationEngine,
    membership: Mutex<RoomMembership>,
    /// Everything the capture produced.
    captured: Mutex<LocalMedia>,
    /// The subset currently offered to peers.
    published: Mutex<LocalMedia>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
}

/// Entry point for the UI layer: owns the signaling channel, the local media
/// and the negotiation engine for one participant.
pub struct Session {
    inner: Arc<SessionInner>,
    tasks: Vec<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    /// Wires the collaborators together and starts the event pumps. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: &Config,
        channel: Arc<dyn SignalingChannel>,
        capture: Box<dyn MediaCapture>,
        factory: Arc<dyn LinkFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();

        let engine = NegotiationEngine::new(
            factory,
            EngineSettings::from(config),
            outbound_tx,
            engine_tx,
        );
        let inner = Arc::new(SessionInner {
            channel: Arc::clone(&channel),
            capture: AsyncMutex::new(capture),
            engine,
            membership: Mutex::new(RoomMembership::new()),
            captured: Mutex::new(LocalMedia::default()),
            published: Mutex::new(LocalMedia::default()),
            events: events_tx,
            shutdown: CancellationToken::new(),
        });

        let mut tasks = vec![
            tokio::spawn(Arc::clone(&inner).forward_outbound(outbound_rx)),
            tokio::spawn(Arc::clone(&inner).forward_engine_events(engine_rx)),
            tokio::spawn(Arc::clone(&inner).watch_connectivity(channel.connectivity())),
        ];
        match channel.take_events() {
            Some(events) => tasks.push(tokio::spawn(Arc::clone(&inner).pump_signaling(events))),
            None => warn!("signaling events already taken, session will not see the room"),
        }

        (Self { inner, tasks }, events_rx)
    }

    /// Acquires local media and offers it to every current and future peer.
    pub async fn start(&self) -> Result<()> {
        let media = self.inner.capture.lock().await.acquire().await?;
        *lock(&self.inner.captured) = media.clone();
        *lock(&self.inner.published) = media.clone();
        self.inner.engine.set_local_media(media);
        Ok(())
    }

    /// Connects if needed and joins `room_id`. Joining the current room again
    /// is a no-op.
    pub async fn join(&self, room_id: &str) -> Result<()> {
        let inner = &self.inner;
        let id = inner.channel.connect().await?;
        inner.adopt_connection_id(id).await;

        let action = lock(&inner.membership).enter(room_id);
        if let Some(action) = action {
            inner.apply(action).await;
        }
        inner.engine.activate();

        match inner.channel.join_room(room_id).await {
            Ok(()) => {
                info!(room = %room_id, "joined room");
                Ok(())
            }
            Err(e) => {
                warn!(room = %room_id, "Failed to join room: {}", e);
                inner.engine.deactivate();
                let action = lock(&inner.membership).leave();
                inner.apply(action).await;
                Err(e)
            }
        }
    }

    /// Tears everything down. Never fails; problems are logged.
    pub async fn leave(&self) {
        let inner = &self.inner;
        inner.engine.deactivate();
        let (room, action) = {
            let mut membership = lock(&inner.membership);
            let room = membership.room().map(str::to_string);
            (room, membership.leave())
        };
        inner.apply(action).await;

        if let Some(room) = room {
            inner.channel.leave_room(&room).await;
            info!(room = %room, "left room");
        }

        inner.capture.lock().await.release();
        *lock(&inner.captured) = LocalMedia::default();
        *lock(&inner.published) = LocalMedia::default();
        inner.engine.set_local_media(LocalMedia::default());
    }

    /// Leaves, closes the channel and stops the event pumps.
    pub async fn close(mut self) {
        self.leave().await;
        self.inner.channel.close();
        self.inner.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Flips the track's enabled flag. Peers keep the same track, so no
    /// renegotiation happens.
    pub async fn set_muted(&self, kind: TrackKind, muted: bool) {
        self.inner
            .capture
            .lock()
            .await
            .set_track_enabled(kind, !muted);
    }

    pub fn is_muted(&self, kind: TrackKind) -> Option<bool> {
        lock(&self.inner.captured)
            .track(kind)
            .map(|track| !track.is_enabled())
    }

    /// Adds or removes a captured track from what peers receive. Unlike
    /// muting this renegotiates with every peer.
    pub fn set_track_published(&self, kind: TrackKind, published: bool) -> Result<()> {
        let media = {
            let mut current = lock(&self.inner.published);
            let track = if published {
                let captured = lock(&self.inner.captured);
                let track = captured.track(kind).cloned().ok_or_else(|| {
                    Error::MediaUnavailable(format!("no captured {} track", kind))
                })?;
                Some(track)
            } else {
                None
            };
            current.set_track(kind, track);
            current.clone()
        };
        debug!(%kind, published, "local track set changed");
        self.inner.engine.set_local_media(media);
        Ok(())
    }

    pub fn local_media(&self) -> LocalMedia {
        lock(&self.inner.published).clone()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.channel.connection_id()
    }

    pub fn room(&self) -> Option<String> {
        lock(&self.inner.membership).room().map(str::to_string)
    }

    pub fn participants(&self) -> Vec<Participant> {
        lock(&self.inner.membership).participants()
    }

    /// Connection ids with a live peer session.
    pub fn peers(&self) -> Vec<ConnectionId> {
        self.inner.engine.peers()
    }

    pub fn peer_status(&self, peer: &ConnectionId) -> Option<PeerStatus> {
        self.inner.engine.peer_status(peer)
    }

    pub fn watch_peer(&self, peer: &ConnectionId) -> Option<watch::Receiver<PeerStatus>> {
        self.inner.engine.subscribe(peer)
    }

    pub fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.channel.connectivity()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn apply(&self, action: MembershipAction) {
        match action {
            MembershipAction::Open { peer, initiate } => {
                self.engine.create_session(&peer, initiate);
            }
            MembershipAction::Close(peer) => self.engine.close_session(&peer).await,
            MembershipAction::CloseAll => self.engine.close_all().await,
        }
    }

    /// Returns true when `id` replaced a different local id.
    async fn adopt_connection_id(&self, id: ConnectionId) -> bool {
        self.engine.set_local_id(id.clone());
        let action = lock(&self.membership).set_local_id(id);
        match action {
            Some(action) => {
                self.apply(action).await;
                true
            }
            None => false,
        }
    }

    async fn forward_outbound(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = outbound.recv() => next,
            };
            let Some(Outbound { target, signal }) = next else {
                break;
            };
            self.channel.send(Target::Peer(target), signal);
        }
    }

    async fn forward_engine_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = events.recv() => next,
            };
            match next {
                Some(EngineEvent::RemoteStream { peer, media }) => {
                    self.emit(SessionEvent::RemoteStream { peer, media });
                }
                Some(EngineEvent::Abandoned { peer }) => {
                    self.emit(SessionEvent::NegotiationAbandoned(peer));
                }
                None => break,
            }
        }
    }

    async fn watch_connectivity(self: Arc<Self>, mut state: watch::Receiver<ConnectivityState>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let current = *state.borrow_and_update();
            self.emit(SessionEvent::ConnectivityChanged(current));
        }
    }

    async fn pump_signaling(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SignalingEvent>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = events.recv() => next,
            };
            match next {
                Some(event) => self.handle_signaling(event).await,
                None => break,
            }
        }
        debug!("signaling pump stopped");
    }

    async fn handle_signaling(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected(id) => {
                let replaced = self.adopt_connection_id(id.clone()).await;
                self.emit(SessionEvent::ConnectionIdChanged(id));
                if replaced {
                    self.rejoin();
                }
            }
            SignalingEvent::Reconnecting => {
                // every remote id is meaningless to the relay from here on
                let action = lock(&self.membership).reset();
                self.apply(action).await;
            }
            SignalingEvent::ParticipantJoined {
                connection_id,
                display_name,
            } => {
                let action = lock(&self.membership)
                    .on_joined(connection_id.clone(), display_name.clone());
                if let Some(action) = action {
                    self.apply(action).await;
                    self.emit(SessionEvent::ParticipantJoined {
                        peer: connection_id,
                        display_name,
                    });
                }
            }
            SignalingEvent::ParticipantLeft(connection_id) => {
                let action = lock(&self.membership).on_left(&connection_id);
                if let Some(action) = action {
                    self.apply(action).await;
                    self.emit(SessionEvent::ParticipantLeft(connection_id));
                }
            }
            SignalingEvent::OfferReceived { sdp, from } => self.engine.handle_offer(&from, sdp),
            SignalingEvent::AnswerReceived { sdp, from } => self.engine.handle_answer(&from, sdp),
            SignalingEvent::CandidateReceived { candidate, from } => {
                self.engine.handle_candidate(&from, candidate)
            }
            SignalingEvent::RoomNotFound(room) => {
                warn!(room = %room, "relay reports no such room");
                self.emit(SessionEvent::RoomNotFound(room));
            }
            SignalingEvent::Closed => {
                self.engine.deactivate();
                let action = lock(&self.membership).reset();
                self.apply(action).await;
            }
        }
    }

    /// Joins the remembered room again under the new connection id.
    fn rejoin(self: &Arc<Self>) {
        let Some(room) = lock(&self.membership).room().map(str::to_string) else {
            return;
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            info!(room = %room, "rejoining room after reconnect");
            if let Err(e) = inner.channel.join_room(&room).await {
                warn!(room = %room, "Failed to rejoin room: {}", e);
                if matches!(e, Error::RoomJoinRejected(_)) {
                    let action = lock(&inner.membership).leave();
                    inner.apply(action).await;
                }
            }
        });
    }
}
