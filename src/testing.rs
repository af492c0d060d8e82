//! In-process stand-ins for the relay, the peer transport and the capture
//! devices, used by unit tests across the crate.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::connection::ConnectivityState;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, LocalTrack, MediaCapture, TrackKind};
use crate::negotiation::ConnectionId;
use crate::peer::{Description, LinkEvent, LinkFactory, PeerLink};
use crate::signaling::{Signal, SignalingChannel, SignalingEvent, Target};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    SyncMedia(Vec<TrackKind>),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(Description),
    SetRemote(Description),
    Rollback,
    AddCandidate(String),
    RestartPath,
    Close,
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Records every call and produces unique descriptions.
pub struct FakeLink {
    label: String,
    calls: Mutex<Vec<LinkCall>>,
    offers: AtomicU32,
    answers: AtomicU32,
    fail_next_answer: AtomicBool,
    path_restart: AtomicBool,
    structural_remote: AtomicBool,
    closed: AtomicBool,
    answer_hook: Mutex<Option<Hook>>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self::labelled("link")
    }

    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            calls: Mutex::new(Vec::new()),
            offers: AtomicU32::new(0),
            answers: AtomicU32::new(0),
            fail_next_answer: AtomicBool::new(false),
            path_restart: AtomicBool::new(true),
            structural_remote: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            answer_hook: Mutex::new(None),
        }
    }

    fn record(&self, call: LinkCall) {
        lock(&self.calls).push(call);
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        lock(&self.calls).clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                LinkCall::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn offers_created(&self) -> u32 {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next_answer(&self) {
        self.fail_next_answer.store(true, Ordering::SeqCst);
    }

    pub fn disable_path_restart(&self) {
        self.path_restart.store(false, Ordering::SeqCst);
    }

    pub fn fail_remote_descriptions_structurally(&self) {
        self.structural_remote.store(true, Ordering::SeqCst);
    }

    /// Runs `hook` every time an answer is produced, before it is returned.
    pub fn on_create_answer(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.answer_hook) = Some(Box::new(hook));
    }
}

impl Default for FakeLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn sync_local_media(&self, media: &LocalMedia) -> Result<()> {
        self.record(LinkCall::SyncMedia(media.kinds()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<Description> {
        self.record(LinkCall::CreateOffer { ice_restart });
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Description::offer(format!("offer-{}-{}", self.label, n)))
    }

    async fn create_answer(&self) -> Result<Description> {
        self.record(LinkCall::CreateAnswer);
        if self.fail_next_answer.swap(false, Ordering::SeqCst) {
            return Err(Error::Other(anyhow::anyhow!("answer generation failed")));
        }
        if let Some(hook) = lock(&self.answer_hook).as_ref() {
            hook();
        }
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Description::answer(format!("answer-{}-{}", self.label, n)))
    }

    async fn set_local_description(&self, desc: Description) -> Result<()> {
        self.record(LinkCall::SetLocal(desc));
        Ok(())
    }

    async fn set_remote_description(&self, desc: Description) -> Result<()> {
        self.record(LinkCall::SetRemote(desc));
        if self.structural_remote.load(Ordering::SeqCst) {
            return Err(Error::StructuralMismatch(
                "media sections do not match".to_string(),
            ));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record(LinkCall::Rollback);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        self.record(LinkCall::AddCandidate(candidate.to_string()));
        Ok(())
    }

    async fn restart_path(&self) -> Result<()> {
        self.record(LinkCall::RestartPath);
        if self.path_restart.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Other(anyhow::anyhow!("restart unsupported")))
        }
    }

    async fn close(&self) {
        self.record(LinkCall::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct OpenedLink {
    peer: ConnectionId,
    link: Arc<FakeLink>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

/// Hands out [`FakeLink`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakeLinkFactory {
    opened: Mutex<Vec<OpenedLink>>,
    structural_remote: AtomicBool,
    structural_links: AtomicUsize,
    notify: tokio::sync::Notify,
}

impl FakeLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every link opened from now on rejects remote descriptions.
    pub fn fail_remote_descriptions_structurally(&self) {
        self.structural_remote.store(true, Ordering::SeqCst);
    }

    /// Only the next `count` links reject remote descriptions.
    pub fn fail_next_links_structurally(&self, count: usize) {
        self.structural_links.store(count, Ordering::SeqCst);
    }

    pub fn opened(&self, peer: &ConnectionId) -> Vec<Arc<FakeLink>> {
        lock(&self.opened)
            .iter()
            .filter(|o| &o.peer == peer)
            .map(|o| Arc::clone(&o.link))
            .collect()
    }

    pub fn latest(&self, peer: &ConnectionId) -> Option<Arc<FakeLink>> {
        self.opened(peer).pop()
    }

    pub fn total_opened(&self) -> usize {
        lock(&self.opened).len()
    }

    /// Feeds a transport event into the newest link for `peer`.
    pub fn inject(&self, peer: &ConnectionId, event: LinkEvent) -> bool {
        lock(&self.opened)
            .iter()
            .rev()
            .find(|o| &o.peer == peer)
            .map(|o| o.events.send(event).is_ok())
            .unwrap_or(false)
    }

    pub async fn wait_for_link(&self, peer: &ConnectionId) -> Arc<FakeLink> {
        self.wait_for_nth_link(peer, 1).await
    }

    pub async fn wait_for_nth_link(&self, peer: &ConnectionId, n: usize) -> Arc<FakeLink> {
        loop {
            let notified = self.notify.notified();
            let links = self.opened(peer);
            if links.len() >= n {
                return Arc::clone(&links[n - 1]);
            }
            let _ = tokio::time::timeout(Duration::from_millis(20), notified).await;
        }
    }
}

#[async_trait]
impl LinkFactory for FakeLinkFactory {
    async fn open(
        &self,
        peer: &ConnectionId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(FakeLink::labelled(peer.as_str()));
        let broken = self
            .structural_links
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if broken || self.structural_remote.load(Ordering::SeqCst) {
            link.fail_remote_descriptions_structurally();
        }
        lock(&self.opened).push(OpenedLink {
            peer: peer.clone(),
            link: Arc::clone(&link),
            events,
        });
        self.notify.notify_waiters();
        Ok(link)
    }
}

struct RelayClient {
    events: mpsc::UnboundedSender<SignalingEvent>,
    display_name: String,
    room: Option<String>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    rooms: HashSet<String>,
    members: HashMap<String, BTreeSet<ConnectionId>>,
    clients: HashMap<ConnectionId, RelayClient>,
    unreachable: bool,
}

/// Relay that routes between [`MemoryChannel`]s without a network.
pub struct MemoryRelay {
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    pub fn new(rooms: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RelayState {
                next_id: 1,
                rooms: rooms.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            }),
        })
    }

    /// The id handed to the next client that connects.
    pub fn assign_next_id(&self, id: u64) {
        lock(&self.state).next_id = id;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    pub fn channel(self: &Arc<Self>, display_name: &str) -> Arc<MemoryChannel> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connectivity, _) = watch::channel(ConnectivityState::Disconnected);
        Arc::new(MemoryChannel {
            relay: Arc::clone(self),
            display_name: display_name.to_string(),
            id: Mutex::new(None),
            room: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connectivity,
            sent: AtomicU64::new(0),
        })
    }

    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        lock(&self.state)
            .members
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn register(
        &self,
        events: mpsc::UnboundedSender<SignalingEvent>,
        display_name: &str,
    ) -> Result<ConnectionId> {
        let mut state = lock(&self.state);
        if state.unreachable {
            return Err(Error::ChannelUnavailable("relay unreachable".to_string()));
        }
        let id = ConnectionId::new(state.next_id.to_string());
        state.next_id += 1;
        state.clients.insert(
            id.clone(),
            RelayClient {
                events,
                display_name: display_name.to_string(),
                room: None,
            },
        );
        Ok(id)
    }

    fn deliver(state: &RelayState, to: &ConnectionId, event: SignalingEvent) {
        if let Some(client) = state.clients.get(to) {
            let _ = client.events.send(event);
        }
    }

    fn join(&self, id: &ConnectionId, room: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.rooms.contains(room) {
            Self::deliver(&state, id, SignalingEvent::RoomNotFound(room.to_string()));
            return Err(Error::RoomJoinRejected(room.to_string()));
        }
        let Some(display_name) = state.clients.get(id).map(|c| c.display_name.clone()) else {
            return Err(Error::NotConnected);
        };
        let existing: Vec<ConnectionId> = state
            .members
            .get(room)
            .map(|m| m.iter().filter(|m| *m != id).cloned().collect())
            .unwrap_or_default();
        for member in &existing {
            Self::deliver(
                &state,
                member,
                SignalingEvent::ParticipantJoined {
                    connection_id: id.clone(),
                    display_name: display_name.clone(),
                },
            );
            let name = state
                .clients
                .get(member)
                .map(|c| c.display_name.clone())
                .unwrap_or_default();
            Self::deliver(
                &state,
                id,
                SignalingEvent::ParticipantJoined {
                    connection_id: member.clone(),
                    display_name: name,
                },
            );
        }
        state
            .members
            .entry(room.to_string())
            .or_default()
            .insert(id.clone());
        if let Some(client) = state.clients.get_mut(id) {
            client.room = Some(room.to_string());
        }
        Ok(())
    }

    fn leave(&self, id: &ConnectionId) {
        let mut state = lock(&self.state);
        let Some(room) = state.clients.get_mut(id).and_then(|c| c.room.take()) else {
            return;
        };
        let remaining: Vec<ConnectionId> = match state.members.get_mut(&room) {
            Some(members) => {
                members.remove(id);
                members.iter().cloned().collect()
            }
            None => Vec::new(),
        };
        for member in remaining {
            Self::deliver(&state, &member, SignalingEvent::ParticipantLeft(id.clone()));
        }
    }

    fn drop_client(&self, id: &ConnectionId) {
        self.leave(id);
        lock(&self.state).clients.remove(id);
    }

    fn route(&self, from: &ConnectionId, target: Target, signal: Signal) {
        let state = lock(&self.state);
        let recipients: Vec<ConnectionId> = match target {
            Target::Peer(peer) => vec![peer],
            Target::Room => {
                let room = state.clients.get(from).and_then(|c| c.room.clone());
                room.and_then(|r| state.members.get(&r))
                    .map(|m| m.iter().filter(|m| *m != from).cloned().collect())
                    .unwrap_or_default()
            }
        };
        for to in recipients {
            let event = match &signal {
                Signal::Offer(sdp) => SignalingEvent::OfferReceived {
                    sdp: sdp.clone(),
                    from: from.clone(),
                },
                Signal::Answer(sdp) => SignalingEvent::AnswerReceived {
                    sdp: sdp.clone(),
                    from: from.clone(),
                },
                Signal::Candidate(candidate) => SignalingEvent::CandidateReceived {
                    candidate: candidate.clone(),
                    from: from.clone(),
                },
            };
            Self::deliver(&state, &to, event);
        }
    }
}

/// A client of [`MemoryRelay`].
pub struct MemoryChannel {
    relay: Arc<MemoryRelay>,
    display_name: String,
    id: Mutex<Option<ConnectionId>>,
    room: Mutex<Option<String>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    connectivity: watch::Sender<ConnectivityState>,
    sent: AtomicU64,
}

impl MemoryChannel {
    pub fn signals_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Drops the relay connection and comes back under a new id, the way a
    /// real transport loss does.
    pub fn simulate_reconnect(&self) -> Result<ConnectionId> {
        if let Some(old) = lock(&self.id).take() {
            self.relay.drop_client(&old);
        }
        *lock(&self.room) = None;
        let _ = self.connectivity.send(ConnectivityState::Reconnecting);
        let _ = self.events_tx.send(SignalingEvent::Reconnecting);

        let id = self
            .relay
            .register(self.events_tx.clone(), &self.display_name)?;
        *lock(&self.id) = Some(id.clone());
        let _ = self.connectivity.send(ConnectivityState::Connected);
        let _ = self.events_tx.send(SignalingEvent::Connected(id.clone()));
        Ok(id)
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn connect(&self) -> Result<ConnectionId> {
        if let Some(id) = lock(&self.id).clone() {
            return Ok(id);
        }
        let id = self
            .relay
            .register(self.events_tx.clone(), &self.display_name)?;
        *lock(&self.id) = Some(id.clone());
        let _ = self.connectivity.send(ConnectivityState::Connected);
        let _ = self.events_tx.send(SignalingEvent::Connected(id.clone()));
        Ok(id)
    }

    async fn join_room(&self, room_id: &str) -> Result<()> {
        let id = lock(&self.id).clone().ok_or(Error::NotConnected)?;
        if lock(&self.room).as_deref() == Some(room_id) {
            return Ok(());
        }
        self.relay.leave(&id);
        self.relay.join(&id, room_id)?;
        *lock(&self.room) = Some(room_id.to_string());
        Ok(())
    }

    async fn leave_room(&self, room_id: &str) {
        let mut room = lock(&self.room);
        if room.as_deref() != Some(room_id) {
            return;
        }
        *room = None;
        if let Some(id) = lock(&self.id).clone() {
            self.relay.leave(&id);
        }
    }

    fn send(&self, target: Target, signal: Signal) {
        let Some(id) = lock(&self.id).clone() else {
            return;
        };
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.relay.route(&id, target, signal);
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.id).clone()
    }

    fn connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        lock(&self.events_rx).take()
    }

    fn close(&self) {
        if let Some(id) = lock(&self.id).take() {
            self.relay.drop_client(&id);
        }
        *lock(&self.room) = None;
        let _ = self.connectivity.send(ConnectivityState::Disconnected);
        let _ = self.events_tx.send(SignalingEvent::Closed);
    }
}

/// Capture that hands out fresh tracks without touching devices.
#[derive(Clone)]
pub struct FakeCapture {
    kinds: Vec<TrackKind>,
    media: Arc<Mutex<Option<LocalMedia>>>,
    acquired: Arc<AtomicU32>,
    released: Arc<AtomicBool>,
}

impl FakeCapture {
    pub fn new(kinds: &[TrackKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            media: Arc::new(Mutex::new(None)),
            acquired: Arc::new(AtomicU32::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A capture with no usable devices.
    pub fn unavailable() -> Self {
        Self::new(&[])
    }

    pub fn acquisitions(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn media(&self) -> Option<LocalMedia> {
        lock(&self.media).clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&mut self) -> Result<LocalMedia> {
        if self.kinds.is_empty() {
            return Err(Error::MediaUnavailable("no capture devices".to_string()));
        }
        let mut media = lock(&self.media);
        if let Some(existing) = media.as_ref() {
            return Ok(existing.clone());
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
        let mut acquired = LocalMedia::default();
        for kind in &self.kinds {
            acquired.set_track(*kind, Some(LocalTrack::new(*kind, "fake")));
        }
        *media = Some(acquired.clone());
        Ok(acquired)
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        if let Some(track) = lock(&self.media).as_ref().and_then(|m| m.track(kind)) {
            track.set_enabled(enabled);
        }
    }

    fn release(&mut self) {
        *lock(&self.media) = None;
        self.released.store(true, Ordering::SeqCst);
    }
}
