//! In-process backends
//!
//! Everything the engine needs from the outside world, implemented in memory:
//! a publish/subscribe bus, a call directory, simulated peer links that
//! "connect" once both descriptions are exchanged, a capture device that
//! hands out synthetic tracks and an encoder that emits tagged chunks. Used
//! by the `meshcall simulate` command and by the test suites. Every backend
//! records what was asked of it and can be told to fail.

use crate::capture::{CaptureDevice, DeviceError, MediaConstraints};
use crate::directory::{CallDirectory, DirectoryError};
use crate::identity::{Participant, UserId};
use crate::link::{
    LinkError, LinkEvent, LinkEventSink, LinkFactory, LinkHandle, LinkStats, PeerLink,
    TransportState,
};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::recorder::{EncoderSession, RecordingBackend, RecordingError};
use crate::signaling::{
    IceCandidate, SdpKind, SessionDescription, SignalEnvelope, SignalType, SignalingTransport,
    SubscriptionId, Topic, OUTBOUND_DESTINATION,
};
use crate::types::{CallId, CallSession, GroupId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// In-process bus errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopbackError {
    /// The bus was disconnected with [`MemoryBus::set_connected`]
    #[error("Bus not connected")]
    NotConnected,

    /// Publish to a destination other than the outbound one
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// Broadcast for a call whose group is unknown
    #[error("No group bound for call {0}")]
    UnroutableCall(String),
}

// ---------------------------------------------------------------------------
// Signaling bus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscriptions: HashMap<SubscriptionId, (String, mpsc::UnboundedSender<SignalEnvelope>)>,
    routes: HashMap<CallId, GroupId>,
    published: Vec<SignalEnvelope>,
}

/// Publish/subscribe bus routing envelopes the way the messaging server does:
/// unicast by `toUserId`, broadcasts to the group the call belongs to
pub struct MemoryBus {
    connected: AtomicBool,
    state: Mutex<BusState>,
}

impl MemoryBus {
    /// Create a connected bus
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            state: Mutex::new(BusState::default()),
        }
    }

    /// Simulate connection loss or recovery
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Route broadcasts of `call_id` to the group topic of `group_id`
    pub fn bind_call(&self, call_id: &CallId, group_id: &GroupId) {
        self.state
            .lock()
            .routes
            .insert(call_id.clone(), group_id.clone());
    }

    /// Every envelope accepted so far, in publish order
    pub fn published(&self) -> Vec<SignalEnvelope> {
        self.state.lock().published.clone()
    }

    /// Accepted envelopes of one type
    pub fn published_of(&self, signal_type: SignalType) -> Vec<SignalEnvelope> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|e| e.signal_type == signal_type)
            .cloned()
            .collect()
    }

    /// Live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Deliver an envelope straight to a topic, bypassing routing
    pub fn inject(&self, topic: &Topic, envelope: SignalEnvelope) {
        let path = topic.path();
        let state = self.state.lock();
        for (sub_path, tx) in state.subscriptions.values() {
            if *sub_path == path {
                let _ = tx.send(envelope.clone());
            }
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for MemoryBus {
    type Error = LoopbackError;

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, destination: &str, envelope: &SignalEnvelope) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(LoopbackError::NotConnected);
        }
        if destination != OUTBOUND_DESTINATION {
            return Err(LoopbackError::UnknownDestination(destination.to_string()));
        }

        let mut state = self.state.lock();
        let path = match &envelope.to_user_id {
            Some(user) => Topic::User(user.clone()).path(),
            None => {
                let group = state
                    .routes
                    .get(&envelope.call_id)
                    .ok_or_else(|| LoopbackError::UnroutableCall(envelope.call_id.to_string()))?;
                Topic::Group(group.clone()).path()
            }
        };
        state.published.push(envelope.clone());
        state
            .subscriptions
            .retain(|_, (sub_path, tx)| *sub_path != path || tx.send(envelope.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &Topic,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SignalEnvelope>), Self::Error> {
        if !self.is_connected() {
            return Err(LoopbackError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.subscriptions.insert(id, (topic.path(), tx));
        Ok((id, rx))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().subscriptions.remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Call directory
// ---------------------------------------------------------------------------

/// Call directory kept in memory
///
/// One active call per group: initiating while a call is running returns
/// the running call. A call whose last participant leaves is ended.
pub struct InMemoryDirectory {
    calls: Mutex<Vec<CallSession>>,
    profiles: Mutex<HashMap<UserId, Participant>>,
    available: AtomicBool,
    bus: Option<Arc<MemoryBus>>,
}

impl InMemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            bus: None,
        }
    }

    /// Create a directory that binds each new call's broadcasts on `bus`
    pub fn with_bus(bus: Arc<MemoryBus>) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new()
        }
    }

    /// Register the display profile used when a user joins
    pub fn register(&self, participant: Participant) {
        self.profiles
            .lock()
            .insert(participant.user_id.clone(), participant);
    }

    /// Simulate an outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current record of a call
    pub fn call(&self, call_id: &CallId) -> Option<CallSession> {
        self.calls
            .lock()
            .iter()
            .find(|c| &c.call_id == call_id)
            .cloned()
    }

    fn ensure_available(&self) -> Result<(), DirectoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DirectoryError::Unavailable(
                "in-memory directory offline".to_string(),
            ))
        }
    }

    fn profile(&self, user: &UserId) -> Participant {
        self.profiles
            .lock()
            .get(user)
            .cloned()
            .unwrap_or_else(|| Participant::new(user.clone(), user.as_str()))
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallDirectory for InMemoryDirectory {
    async fn initiate(
        &self,
        group_id: &GroupId,
        initiator: &UserId,
    ) -> Result<CallSession, DirectoryError> {
        self.ensure_available()?;
        let profile = self.profile(initiator);
        let mut calls = self.calls.lock();
        if let Some(active) = calls
            .iter()
            .find(|c| &c.group_id == group_id && c.is_active())
        {
            return Ok(active.clone());
        }
        let session = CallSession::new(CallId::new(), group_id.clone(), profile);
        if let Some(bus) = &self.bus {
            bus.bind_call(&session.call_id, group_id);
        }
        calls.push(session.clone());
        Ok(session)
    }

    async fn join(&self, call_id: &CallId, user: &UserId) -> Result<CallSession, DirectoryError> {
        self.ensure_available()?;
        let profile = self.profile(user);
        let mut calls = self.calls.lock();
        let session = calls
            .iter_mut()
            .find(|c| &c.call_id == call_id && c.is_active())
            .ok_or_else(|| DirectoryError::NotFound(call_id.to_string()))?;
        session.add_participant(profile);
        Ok(session.clone())
    }

    async fn leave(&self, call_id: &CallId, user: &UserId) -> Result<(), DirectoryError> {
        self.ensure_available()?;
        let mut calls = self.calls.lock();
        let session = calls
            .iter_mut()
            .find(|c| &c.call_id == call_id)
            .ok_or_else(|| DirectoryError::NotFound(call_id.to_string()))?;
        session.remove_participant(user);
        if session.participants.is_empty() {
            session.end();
        }
        Ok(())
    }

    async fn end(&self, call_id: &CallId) -> Result<(), DirectoryError> {
        self.ensure_available()?;
        let mut calls = self.calls.lock();
        let session = calls
            .iter_mut()
            .find(|c| &c.call_id == call_id)
            .ok_or_else(|| DirectoryError::NotFound(call_id.to_string()))?;
        session.end();
        Ok(())
    }

    async fn get_active(&self, group_id: &GroupId) -> Result<Option<CallSession>, DirectoryError> {
        self.ensure_available()?;
        Ok(self
            .calls
            .lock()
            .iter()
            .find(|c| &c.group_id == group_id && c.is_active())
            .cloned())
    }

    async fn get_history(&self, group_id: &GroupId) -> Result<Vec<CallSession>, DirectoryError> {
        self.ensure_available()?;
        let mut history: Vec<_> = self
            .calls
            .lock()
            .iter()
            .filter(|c| &c.group_id == group_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(history)
    }
}

// ---------------------------------------------------------------------------
// Peer links
// ---------------------------------------------------------------------------

type LinkKey = (UserId, UserId);

#[derive(Default)]
struct NetworkInner {
    links: Mutex<HashMap<LinkKey, Weak<LoopbackLink>>>,
}

/// Shared fabric that lets the two ends of a loopback link find each other
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Link factory for one local user
    pub fn factory(&self, local: impl Into<UserId>) -> LoopbackLinkFactory {
        LoopbackLinkFactory {
            local: local.into(),
            network: self.clone(),
            fail_creation: Mutex::new(HashSet::new()),
            fail_offers: Mutex::new(HashSet::new()),
            created: Mutex::new(Vec::new()),
            next_candidate: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A registered link whose events go nowhere
    pub fn standalone_link(
        &self,
        local: impl Into<UserId>,
        remote: impl Into<UserId>,
    ) -> Arc<LoopbackLink> {
        let remote = remote.into();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = LinkEventSink::new(remote.clone(), 0, tx);
        let link = Arc::new(LoopbackLink::new(
            local.into(),
            remote,
            &[],
            sink,
            Arc::downgrade(&self.inner),
            Arc::new(AtomicU64::new(1)),
        ));
        self.register(&link);
        link
    }

    /// Most recent live link from `local` to `remote`
    pub fn link_between(
        &self,
        local: impl Into<UserId>,
        remote: impl Into<UserId>,
    ) -> Option<Arc<LoopbackLink>> {
        let key = (local.into(), remote.into());
        self.inner.links.lock().get(&key).and_then(Weak::upgrade)
    }

    fn register(&self, link: &Arc<LoopbackLink>) {
        let key = (link.local.clone(), link.remote.clone());
        self.inner.links.lock().insert(key, Arc::downgrade(link));
    }
}

impl NetworkInner {
    fn counterpart(&self, link: &LoopbackLink) -> Option<Arc<LoopbackLink>> {
        let key = (link.remote.clone(), link.local.clone());
        self.links.lock().get(&key).and_then(Weak::upgrade)
    }
}

#[derive(Default)]
struct LinkSim {
    outbound: Vec<MediaTrack>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
    stats: LinkStats,
    fail_stats: bool,
    fail_replace: bool,
    fail_offer: bool,
}

/// Simulated peer link
///
/// Gathers one host candidate whenever a local description is installed and
/// reports CONNECTED as soon as both descriptions are in place, followed by
/// the far end's outbound tracks as remote tracks.
pub struct LoopbackLink {
    local: UserId,
    remote: UserId,
    events: LinkEventSink,
    network: Weak<NetworkInner>,
    next_candidate: Arc<AtomicU64>,
    sim: Mutex<LinkSim>,
}

impl LoopbackLink {
    fn new(
        local: UserId,
        remote: UserId,
        outbound: &[MediaTrack],
        events: LinkEventSink,
        network: Weak<NetworkInner>,
        next_candidate: Arc<AtomicU64>,
    ) -> Self {
        Self {
            local,
            remote,
            events,
            network,
            next_candidate,
            sim: Mutex::new(LinkSim {
                outbound: outbound.to_vec(),
                ..LinkSim::default()
            }),
        }
    }

    /// Counters returned by the next stats reads
    pub fn set_stats(&self, stats: LinkStats) {
        self.sim.lock().stats = stats;
    }

    /// Make stats reads fail
    pub fn fail_stats(&self, fail: bool) {
        self.sim.lock().fail_stats = fail;
    }

    /// Make track replacement fail
    pub fn fail_replace(&self, fail: bool) {
        self.sim.lock().fail_replace = fail;
    }

    /// Report a transport failure
    pub fn fail_transport(&self) {
        self.events
            .emit(LinkEvent::TransportStateChanged(TransportState::Failed));
    }

    /// Deliver a remote track as if the far end started sending it
    pub fn push_remote_track(&self, track: MediaTrack) {
        self.events.emit(LinkEvent::RemoteTrack {
            stream_id: format!("{}-stream", self.remote),
            track,
        });
    }

    /// Remote candidates applied so far
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.sim.lock().applied_candidates.clone()
    }

    /// Installed local description
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.sim.lock().local_description.clone()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.sim.lock().remote_description.clone()
    }

    /// Tracks currently sent
    pub fn outbound_tracks(&self) -> Vec<MediaTrack> {
        self.sim.lock().outbound.clone()
    }

    /// Whether both descriptions were exchanged
    pub fn is_connected(&self) -> bool {
        self.sim.lock().connected
    }

    /// Whether the link was closed
    pub fn is_closed(&self) -> bool {
        self.sim.lock().closed
    }

    fn describe(&self, kind: SdpKind, outbound: &[MediaTrack]) -> SessionDescription {
        let tracks: Vec<_> = outbound
            .iter()
            .map(|t| format!("m={:?}:{}", t.kind(), t.id()))
            .collect();
        let sdp = format!(
            "v=0 o={} s=loopback t={} {}",
            self.local,
            self.remote,
            tracks.join(" ")
        );
        SessionDescription { kind, sdp }
    }

    fn gather_candidate(&self) {
        let seq = self.next_candidate.fetch_add(1, Ordering::Relaxed);
        self.events.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{seq} 1 udp 2122260223 127.0.0.1 {} typ host", 40000 + seq),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    fn maybe_connect(&self) {
        let newly_connected = {
            let mut sim = self.sim.lock();
            let ready = sim.local_description.is_some() && sim.remote_description.is_some();
            if ready && !sim.connected && !sim.closed {
                sim.connected = true;
                true
            } else {
                false
            }
        };
        if !newly_connected {
            return;
        }

        self.events
            .emit(LinkEvent::TransportStateChanged(TransportState::Connecting));
        self.events
            .emit(LinkEvent::TransportStateChanged(TransportState::Connected));

        let far_tracks = self
            .network
            .upgrade()
            .and_then(|n| n.counterpart(self))
            .map(|far| far.outbound_tracks())
            .unwrap_or_default();
        for track in far_tracks {
            self.push_remote_track(track);
        }
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    fn remote_user(&self) -> &UserId {
        &self.remote
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = {
            let mut sim = self.sim.lock();
            if sim.closed {
                return Err(LinkError::Closed);
            }
            if sim.fail_offer {
                return Err(LinkError::Offer("injected offer failure".to_string()));
            }
            let offer = self.describe(SdpKind::Offer, &sim.outbound);
            sim.local_description = Some(offer.clone());
            offer
        };
        self.gather_candidate();
        self.maybe_connect();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = {
            let mut sim = self.sim.lock();
            if sim.closed {
                return Err(LinkError::Closed);
            }
            match &sim.remote_description {
                Some(d) if d.kind == SdpKind::Offer => {}
                _ => return Err(LinkError::Answer("no remote offer applied".to_string())),
            }
            let answer = self.describe(SdpKind::Answer, &sim.outbound);
            sim.local_description = Some(answer.clone());
            answer
        };
        self.gather_candidate();
        self.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        {
            let mut sim = self.sim.lock();
            if sim.closed {
                return Err(LinkError::Closed);
            }
            if description.sdp.is_empty() {
                return Err(LinkError::Description("empty SDP".to_string()));
            }
            sim.remote_description = Some(description);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let mut sim = self.sim.lock();
        if sim.closed {
            return Err(LinkError::Closed);
        }
        if sim.remote_description.is_none() {
            return Err(LinkError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        sim.applied_candidates.push(candidate);
        Ok(())
    }

    async fn replace_outbound_track(
        &self,
        track: &MediaTrack,
    ) -> Result<Option<MediaTrack>, LinkError> {
        let mut sim = self.sim.lock();
        if sim.fail_replace {
            return Err(LinkError::ReplaceTrack {
                kind: track.kind(),
                reason: "injected replace failure".to_string(),
            });
        }
        match sim.outbound.iter_mut().find(|t| t.kind() == track.kind()) {
            Some(slot) => Ok(Some(std::mem::replace(slot, track.clone()))),
            None => {
                sim.outbound.push(track.clone());
                Ok(None)
            }
        }
    }

    async fn outbound_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.sim
            .lock()
            .outbound
            .iter()
            .find(|t| t.kind() == kind)
            .cloned()
    }

    async fn stats(&self) -> Result<LinkStats, LinkError> {
        let sim = self.sim.lock();
        if sim.fail_stats {
            return Err(LinkError::Stats("injected stats failure".to_string()));
        }
        Ok(sim.stats.clone())
    }

    async fn close(&self) -> Result<(), LinkError> {
        {
            let mut sim = self.sim.lock();
            if sim.closed {
                return Ok(());
            }
            sim.closed = true;
        }
        self.events
            .emit(LinkEvent::TransportStateChanged(TransportState::Closed));
        if let Some(far) = self.network.upgrade().and_then(|n| n.counterpart(self)) {
            far.events
                .emit(LinkEvent::TransportStateChanged(TransportState::Disconnected));
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLink")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates [`LoopbackLink`]s for one local user
pub struct LoopbackLinkFactory {
    local: UserId,
    network: LoopbackNetwork,
    fail_creation: Mutex<HashSet<UserId>>,
    fail_offers: Mutex<HashSet<UserId>>,
    created: Mutex<Vec<UserId>>,
    next_candidate: Arc<AtomicU64>,
}

impl LoopbackLinkFactory {
    /// Refuse to create links to `remote`
    pub fn fail_creation_for(&self, remote: impl Into<UserId>) {
        self.fail_creation.lock().insert(remote.into());
    }

    /// Create links to `remote` whose offers fail
    pub fn fail_offers_to(&self, remote: impl Into<UserId>) {
        self.fail_offers.lock().insert(remote.into());
    }

    /// Remote users links were created for, in creation order
    pub fn created_links(&self) -> Vec<UserId> {
        self.created.lock().clone()
    }

    /// Latest link created to `remote`
    pub fn link_to(&self, remote: impl Into<UserId>) -> Option<Arc<LoopbackLink>> {
        self.network.link_between(self.local.clone(), remote)
    }
}

#[async_trait]
impl LinkFactory for LoopbackLinkFactory {
    async fn create_link(
        &self,
        remote: &UserId,
        outbound: &[MediaTrack],
        events: LinkEventSink,
    ) -> Result<LinkHandle, LinkError> {
        if self.fail_creation.lock().contains(remote) {
            return Err(LinkError::Create(format!(
                "injected creation failure for {remote}"
            )));
        }
        let link = Arc::new(LoopbackLink::new(
            self.local.clone(),
            remote.clone(),
            outbound,
            events,
            Arc::downgrade(&self.network.inner),
            Arc::clone(&self.next_candidate),
        ));
        if self.fail_offers.lock().contains(remote) {
            link.sim.lock().fail_offer = true;
        }
        self.network.register(&link);
        self.created.lock().push(remote.clone());
        Ok(link)
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Capture device producing synthetic tracks
pub struct StaticCapture {
    user_media_error: Mutex<Option<DeviceError>>,
    display_error: Mutex<Option<DeviceError>>,
    user_streams: Mutex<Vec<MediaStream>>,
    display_streams: Mutex<Vec<MediaStream>>,
}

impl StaticCapture {
    /// Capture that always succeeds
    pub fn new() -> Self {
        Self {
            user_media_error: Mutex::new(None),
            display_error: Mutex::new(None),
            user_streams: Mutex::new(Vec::new()),
            display_streams: Mutex::new(Vec::new()),
        }
    }

    /// Fail camera/microphone requests with `error`
    pub fn deny_user_media(&self, error: DeviceError) {
        *self.user_media_error.lock() = Some(error);
    }

    /// Fail display requests with `error`
    pub fn deny_display(&self, error: DeviceError) {
        *self.display_error.lock() = Some(error);
    }

    /// Let display requests succeed again
    pub fn allow_display(&self) {
        self.display_error.lock().take();
    }

    /// Streams handed out for camera/microphone
    pub fn user_streams(&self) -> Vec<MediaStream> {
        self.user_streams.lock().clone()
    }

    /// Most recent display stream handed out
    pub fn last_display(&self) -> Option<MediaStream> {
        self.display_streams.lock().last().cloned()
    }
}

impl Default for StaticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevice for StaticCapture {
    async fn acquire_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, DeviceError> {
        if let Some(error) = self.user_media_error.lock().clone() {
            return Err(error);
        }
        let mut stream = MediaStream::new(format!("local-{}", Uuid::new_v4()));
        if constraints.has_audio() {
            stream.add_track(MediaTrack::new(TrackKind::Audio, "microphone"));
        }
        if constraints.has_video() {
            stream.add_track(MediaTrack::new(TrackKind::Video, "camera"));
        }
        self.user_streams.lock().push(stream.clone());
        Ok(stream)
    }

    async fn acquire_display_media(&self, with_audio: bool) -> Result<MediaStream, DeviceError> {
        if let Some(error) = self.display_error.lock().clone() {
            return Err(error);
        }
        let mut stream = MediaStream::new(format!("display-{}", Uuid::new_v4()));
        stream.add_track(MediaTrack::new(TrackKind::Video, "screen"));
        if with_audio {
            stream.add_track(MediaTrack::new(TrackKind::Audio, "system-audio"));
        }
        self.display_streams.lock().push(stream.clone());
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encoder that emits small tagged chunks instead of media
pub struct BufferEncoder {
    supported: Option<Vec<String>>,
    fail_finish: Arc<AtomicBool>,
}

impl BufferEncoder {
    /// Encoder supporting every format
    pub fn new() -> Self {
        Self {
            supported: None,
            fail_finish: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Encoder supporting only the listed formats
    pub fn supporting(types: &[&str]) -> Self {
        Self {
            supported: Some(types.iter().map(|t| (*t).to_string()).collect()),
            ..Self::new()
        }
    }

    /// Make finalization fail
    pub fn fail_finish(&self, fail: bool) {
        self.fail_finish.store(fail, Ordering::SeqCst);
    }
}

impl Default for BufferEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend for BufferEncoder {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == mime_type))
    }

    fn open(
        &self,
        stream: &MediaStream,
        mime_type: &str,
    ) -> Result<Box<dyn EncoderSession>, RecordingError> {
        Ok(Box::new(BufferSession {
            mime_type: mime_type.to_string(),
            track_count: stream.len(),
            seq: 0,
            paused: false,
            fail_finish: Arc::clone(&self.fail_finish),
        }))
    }
}

struct BufferSession {
    mime_type: String,
    track_count: usize,
    seq: u64,
    paused: bool,
    fail_finish: Arc<AtomicBool>,
}

#[async_trait]
impl EncoderSession for BufferSession {
    fn request_chunk(&mut self) -> Result<Option<Bytes>, RecordingError> {
        if self.paused {
            return Ok(None);
        }
        self.seq += 1;
        Ok(Some(Bytes::from(format!(
            "[{} chunk={} tracks={}]",
            self.mime_type, self.seq, self.track_count
        ))))
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    async fn finish(self: Box<Self>) -> Result<Option<Bytes>, RecordingError> {
        if self.fail_finish.load(Ordering::SeqCst) {
            return Err(RecordingError::Encoder("finalization failed".to_string()));
        }
        Ok(Some(Bytes::from(format!("[{} end]", self.mime_type))))
    }
}
