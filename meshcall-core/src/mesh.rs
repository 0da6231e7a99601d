//! Full-mesh peer connection manager
//!
//! The mesh keeps exactly one link per remote participant and drives each
//! one from NEW to CONNECTED through the offer/answer/candidate exchange.
//! Signaling deliveries and link notifications are turned into
//! [`MeshInput`]s and processed one at a time by a single router task, so
//! link state transitions never interleave.
//!
//! Negotiation on one link never affects another: every per-link failure is
//! logged, surfaced as [`MeshEvent::LinkFailed`] and otherwise swallowed.

use crate::capture::{CaptureDevice, DeviceError};
use crate::config::{ConfigError, MeshConfig, RecordingConfig};
use crate::directory::{CallDirectory, DirectoryError};
use crate::identity::{Participant, UserId};
use crate::link::{
    LinkError, LinkEvent, LinkEventSink, LinkFactory, LinkHandle, LinkNotification,
    TransportState,
};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::monitor::NetworkQualityMonitor;
use crate::recorder::{RecordingArtifact, RecordingBackend, RecordingError, StreamRecorder};
use crate::registry::{LinkEntry, LinkRegistry, TransitionError};
use crate::signaling::{
    IceCandidate, SdpKind, SessionDescription, Signal, SignalEnvelope, SignalingChannel,
    SignalingError, SignalingTransport, Subscription,
};
use crate::swapper::{MediaTrackSwapper, SwapError};
use crate::types::{CallId, CallSession, LinkRole, LinkState, MeshEvent};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Mesh errors
#[derive(Error, Debug)]
pub enum MeshError {
    /// Local capture failed
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Signaling failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// A link operation failed
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// The call directory refused or failed
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Screen share could not start
    #[error("Screen share error: {0}")]
    Swap(#[from] SwapError),

    /// Recording operation rejected
    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `start` was called twice
    #[error("Mesh already started")]
    AlreadyStarted,

    /// The mesh has been cleaned up
    #[error("Mesh has been shut down")]
    Closed,
}

/// One unit of work for the mesh router
#[derive(Debug, Clone)]
pub enum MeshInput {
    /// Delivery from the per-user topic
    Unicast(SignalEnvelope),
    /// Delivery from the group topic
    Broadcast(SignalEnvelope),
    /// Notification raised by a link backend
    Link(LinkNotification),
}

/// External collaborators of a mesh
pub struct MeshBackends<T: SignalingTransport> {
    /// Publish/subscribe transport for signaling
    pub transport: Arc<T>,
    /// Camera, microphone and display capture
    pub capture: Arc<dyn CaptureDevice>,
    /// Native link construction
    pub links: Arc<dyn LinkFactory>,
    /// Call directory
    pub directory: Arc<dyn CallDirectory>,
    /// Recording encoder
    pub recording: Arc<dyn RecordingBackend>,
}

#[derive(Default)]
struct MeshTasks {
    router: Option<JoinHandle<()>>,
    share_watcher: Option<JoinHandle<()>>,
    sample_forwarder: Option<JoinHandle<()>>,
}

impl MeshTasks {
    fn abort_all(&mut self) {
        for handle in [
            self.router.take(),
            self.share_watcher.take(),
            self.sample_forwarder.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct MeshInner<T: SignalingTransport> {
    local: Participant,
    config: MeshConfig,
    signaling: SignalingChannel<T>,
    capture: Arc<dyn CaptureDevice>,
    link_factory: Arc<dyn LinkFactory>,
    directory: Arc<dyn CallDirectory>,
    session: RwLock<CallSession>,
    registry: tokio::sync::Mutex<LinkRegistry>,
    local_stream: Mutex<Option<MediaStream>>,
    monitor: NetworkQualityMonitor,
    swapper: MediaTrackSwapper,
    recorder: StreamRecorder,
    event_sender: broadcast::Sender<MeshEvent>,
    link_sender: mpsc::UnboundedSender<LinkNotification>,
    link_receiver: Mutex<Option<mpsc::UnboundedReceiver<LinkNotification>>>,
    shutdown: watch::Sender<bool>,
    next_link_id: AtomicU64,
    tasks: Mutex<MeshTasks>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl<T: SignalingTransport> Drop for MeshInner<T> {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
        if let Some(stream) = self.local_stream.get_mut().take() {
            stream.stop_all();
        }
    }
}

/// Full-mesh connection manager for one local participant in one call
pub struct PeerConnectionMesh<T: SignalingTransport> {
    inner: Arc<MeshInner<T>>,
}

impl<T: SignalingTransport> Clone for PeerConnectionMesh<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SignalingTransport> PeerConnectionMesh<T> {
    /// Create a mesh for `local` in `session`
    ///
    /// Nothing is captured, subscribed or offered until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Config`] if the configuration is invalid
    pub fn new(
        local: Participant,
        mut session: CallSession,
        config: MeshConfig,
        backends: MeshBackends<T>,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        session.add_participant(local.clone());

        let signaling = SignalingChannel::new(
            backends.transport,
            local.user_id.clone(),
            session.group_id.clone(),
        );
        let (event_sender, _) = broadcast::channel(config.event_buffer);
        let (link_sender, link_receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let monitor = NetworkQualityMonitor::new(config.monitor.clone())?;
        let swapper = MediaTrackSwapper::new(backends.capture.clone(), config.share_system_audio);
        let recorder = StreamRecorder::new(backends.recording, config.recording.clone());

        Ok(Self {
            inner: Arc::new(MeshInner {
                local,
                config,
                signaling,
                capture: backends.capture,
                link_factory: backends.links,
                directory: backends.directory,
                session: RwLock::new(session),
                registry: tokio::sync::Mutex::new(LinkRegistry::new()),
                local_stream: Mutex::new(None),
                monitor,
                swapper,
                recorder,
                event_sender,
                link_sender,
                link_receiver: Mutex::new(Some(link_receiver)),
                shutdown,
                next_link_id: AtomicU64::new(1),
                tasks: Mutex::new(MeshTasks::default()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Local participant
    pub fn local_user(&self) -> &UserId {
        &self.inner.local.user_id
    }

    /// Call identifier
    pub fn call_id(&self) -> CallId {
        self.inner.session.read().call_id.clone()
    }

    /// Snapshot of the call session
    pub fn session(&self) -> CallSession {
        self.inner.session.read().clone()
    }

    /// Participants in join order, local user included
    pub fn participants(&self) -> Vec<Participant> {
        self.inner.session.read().participants.clone()
    }

    /// Receive mesh events from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.event_sender.subscribe()
    }

    /// Local capture stream, once started
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.local_stream.lock().clone()
    }

    /// Quality monitor fed by this mesh
    pub fn monitor(&self) -> &NetworkQualityMonitor {
        &self.inner.monitor
    }

    /// Whether the mesh has been cleaned up
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Link to `user`, if any
    pub async fn get_link(&self, user: &UserId) -> Option<LinkHandle> {
        self.inner.registry.lock().await.handle(user)
    }

    /// Every link, sorted by remote user
    pub async fn all_links(&self) -> Vec<(UserId, LinkHandle)> {
        self.inner.registry.lock().await.handles()
    }

    /// Negotiation state of the link to `user`
    pub async fn link_state(&self, user: &UserId) -> Option<LinkState> {
        self.inner.registry.lock().await.state(user)
    }

    /// Remote streams of every link that reported remote tracks
    pub async fn remote_streams(&self) -> Vec<(UserId, MediaStream)> {
        self.inner.registry.lock().await.remote_streams()
    }

    /// Whether the screen is being shared
    pub fn is_screen_sharing(&self) -> bool {
        self.inner.swapper.is_sharing()
    }

    /// Whether a recording is running
    pub fn is_recording(&self) -> bool {
        self.inner.recorder.is_recording()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Capture local media, subscribe to signaling and offer to the roster
    ///
    /// A capture or subscription failure aborts setup with nothing
    /// subscribed and no links, after emitting [`MeshEvent::SetupFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Device`] if local capture fails,
    /// [`MeshError::Signaling`] if subscribing fails,
    /// [`MeshError::AlreadyStarted`] or [`MeshError::Closed`]
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id(), user = %self.local_user()))]
    pub async fn start(&self) -> Result<(), MeshError> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(MeshError::AlreadyStarted);
        }

        let stream = match inner.capture.acquire_user_media(&inner.config.constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Local capture failed, aborting call setup");
                inner.started.store(false, Ordering::SeqCst);
                self.emit(MeshEvent::SetupFailed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let subscriptions = match self.subscribe_topics().await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(error = %e, "Signaling subscription failed, aborting call setup");
                stream.stop_all();
                inner.started.store(false, Ordering::SeqCst);
                self.emit(MeshEvent::SetupFailed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let Some(link_receiver) = inner.link_receiver.lock().take() else {
            return Err(MeshError::AlreadyStarted);
        };

        *inner.local_stream.lock() = Some(stream);
        self.spawn_sample_forwarder();
        self.spawn_router(subscriptions, link_receiver);

        if inner.config.announce_presence {
            let announce = Signal::UserJoined(inner.local.clone());
            if let Err(e) = inner
                .signaling
                .send_signal(&self.call_id(), None, &announce)
                .await
            {
                tracing::warn!(error = %e, "Failed to announce presence");
            }
        }

        let roster: Vec<UserId> = {
            let session = inner.session.read();
            session
                .remote_participants(&inner.local.user_id)
                .map(|p| p.user_id.clone())
                .collect()
        };
        tracing::info!(peers = roster.len(), "Call setup complete, offering to roster");
        for remote in &roster {
            self.create_offer_to(remote).await;
        }
        Ok(())
    }

    async fn subscribe_topics(&self) -> Result<(Subscription, Subscription), SignalingError> {
        let user = self.inner.signaling.subscribe_user().await?;
        let group = self.inner.signaling.subscribe_group().await?;
        Ok((user, group))
    }

    fn spawn_router(
        &self,
        (mut user_sub, mut group_sub): (Subscription, Subscription),
        mut link_receiver: mpsc::UnboundedReceiver<LinkNotification>,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let input = tokio::select! {
                    _ = shutdown.changed() => break,
                    Some(envelope) = user_sub.recv() => MeshInput::Unicast(envelope),
                    Some(envelope) = group_sub.recv() => MeshInput::Broadcast(envelope),
                    Some(notification) = link_receiver.recv() => MeshInput::Link(notification),
                    else => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let mesh = PeerConnectionMesh { inner };
                mesh.dispatch(input).await;
                if mesh.is_closed() {
                    break;
                }
            }
            tracing::debug!("Mesh router stopped");
        });
        self.inner.tasks.lock().router = Some(handle);
    }

    fn spawn_sample_forwarder(&self) {
        let mut samples = self.inner.monitor.subscribe();
        let events = self.inner.event_sender.clone();
        let handle = tokio::spawn(async move {
            loop {
                match samples.recv().await {
                    Ok(sample) => {
                        let _ = events.send(MeshEvent::QualitySampled(sample));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Quality samples lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.tasks.lock().sample_forwarder = Some(handle);
    }

    /// Close every link and release local media; safe to call repeatedly
    pub async fn cleanup(&self) {
        self.shutdown().await;
    }

    /// Leave the call: notify the directory and the group, then clean up
    ///
    /// # Errors
    ///
    /// Returns the directory's error; cleanup happens regardless
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id(), user = %self.local_user()))]
    pub async fn leave(&self) -> Result<(), MeshError> {
        let call_id = self.call_id();
        let result = self
            .inner
            .directory
            .leave(&call_id, self.local_user())
            .await;
        if !self.is_closed() {
            if let Err(e) = self
                .inner
                .signaling
                .send_signal(&call_id, None, &Signal::UserLeft)
                .await
            {
                tracing::warn!(error = %e, "Failed to broadcast departure");
            }
        }
        self.shutdown().await;
        tracing::info!("Left call");
        result.map_err(Into::into)
    }

    /// End the call for everyone, then clean up
    ///
    /// # Errors
    ///
    /// Returns the directory's error; the broadcast and cleanup happen
    /// regardless
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id(), user = %self.local_user()))]
    pub async fn end_call(&self) -> Result<(), MeshError> {
        let call_id = self.call_id();
        let result = self.inner.directory.end(&call_id).await;
        if !self.is_closed() {
            if let Err(e) = self
                .inner
                .signaling
                .send_signal(&call_id, None, &Signal::CallEnded)
                .await
            {
                tracing::warn!(error = %e, "Failed to broadcast call end");
            }
        }
        self.inner.session.write().end();
        self.shutdown().await;
        self.emit(MeshEvent::CallEnded { call_id });
        result.map_err(Into::into)
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.shutdown.send_replace(true);
        {
            let mut tasks = inner.tasks.lock();
            if let Some(handle) = tasks.share_watcher.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.sample_forwarder.take() {
                handle.abort();
            }
            // The router exits on the shutdown signal; it may be running this very call
            tasks.router.take();
        }

        inner.monitor.stop_all();
        inner.recorder.cleanup();
        inner.swapper.cleanup(&[]).await;

        let drained = inner.registry.lock().await.drain();
        let closed_links = drained.len();
        for (user, entry) in drained {
            if let Err(e) = entry.handle.close().await {
                tracing::warn!(peer = %user, error = %e, "Error closing link");
            }
            self.emit(MeshEvent::PeerRemoved { user_id: user });
        }

        if let Some(stream) = inner.local_stream.lock().take() {
            stream.stop_all();
        }
        tracing::info!(
            call_id = %self.call_id(),
            links = closed_links,
            "Mesh cleaned up"
        );
    }

    // ---------------------------------------------------------------------
    // Router
    // ---------------------------------------------------------------------

    /// Process one input; the router task calls this for every delivery
    pub async fn dispatch(&self, input: MeshInput) {
        if self.is_closed() {
            tracing::trace!("Mesh closed, dropping input");
            return;
        }
        match input {
            MeshInput::Unicast(envelope) => self.on_unicast(envelope).await,
            MeshInput::Broadcast(envelope) => self.on_broadcast(envelope).await,
            MeshInput::Link(notification) => self.handle_link_event(notification).await,
        }
    }

    fn is_current_call(&self, call_id: &CallId) -> bool {
        &self.inner.session.read().call_id == call_id
    }

    async fn on_unicast(&self, envelope: SignalEnvelope) {
        if !self.inner.signaling.accepts_unicast(&envelope) {
            tracing::debug!(
                signal_type = %envelope.signal_type,
                from = %envelope.from_user_id,
                to = ?envelope.to_user_id,
                "Dropping unicast envelope not meant for this session"
            );
            return;
        }
        if !self.is_current_call(&envelope.call_id) {
            tracing::debug!(call_id = %envelope.call_id, "Dropping envelope for another call");
            return;
        }

        let from = envelope.from_user_id.clone();
        match envelope.signal() {
            Ok(Signal::PeerOffer(offer)) => self.handle_offer(&from, offer).await,
            Ok(Signal::PeerAnswer(answer)) => self.handle_answer(&from, answer).await,
            Ok(Signal::IceCandidate(candidate)) => {
                self.handle_ice_candidate(&from, candidate).await;
            }
            Ok(other) => {
                tracing::debug!(signal_type = %other.signal_type(), "Ignoring unicast signal");
            }
            Err(e) => tracing::warn!(peer = %from, error = %e, "Dropping malformed envelope"),
        }
    }

    async fn on_broadcast(&self, envelope: SignalEnvelope) {
        if !self.inner.signaling.accepts_broadcast(&envelope) {
            tracing::trace!(
                signal_type = %envelope.signal_type,
                from = %envelope.from_user_id,
                "Ignoring group envelope"
            );
            return;
        }
        if !self.is_current_call(&envelope.call_id) {
            tracing::debug!(call_id = %envelope.call_id, "Dropping broadcast for another call");
            return;
        }

        let from = envelope.from_user_id.clone();
        match envelope.signal() {
            Ok(Signal::UserJoined(participant)) => self.on_user_joined(participant),
            Ok(Signal::UserLeft) => self.remove_peer(&from).await,
            Ok(Signal::CallEnded) => self.on_call_ended(&from).await,
            Ok(other) => {
                tracing::debug!(signal_type = %other.signal_type(), "Ignoring broadcast signal");
            }
            Err(e) => tracing::warn!(peer = %from, error = %e, "Dropping malformed broadcast"),
        }
    }

    fn on_user_joined(&self, participant: Participant) {
        if participant.user_id == self.inner.local.user_id {
            return;
        }
        let added = self
            .inner
            .session
            .write()
            .add_participant(participant.clone());
        if added {
            tracing::info!(peer = %participant.user_id, "Participant joined");
            self.emit(MeshEvent::PeerJoined { participant });
        } else {
            tracing::debug!(peer = %participant.user_id, "Duplicate join ignored");
        }
    }

    async fn on_call_ended(&self, by: &UserId) {
        tracing::info!(by = %by, "Call ended by remote participant");
        self.inner.session.write().end();
        self.shutdown().await;
        self.emit(MeshEvent::CallEnded {
            call_id: self.call_id(),
        });
    }

    // ---------------------------------------------------------------------
    // Negotiation
    // ---------------------------------------------------------------------

    /// Open a link to `remote` as the offering side and publish the offer
    ///
    /// Does nothing when a live link to `remote` already exists. Any failure
    /// is logged, marks the link FAILED and leaves other links untouched.
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id(), peer = %remote))]
    pub async fn create_offer_to(&self, remote: &UserId) {
        if remote == self.local_user() {
            tracing::warn!("Refusing to offer to self");
            return;
        }
        if self.is_closed() {
            return;
        }

        let mut registry = self.inner.registry.lock().await;
        if let Some(state) = registry.state(remote) {
            if !state.is_terminal() {
                tracing::debug!(state = %state, "Link already exists, not offering");
                return;
            }
            self.discard_link(&mut registry, remote).await;
        }

        let Some((handle, link_id)) = self.open_link(remote).await else {
            return;
        };
        registry.insert(
            remote.clone(),
            LinkEntry::new(handle.clone(), link_id, LinkRole::Offerer),
        );

        let offer = match handle.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail_link(&mut registry, remote, &e.to_string()).await;
                return;
            }
        };
        if let Err(e) = self
            .inner
            .signaling
            .send_signal(&self.call_id(), Some(remote), &Signal::PeerOffer(offer))
            .await
        {
            self.fail_link(&mut registry, remote, &e.to_string()).await;
            return;
        }
        self.transition(&mut registry, remote, LinkState::OfferSent);
        self.flush_local_candidates(&mut registry, remote).await;
    }

    /// Answer a remote offer
    ///
    /// When both sides offered at once, the side with the larger user id
    /// keeps its offer and the other side discards its own link and answers.
    /// An offer for a link that is past negotiation replaces that link.
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id(), peer = %from))]
    pub async fn handle_offer(&self, from: &UserId, offer: SessionDescription) {
        if offer.kind != SdpKind::Offer {
            tracing::warn!(kind = ?offer.kind, "PEER_OFFER without an offer description");
            return;
        }
        if from == self.local_user() || self.is_closed() {
            return;
        }

        let mut registry = self.inner.registry.lock().await;
        if let Some(entry) = registry.get_mut(from) {
            let state = entry.state;
            if entry.role == LinkRole::Offerer && state.is_glare_candidate() {
                if self.local_user().wins_glare_against(from) {
                    entry.glare_won = true;
                    entry.pending_remote_candidates.clear();
                    tracing::info!(state = %state, "Glare: keeping local offer");
                    return;
                }
                tracing::info!(state = %state, "Glare: yielding to remote offer");
            } else if !state.is_terminal() {
                tracing::info!(state = %state, "Remote offer replaces existing link");
            }
            self.discard_link(&mut registry, from).await;
        }

        let Some((handle, link_id)) = self.open_link(from).await else {
            return;
        };
        registry.insert(
            from.clone(),
            LinkEntry::new(handle.clone(), link_id, LinkRole::Answerer),
        );

        if let Err(e) = handle.set_remote_description(offer).await {
            self.fail_link(&mut registry, from, &e.to_string()).await;
            return;
        }
        self.transition(&mut registry, from, LinkState::OfferReceived);
        self.apply_pending_remote_candidates(&mut registry, from).await;

        let answer = match handle.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_link(&mut registry, from, &e.to_string()).await;
                return;
            }
        };
        if let Err(e) = self
            .inner
            .signaling
            .send_signal(&self.call_id(), Some(from), &Signal::PeerAnswer(answer))
            .await
        {
            self.fail_link(&mut registry, from, &e.to_string()).await;
            return;
        }
        self.transition(&mut registry, from, LinkState::AnswerSent);
        self.flush_local_candidates(&mut registry, from).await;
    }

    /// Apply a remote answer to the link waiting for it
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id(), peer = %from))]
    pub async fn handle_answer(&self, from: &UserId, answer: SessionDescription) {
        if answer.kind != SdpKind::Answer {
            tracing::warn!(kind = ?answer.kind, "PEER_ANSWER without an answer description");
            return;
        }

        let mut registry = self.inner.registry.lock().await;
        let Some(entry) = registry.get(from) else {
            tracing::warn!("Answer for unknown link, ignoring");
            return;
        };
        if entry.state != LinkState::OfferSent {
            tracing::warn!(state = %entry.state, "Unexpected answer, ignoring");
            return;
        }
        let handle = entry.handle.clone();

        if let Err(e) = handle.set_remote_description(answer).await {
            self.fail_link(&mut registry, from, &e.to_string()).await;
            return;
        }
        self.transition(&mut registry, from, LinkState::AnswerReceived);
        self.apply_pending_remote_candidates(&mut registry, from).await;
    }

    /// Apply a remote connectivity candidate
    ///
    /// Candidates for unknown or finished links are dropped; candidates that
    /// arrive before the remote description are held until it is applied.
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id(), peer = %from))]
    pub async fn handle_ice_candidate(&self, from: &UserId, candidate: IceCandidate) {
        let mut registry = self.inner.registry.lock().await;
        let Some(entry) = registry.get_mut(from) else {
            tracing::warn!("ICE candidate for unknown link, dropping");
            return;
        };
        if entry.state.is_terminal() {
            tracing::debug!(state = %entry.state, "ICE candidate for finished link, dropping");
            return;
        }
        if !entry.remote_description_set {
            if entry.glare_won {
                tracing::debug!("ICE candidate for the remote's abandoned offer, dropping");
                return;
            }
            entry.pending_remote_candidates.push(candidate);
            tracing::debug!(
                pending = entry.pending_remote_candidates.len(),
                "Holding remote candidate until the remote description is applied"
            );
            return;
        }
        let handle = entry.handle.clone();
        if let Err(e) = handle.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply ICE candidate");
        }
    }

    /// Process a notification raised by a link backend
    pub async fn handle_link_event(&self, notification: LinkNotification) {
        let LinkNotification {
            remote,
            link_id,
            event,
        } = notification;
        let mut registry = self.inner.registry.lock().await;
        let Some(entry) = registry.get_mut(&remote) else {
            tracing::trace!(peer = %remote, "Event for discarded link");
            return;
        };
        if entry.link_id != link_id {
            tracing::trace!(peer = %remote, link_id, "Event from replaced link");
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if entry.state.is_terminal() {
                    return;
                }
                if !entry.local_description_sent {
                    entry.pending_local_candidates.push(candidate);
                    return;
                }
                self.send_candidate(&remote, candidate).await;
            }
            LinkEvent::TransportStateChanged(state) => {
                self.on_transport_state(&mut registry, &remote, state).await;
            }
            LinkEvent::RemoteTrack { stream_id, track } => {
                if entry.state.is_terminal() {
                    return;
                }
                let stream = entry
                    .remote_stream
                    .get_or_insert_with(|| MediaStream::new(stream_id));
                stream.add_track(track);
                let stream = stream.clone();
                tracing::debug!(peer = %remote, tracks = stream.len(), "Remote track added");
                self.emit(MeshEvent::RemoteStreamAdded {
                    user_id: remote,
                    stream,
                });
            }
        }
    }

    async fn on_transport_state(
        &self,
        registry: &mut LinkRegistry,
        user: &UserId,
        transport: TransportState,
    ) {
        let Some(state) = registry.state(user) else {
            return;
        };
        match transport {
            TransportState::Connected => {
                if state == LinkState::Connected {
                    tracing::info!(peer = %user, "Transport recovered");
                    return;
                }
                if !self.transition(registry, user, LinkState::Connected) {
                    return;
                }
                if let Some(entry) = registry.get(user) {
                    tracing::info!(
                        peer = %user,
                        role = ?entry.role,
                        elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                        "Peer connected"
                    );
                    self.inner
                        .monitor
                        .start_monitoring(user.clone(), entry.handle.clone());
                }
                self.emit(MeshEvent::PeerConnected {
                    user_id: user.clone(),
                });
            }
            TransportState::Failed => {
                self.fail_link(registry, user, "transport failed").await;
            }
            TransportState::Closed => {
                if !state.is_terminal() {
                    self.transition(registry, user, LinkState::Closed);
                    self.inner.monitor.stop_monitoring(user);
                    if let Some(entry) = registry.get_mut(user) {
                        entry.remote_stream = None;
                    }
                }
            }
            TransportState::Disconnected => {
                tracing::info!(peer = %user, state = %state, "Transport disconnected, waiting for recovery");
            }
            TransportState::New | TransportState::Connecting => {
                tracing::debug!(peer = %user, transport = ?transport, "Transport progress");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Link helpers
    // ---------------------------------------------------------------------

    /// Tracks a new link should send: the local stream with the screen in
    /// place of the camera while sharing
    fn outbound_tracks(&self) -> Vec<MediaTrack> {
        let screen_video = self.inner.swapper.current_video_track();
        let screen_audio = self.inner.swapper.current_audio_track();
        let mut tracks: Vec<MediaTrack> = self
            .inner
            .local_stream
            .lock()
            .as_ref()
            .map(|s| s.tracks().to_vec())
            .unwrap_or_default();

        for track in &mut tracks {
            let replacement = match track.kind() {
                TrackKind::Video => screen_video.as_ref(),
                TrackKind::Audio => screen_audio.as_ref(),
            };
            if let Some(replacement) = replacement {
                *track = replacement.clone();
            }
        }
        if let Some(video) = screen_video {
            if !tracks.iter().any(MediaTrack::is_video) {
                tracks.push(video);
            }
        }
        tracks
    }

    async fn open_link(&self, remote: &UserId) -> Option<(LinkHandle, u64)> {
        let link_id = self.inner.next_link_id.fetch_add(1, Ordering::Relaxed);
        let sink = LinkEventSink::new(remote.clone(), link_id, self.inner.link_sender.clone());
        let outbound = self.outbound_tracks();
        match self
            .inner
            .link_factory
            .create_link(remote, &outbound, sink)
            .await
        {
            Ok(handle) => Some((handle, link_id)),
            Err(e) => {
                tracing::warn!(peer = %remote, error = %e, "Failed to create link");
                self.emit(MeshEvent::LinkFailed {
                    user_id: remote.clone(),
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    fn transition(&self, registry: &mut LinkRegistry, user: &UserId, to: LinkState) -> bool {
        match registry.transition(user, to) {
            Ok(from) => {
                tracing::debug!(peer = %user, old_state = ?from, new_state = ?to, "Link state changed");
                self.emit(MeshEvent::LinkStateChanged {
                    user_id: user.clone(),
                    from,
                    to,
                });
                true
            }
            Err(TransitionError::Invalid { from, to }) => {
                tracing::warn!(peer = %user, old_state = ?from, new_state = ?to, "Invalid link transition ignored");
                false
            }
            Err(TransitionError::UnknownLink) => false,
        }
    }

    async fn fail_link(&self, registry: &mut LinkRegistry, user: &UserId, reason: &str) {
        let Some(state) = registry.state(user) else {
            return;
        };
        if state.is_terminal() {
            return;
        }
        tracing::warn!(peer = %user, state = %state, reason, "Link failed");
        self.transition(registry, user, LinkState::Failed);
        self.inner.monitor.stop_monitoring(user);

        let handle = registry.get_mut(user).map(|entry| {
            entry.remote_stream = None;
            entry.pending_local_candidates.clear();
            entry.pending_remote_candidates.clear();
            entry.handle.clone()
        });
        self.emit(MeshEvent::LinkFailed {
            user_id: user.clone(),
            reason: reason.to_string(),
        });
        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                tracing::debug!(peer = %user, error = %e, "Error closing failed link");
            }
        }
    }

    /// Close and forget the link to `user`; returns whether one existed
    async fn discard_link(&self, registry: &mut LinkRegistry, user: &UserId) -> bool {
        let Some(entry) = registry.remove(user) else {
            return false;
        };
        self.inner.monitor.stop_monitoring(user);
        if !entry.state.is_terminal() {
            self.emit(MeshEvent::LinkStateChanged {
                user_id: user.clone(),
                from: entry.state,
                to: LinkState::Closed,
            });
        }
        if let Err(e) = entry.handle.close().await {
            tracing::warn!(peer = %user, error = %e, "Error closing link");
        }
        true
    }

    async fn flush_local_candidates(&self, registry: &mut LinkRegistry, user: &UserId) {
        let pending = match registry.get_mut(user) {
            Some(entry) => {
                entry.local_description_sent = true;
                std::mem::take(&mut entry.pending_local_candidates)
            }
            None => return,
        };
        if !pending.is_empty() {
            tracing::debug!(peer = %user, count = pending.len(), "Flushing held local candidates");
        }
        for candidate in pending {
            self.send_candidate(user, candidate).await;
        }
    }

    async fn apply_pending_remote_candidates(&self, registry: &mut LinkRegistry, user: &UserId) {
        let (handle, pending) = match registry.get_mut(user) {
            Some(entry) => {
                entry.remote_description_set = true;
                (
                    entry.handle.clone(),
                    std::mem::take(&mut entry.pending_remote_candidates),
                )
            }
            None => return,
        };
        for candidate in pending {
            if let Err(e) = handle.add_ice_candidate(candidate).await {
                tracing::warn!(peer = %user, error = %e, "Failed to apply held ICE candidate");
            }
        }
    }

    async fn send_candidate(&self, user: &UserId, candidate: IceCandidate) {
        if let Err(e) = self
            .inner
            .signaling
            .send_signal(&self.call_id(), Some(user), &Signal::IceCandidate(candidate))
            .await
        {
            tracing::warn!(peer = %user, error = %e, "Failed to send ICE candidate");
        }
    }

    /// Close and discard the link to `user` and drop them from the session
    ///
    /// Removing an unknown or already removed user is a no-op.
    #[tracing::instrument(skip_all, fields(call_id = %self.call_id(), peer = %user))]
    pub async fn remove_peer(&self, user: &UserId) {
        let removed_link = {
            let mut registry = self.inner.registry.lock().await;
            self.discard_link(&mut registry, user).await
        };
        let removed_participant = self.inner.session.write().remove_participant(user);
        if removed_link || removed_participant.is_some() {
            tracing::info!("Peer removed");
            self.emit(MeshEvent::PeerRemoved {
                user_id: user.clone(),
            });
        }
    }

    // ---------------------------------------------------------------------
    // Screen share
    // ---------------------------------------------------------------------

    /// Send the screen instead of the camera on every link
    ///
    /// When the platform ends the screen track the camera is restored
    /// automatically.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Swap`] if already sharing or display capture
    /// fails, [`MeshError::Closed`] after cleanup
    pub async fn start_screen_share(&self) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        // The picker may stay open indefinitely; signaling keeps flowing meanwhile
        let pending = self.inner.swapper.acquire().await?;

        let camera = self
            .inner
            .local_stream
            .lock()
            .as_ref()
            .and_then(|s| s.first_video().cloned());
        // Links opened from here on pick the screen up in `outbound_tracks`
        let registry = self.inner.registry.lock().await;
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        let links = registry.live_handles();
        let screen = self
            .inner
            .swapper
            .apply(pending, &links, camera.as_ref())
            .await;
        drop(registry);

        self.spawn_share_watcher(screen);
        self.emit(MeshEvent::ScreenShareStarted);
        Ok(())
    }

    fn spawn_share_watcher(&self, screen: MediaTrack) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            screen.ended().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mesh = PeerConnectionMesh { inner };
            // Detach before stopping so the stop does not cancel this task
            mesh.inner.tasks.lock().share_watcher.take();
            tracing::info!("Screen track ended by the platform, restoring camera");
            mesh.stop_screen_share().await;
        });
        if let Some(previous) = self.inner.tasks.lock().share_watcher.replace(handle) {
            previous.abort();
        }
    }

    /// Restore the camera on every link; returns `false` when not sharing
    pub async fn stop_screen_share(&self) -> bool {
        if let Some(watcher) = self.inner.tasks.lock().share_watcher.take() {
            watcher.abort();
        }
        let registry = self.inner.registry.lock().await;
        let links = registry.live_handles();
        let stopped = self.inner.swapper.stop(&links).await;
        drop(registry);

        if stopped {
            self.emit(MeshEvent::ScreenShareStopped);
        }
        stopped
    }

    // ---------------------------------------------------------------------
    // Recording
    // ---------------------------------------------------------------------

    /// Record the local stream and every remote stream
    ///
    /// Returns the selected format.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Recording`] if a recording is running or the
    /// encoder cannot start, [`MeshError::Closed`] after cleanup
    pub async fn start_recording(
        &self,
        config: Option<RecordingConfig>,
    ) -> Result<String, MeshError> {
        if self.is_closed() {
            return Err(MeshError::Closed);
        }
        let mut streams: Vec<MediaStream> = self.local_stream().into_iter().collect();
        streams.extend(self.remote_streams().await.into_iter().map(|(_, s)| s));

        let mime_type = self.inner.recorder.start(&streams, config.as_ref())?;
        self.emit(MeshEvent::RecordingStarted {
            mime_type: mime_type.clone(),
        });
        Ok(mime_type)
    }

    /// Finalize the running recording
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Recording`] if nothing is recording or the
    /// encoder fails to finalize
    pub async fn stop_recording(&self) -> Result<RecordingArtifact, MeshError> {
        let artifact = self.inner.recorder.stop().await?;
        self.emit(MeshEvent::RecordingStopped {
            size_bytes: artifact.size(),
            chunk_count: artifact.chunk_count,
        });
        Ok(artifact)
    }

    /// Pause the running recording
    pub fn pause_recording(&self) {
        self.inner.recorder.pause();
    }

    /// Resume a paused recording
    pub fn resume_recording(&self) {
        self.inner.recorder.resume();
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine
        let _ = self.inner.event_sender.send(event);
    }
}

impl<T: SignalingTransport> std::fmt::Debug for PeerConnectionMesh<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionMesh")
            .field("local", &self.inner.local.user_id)
            .field("call_id", &self.call_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
