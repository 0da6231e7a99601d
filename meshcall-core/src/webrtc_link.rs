//! Peer links backed by the webrtc crate
//!
//! Outbound [`MediaTrack`]s must carry a [`NativeTrack`] handle (see
//! [`MediaTrack::with_native`]); remote tracks are surfaced with their
//! `TrackRemote` attached the same way.

use crate::config::IceServerConfig;
use crate::identity::UserId;
use crate::link::{
    LinkError, LinkEvent, LinkEventSink, LinkFactory, LinkHandle, LinkStats, PeerLink,
    TransportState,
};
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

/// Native outbound track handle attached to a [`MediaTrack`]
pub type NativeTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Convert configured ICE servers
pub fn ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

/// Creates [`WebRtcLink`]s sharing one media engine
pub struct WebRtcLinkFactory {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcLinkFactory {
    /// Build a factory with the default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Create`] if the media engine cannot be set up
    pub fn new(ice: &[IceServerConfig]) -> Result<Self, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| LinkError::Create(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| LinkError::Create(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };
        Ok(Self { api, config })
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    #[tracing::instrument(skip(self, outbound, events), fields(peer = %remote, tracks = outbound.len()))]
    async fn create_link(
        &self,
        remote: &UserId,
        outbound: &[MediaTrack],
        events: LinkEventSink,
    ) -> Result<LinkHandle, LinkError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(|e| LinkError::Create(e.to_string()))?,
        );

        let mut senders = HashMap::new();
        for track in outbound {
            let Some(native) = track.native::<NativeTrack>() else {
                tracing::debug!(track = track.id(), "Track has no native handle, not sending it");
                continue;
            };
            let sender = pc
                .add_track(Arc::clone(native))
                .await
                .map_err(|e| LinkError::Create(e.to_string()))?;
            senders.insert(track.kind(), (sender, track.clone()));
        }

        install_handlers(&pc, events);

        Ok(Arc::new(WebRtcLink {
            remote: remote.clone(),
            pc,
            senders: tokio::sync::Mutex::new(senders),
            closed: AtomicBool::new(false),
        }))
    }
}

fn install_handlers(pc: &RTCPeerConnection, events: LinkEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
            }
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!(peer = %sink.remote(), state = %state, "Peer connection state");
        if let Some(state) = transport_state(state) {
            sink.emit(LinkEvent::TransportStateChanged(state));
        }
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        match track_kind(track.kind()) {
            Some(kind) => {
                let stream_id = track.stream_id();
                let media = MediaTrack::with_id(track.id(), kind, format!("remote-{kind:?}"))
                    .with_native(Arc::clone(&track));
                events.emit(LinkEvent::RemoteTrack {
                    stream_id,
                    track: media,
                });
            }
            None => tracing::debug!(peer = %events.remote(), "Ignoring remote track of unknown kind"),
        }
        Box::pin(async {})
    }));
}

/// Peer link over an `RTCPeerConnection`
pub struct WebRtcLink {
    remote: UserId,
    pc: Arc<RTCPeerConnection>,
    senders: tokio::sync::Mutex<HashMap<TrackKind, (Arc<RTCRtpSender>, MediaTrack)>>,
    closed: AtomicBool,
}

impl WebRtcLink {
    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        Ok(())
    }

    /// Underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn remote_user(&self) -> &UserId {
        &self.remote
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| LinkError::Offer(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| LinkError::Description(e.to_string()))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| LinkError::Answer(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| LinkError::Description(e.to_string()))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        self.ensure_open()?;
        let native = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| LinkError::Description(e.to_string()))?;
        self.pc
            .set_remote_description(native)
            .await
            .map_err(|e| LinkError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| LinkError::Candidate(e.to_string()))
    }

    async fn replace_outbound_track(
        &self,
        track: &MediaTrack,
    ) -> Result<Option<MediaTrack>, LinkError> {
        let replace_error = |reason: String| LinkError::ReplaceTrack {
            kind: track.kind(),
            reason,
        };
        let native = track
            .native::<NativeTrack>()
            .ok_or_else(|| replace_error("track has no native handle".to_string()))?;

        let mut senders = self.senders.lock().await;
        let Some((sender, current)) = senders.get_mut(&track.kind()) else {
            return Err(replace_error(
                "no sender of this kind; adding one needs renegotiation".to_string(),
            ));
        };
        sender
            .replace_track(Some(Arc::clone(native)))
            .await
            .map_err(|e| replace_error(e.to_string()))?;
        Ok(Some(std::mem::replace(current, track.clone())))
    }

    async fn outbound_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.senders
            .lock()
            .await
            .get(&kind)
            .map(|(_, track)| track.clone())
    }

    async fn stats(&self) -> Result<LinkStats, LinkError> {
        self.ensure_open()?;
        let report = self.pc.get_stats().await;
        Ok(inbound_video_stats(report.reports.values()))
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc
            .close()
            .await
            .map_err(|e| LinkError::Create(format!("close failed: {e}")))
    }
}

/// Fold a stats report into inbound video counters
///
/// The native stack does not report `packetsLost` or jitter on inbound RTP
/// streams, so both stay zero. Loss from `remote-inbound-rtp` describes our
/// outbound stream and is not mixed in.
fn inbound_video_stats<'a>(reports: impl IntoIterator<Item = &'a StatsReportType>) -> LinkStats {
    let mut stats = LinkStats::default();
    for entry in reports {
        match entry {
            StatsReportType::InboundRTP(inbound) if inbound.kind == "video" => {
                stats.packets_received += inbound.packets_received;
                stats.bytes_received += inbound.bytes_received;
            }
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                stats.round_trip_time_ms = Some(pair.current_round_trip_time * 1000.0);
            }
            _ => {}
        }
    }
    stats
}
