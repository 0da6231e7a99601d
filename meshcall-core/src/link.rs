//! Native peer connection seam
//!
//! A [`PeerLink`] wraps one real-time transport connection to one remote
//! participant. The mesh drives it through offer/answer/candidate calls and
//! receives transport-originated notifications as [`LinkEvent`]s through a
//! [`LinkEventSink`], so every state change flows through the mesh router.

use crate::identity::UserId;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Per-link negotiation and transport errors
///
/// These never abort the call; the mesh isolates them to the affected link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The native connection could not be created
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// Offer construction failed
    #[error("Failed to create offer: {0}")]
    Offer(String),

    /// Answer construction failed
    #[error("Failed to create answer: {0}")]
    Answer(String),

    /// A local or remote description was rejected
    #[error("Failed to apply session description: {0}")]
    Description(String),

    /// A remote candidate was rejected
    #[error("Failed to add ICE candidate: {0}")]
    Candidate(String),

    /// Outbound track replacement failed
    #[error("Failed to replace {kind:?} track: {reason}")]
    ReplaceTrack {
        /// Track kind being replaced
        kind: TrackKind,
        /// Backend error
        reason: String,
    },

    /// Statistics could not be read
    #[error("Failed to read stats: {0}")]
    Stats(String),

    /// The link has been closed
    #[error("Link closed")]
    Closed,
}

/// Transport-level connection state reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Not started
    New,
    /// Connectivity checks running
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost; may recover on its own
    Disconnected,
    /// Gave up
    Failed,
    /// Closed
    Closed,
}

/// Notifications raised by a link backend
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A local connectivity candidate was gathered
    LocalCandidate(IceCandidate),
    /// The transport changed connection state
    TransportStateChanged(TransportState),
    /// The remote side started sending a track
    RemoteTrack {
        /// Remote stream the track belongs to
        stream_id: String,
        /// The inbound track
        track: MediaTrack,
    },
}

/// A link event tagged with the link that raised it
#[derive(Debug, Clone)]
pub struct LinkNotification {
    /// Remote user of the link
    pub remote: UserId,
    /// Identity of the link instance; a replaced link keeps the user but not the id
    pub link_id: u64,
    /// What happened
    pub event: LinkEvent,
}

/// Sender half handed to a link backend
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    remote: UserId,
    link_id: u64,
    tx: mpsc::UnboundedSender<LinkNotification>,
}

impl LinkEventSink {
    /// Create a sink for one link instance
    #[must_use]
    pub fn new(remote: UserId, link_id: u64, tx: mpsc::UnboundedSender<LinkNotification>) -> Self {
        Self {
            remote,
            link_id,
            tx,
        }
    }

    /// Remote user this sink reports for
    #[must_use]
    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    /// Link instance this sink reports for
    #[must_use]
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Forward an event to the mesh; dropped silently once the mesh is gone
    pub fn emit(&self, event: LinkEvent) {
        let notification = LinkNotification {
            remote: self.remote.clone(),
            link_id: self.link_id,
            event,
        };
        if self.tx.send(notification).is_err() {
            tracing::trace!(peer = %self.remote, "Link event dropped, mesh router gone");
        }
    }
}

/// Transport counters read for quality sampling
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStats {
    /// Inbound video packets lost (cumulative)
    pub packets_lost: u64,
    /// Inbound video packets received (cumulative)
    pub packets_received: u64,
    /// Inbound video jitter in milliseconds
    pub jitter_ms: f64,
    /// Inbound video bytes received (cumulative)
    pub bytes_received: u64,
    /// Current RTT of the succeeded candidate pair
    pub round_trip_time_ms: Option<f64>,
}

/// One negotiated transport connection to one remote participant
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Remote participant
    fn remote_user(&self) -> &UserId;

    /// Create an offer and install it as the local description
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Offer`] or [`LinkError::Description`]
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Create an answer to the applied remote offer and install it locally
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Answer`] or [`LinkError::Description`]
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    /// Apply the remote offer or answer
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Description`] if the description is rejected
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), LinkError>;

    /// Apply a remote connectivity candidate
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Candidate`] if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Swap the outbound track of the same kind without renegotiating
    ///
    /// Returns the track that was being sent before, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ReplaceTrack`] if the backend refuses the swap
    async fn replace_outbound_track(
        &self,
        track: &MediaTrack,
    ) -> Result<Option<MediaTrack>, LinkError>;

    /// Currently sent track of a kind
    async fn outbound_track(&self, kind: TrackKind) -> Option<MediaTrack>;

    /// Read transport counters
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Stats`] if the backend cannot report
    async fn stats(&self) -> Result<LinkStats, LinkError>;

    /// Close the native connection; closing twice is a no-op
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails while closing
    async fn close(&self) -> Result<(), LinkError>;
}

/// Shared handle to a link
///
/// Components other than the mesh only ever hold these transiently.
pub type LinkHandle = Arc<dyn PeerLink>;

/// Creates native links
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Create a link to `remote` that sends `outbound` tracks and reports
    /// through `events`
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Create`] if the native connection cannot be built
    async fn create_link(
        &self,
        remote: &UserId,
        outbound: &[MediaTrack],
        events: LinkEventSink,
    ) -> Result<LinkHandle, LinkError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_tags_events_with_remote_user() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = LinkEventSink::new(UserId::new("bob"), 7, tx);
        sink.emit(LinkEvent::TransportStateChanged(TransportState::Connected));

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.remote, UserId::new("bob"));
        assert_eq!(notification.link_id, 7);
        assert!(matches!(
            notification.event,
            LinkEvent::TransportStateChanged(TransportState::Connected)
        ));
    }

    #[test]
    fn test_sink_emit_after_router_gone_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = LinkEventSink::new(UserId::new("bob"), 1, tx);
        sink.emit(LinkEvent::TransportStateChanged(TransportState::Closed));
    }

    #[test]
    fn test_link_error_messages() {
        let err = LinkError::ReplaceTrack {
            kind: TrackKind::Video,
            reason: "no sender".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to replace Video track: no sender");
    }
}
