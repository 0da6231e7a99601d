//! Call, link and quality types

use crate::identity::{Participant, UserId};
use crate::media::MediaStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the group a call belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallStatus {
    /// Call is running
    Active,
    /// Call has been ended for everyone
    Ended,
}

/// Call session as reported by the call directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    /// Call identifier
    pub call_id: CallId,
    /// Owning group
    pub group_id: GroupId,
    /// Who started the call
    pub initiator_id: UserId,
    /// Participants in join order, unique by user id
    pub participants: Vec<Participant>,
    /// Current status
    pub status: CallStatus,
    /// Creation timestamp
    pub started_at: DateTime<Utc>,
    /// End timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Create a new active session with the initiator as sole participant
    pub fn new(call_id: CallId, group_id: GroupId, initiator: Participant) -> Self {
        Self {
            call_id,
            group_id,
            initiator_id: initiator.user_id.clone(),
            participants: vec![initiator],
            status: CallStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Add a participant; returns false if the user is already present
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if self.contains(&participant.user_id) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    /// Remove a participant; returns the removed entry
    pub fn remove_participant(&mut self, user_id: &UserId) -> Option<Participant> {
        let idx = self
            .participants
            .iter()
            .position(|p| &p.user_id == user_id)?;
        Some(self.participants.remove(idx))
    }

    /// Whether the user is part of this session
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.participants.iter().any(|p| &p.user_id == user_id)
    }

    /// Participants other than `local`
    pub fn remote_participants<'a>(
        &'a self,
        local: &'a UserId,
    ) -> impl Iterator<Item = &'a Participant> + 'a {
        self.participants.iter().filter(move |p| &p.user_id != local)
    }

    /// Mark the session as ended
    pub fn end(&mut self) {
        if self.status == CallStatus::Active {
            self.status = CallStatus::Ended;
            self.ended_at = Some(Utc::now());
        }
    }

    /// Whether the call is still running
    pub fn is_active(&self) -> bool {
        self.status == CallStatus::Active
    }

    /// Call duration so far, or total duration once ended
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// Which side started negotiation on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkRole {
    /// Local side sent the offer
    Offerer,
    /// Local side answered a remote offer
    Answerer,
}

/// Negotiation state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    /// Created, nothing exchanged yet
    New,
    /// Local offer published
    OfferSent,
    /// Remote offer applied
    OfferReceived,
    /// Local answer published
    AnswerSent,
    /// Remote answer applied
    AnswerReceived,
    /// Transport reports the link as connected
    Connected,
    /// Transport reported a failure
    Failed,
    /// Closed locally or by the remote leaving
    Closed,
}

impl LinkState {
    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// States in which a simultaneous remote offer counts as glare
    pub fn is_glare_candidate(self) -> bool {
        matches!(self, Self::New | Self::OfferSent)
    }

    /// Whether a negotiation step from `self` to `to` is allowed
    pub fn can_transition_to(self, to: LinkState) -> bool {
        use LinkState::*;
        match (self, to) {
            (from, Closed) => from != Closed,
            (from, Failed) => !from.is_terminal(),
            (New, OfferSent) | (New, OfferReceived) => true,
            (OfferSent, AnswerReceived) => true,
            (OfferReceived, AnswerSent) => true,
            (AnswerReceived, Connected) | (AnswerSent, Connected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::OfferSent => "OFFER_SENT",
            Self::OfferReceived => "OFFER_RECEIVED",
            Self::AnswerSent => "ANSWER_SENT",
            Self::AnswerReceived => "ANSWER_RECEIVED",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Link health class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    /// Half or more of the packets are lost
    Disconnected,
    /// Heavy loss or latency
    Poor,
    /// Noticeable degradation
    Fair,
    /// Minor degradation
    Good,
    /// No measurable degradation
    Excellent,
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        };
        f.write_str(s)
    }
}

/// One quality sample for one remote user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSample {
    /// Remote user the link belongs to
    pub user_id: UserId,
    /// Derived quality class
    pub quality: NetworkQuality,
    /// Cumulative inbound video packets lost
    pub packets_lost: u64,
    /// Cumulative inbound video packets received
    pub packets_received: u64,
    /// lost / (lost + received)
    pub packet_loss_rate: f64,
    /// Inbound video jitter in milliseconds
    pub jitter: f64,
    /// Inbound bandwidth over the last interval, kbit/s
    pub bandwidth_estimate: f64,
    /// Round-trip time of the succeeded candidate pair
    pub round_trip_time_ms: f64,
    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

/// Events emitted by the mesh for the presentation layer
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A participant joined the session
    PeerJoined {
        /// The new participant
        participant: Participant,
    },
    /// A link changed negotiation state
    LinkStateChanged {
        /// Remote user
        user_id: UserId,
        /// Previous state
        from: LinkState,
        /// New state
        to: LinkState,
    },
    /// A link reached CONNECTED
    PeerConnected {
        /// Remote user
        user_id: UserId,
    },
    /// A link failed; it is not retried automatically
    LinkFailed {
        /// Remote user
        user_id: UserId,
        /// Failure description
        reason: String,
    },
    /// Remote media arrived on a link
    RemoteStreamAdded {
        /// Remote user
        user_id: UserId,
        /// The remote stream as known so far
        stream: MediaStream,
    },
    /// A participant's link was closed and discarded
    PeerRemoved {
        /// Remote user
        user_id: UserId,
    },
    /// New quality sample for a link
    QualitySampled(NetworkSample),
    /// Outbound video switched to the screen
    ScreenShareStarted,
    /// Outbound video switched back to the camera
    ScreenShareStopped,
    /// Recording began
    RecordingStarted {
        /// Selected container/codec
        mime_type: String,
    },
    /// Recording finalized
    RecordingStopped {
        /// Artifact size in bytes
        size_bytes: usize,
        /// Number of buffered chunks
        chunk_count: usize,
    },
    /// Call setup aborted (termination hook)
    SetupFailed {
        /// Human-readable cause
        reason: String,
    },
    /// Call ended for everyone
    CallEnded {
        /// Call identifier
        call_id: CallId,
    },
}
