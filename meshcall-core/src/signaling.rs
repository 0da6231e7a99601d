//! Call signaling protocol
//!
//! Envelopes travel over an external publish/subscribe transport. Each
//! session listens on two topics: a per-user queue carrying offers, answers
//! and ICE candidates addressed to the local user, and a per-group topic
//! carrying join/leave/end broadcasts. Outbound envelopes all go to one
//! well-known destination; the transport routes them by `toUserId`.

use crate::identity::{Participant, UserId};
use crate::types::{CallId, GroupId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Destination every outbound envelope is published to
pub const OUTBOUND_DESTINATION: &str = "/app/call.signal";

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Transport not connected or publish failed
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The `data` field does not match the envelope type
    #[error("Invalid {signal_type} payload: {reason}")]
    InvalidPayload {
        /// Envelope type
        signal_type: SignalType,
        /// What was wrong
        reason: String,
    },

    /// Envelope could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    /// A call was started in the group (consumed outside the engine)
    CallInitiated,
    /// A participant joined
    UserJoined,
    /// A participant left
    UserLeft,
    /// The call was ended for everyone
    CallEnded,
    /// SDP offer
    PeerOffer,
    /// SDP answer
    PeerAnswer,
    /// Connectivity candidate
    IceCandidate,
}

impl SignalType {
    /// Types the engine accepts from the group topic
    #[must_use]
    pub fn is_group_broadcast(self) -> bool {
        matches!(self, Self::UserJoined | Self::UserLeft | Self::CallEnded)
    }

    /// Types the engine accepts from the per-user topic
    #[must_use]
    pub fn is_peer_unicast(self) -> bool {
        matches!(self, Self::PeerOffer | Self::PeerAnswer | Self::IceCandidate)
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CallInitiated => "CALL_INITIATED",
            Self::UserJoined => "USER_JOINED",
            Self::UserLeft => "USER_LEFT",
            Self::CallEnded => "CALL_ENDED",
            Self::PeerOffer => "PEER_OFFER",
            Self::PeerAnswer => "PEER_ANSWER",
            Self::IceCandidate => "ICE_CANDIDATE",
        };
        f.write_str(s)
    }
}

/// SDP type carried next to the SDP text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description payload of PEER_OFFER / PEER_ANSWER
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// SDP type
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate payload of ICE_CANDIDATE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Typed view of an envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A call was started in the group
    CallInitiated,
    /// A participant joined
    UserJoined(Participant),
    /// The sender left
    UserLeft,
    /// The call ended
    CallEnded,
    /// SDP offer from the sender
    PeerOffer(SessionDescription),
    /// SDP answer from the sender
    PeerAnswer(SessionDescription),
    /// ICE candidate from the sender
    IceCandidate(IceCandidate),
}

impl Signal {
    /// Envelope type tag for this signal
    #[must_use]
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::CallInitiated => SignalType::CallInitiated,
            Self::UserJoined(_) => SignalType::UserJoined,
            Self::UserLeft => SignalType::UserLeft,
            Self::CallEnded => SignalType::CallEnded,
            Self::PeerOffer(_) => SignalType::PeerOffer,
            Self::PeerAnswer(_) => SignalType::PeerAnswer,
            Self::IceCandidate(_) => SignalType::IceCandidate,
        }
    }
}

/// Signaling envelope as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Call this envelope belongs to
    pub call_id: CallId,
    /// Sender
    pub from_user_id: UserId,
    /// Recipient for unicast envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    /// Type tag
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    /// Type-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SignalEnvelope {
    /// Build an envelope from a typed signal
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized
    pub fn new(
        call_id: CallId,
        from: UserId,
        to: Option<UserId>,
        signal: &Signal,
    ) -> Result<Self, SignalingError> {
        let data = match signal {
            Signal::CallInitiated | Signal::UserLeft | Signal::CallEnded => None,
            Signal::UserJoined(p) => Some(serde_json::to_value(p)?),
            Signal::PeerOffer(d) | Signal::PeerAnswer(d) => Some(serde_json::to_value(d)?),
            Signal::IceCandidate(c) => Some(serde_json::to_value(c)?),
        };
        Ok(Self {
            call_id,
            from_user_id: from,
            to_user_id: to,
            signal_type: signal.signal_type(),
            data,
        })
    }

    /// Whether this envelope is addressed to one user
    #[must_use]
    pub fn is_unicast(&self) -> bool {
        self.to_user_id.is_some()
    }

    /// Decode the typed signal
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::InvalidPayload`] if `data` is missing or
    /// malformed for the envelope type
    pub fn signal(&self) -> Result<Signal, SignalingError> {
        Ok(match self.signal_type {
            SignalType::CallInitiated => Signal::CallInitiated,
            SignalType::UserLeft => Signal::UserLeft,
            SignalType::CallEnded => Signal::CallEnded,
            SignalType::UserJoined => Signal::UserJoined(self.payload()?),
            SignalType::PeerOffer => Signal::PeerOffer(self.payload()?),
            SignalType::PeerAnswer => Signal::PeerAnswer(self.payload()?),
            SignalType::IceCandidate => Signal::IceCandidate(self.payload()?),
        })
    }

    fn payload<P: serde::de::DeserializeOwned>(&self) -> Result<P, SignalingError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| SignalingError::InvalidPayload {
                signal_type: self.signal_type,
                reason: "missing data".to_string(),
            })?;
        serde_json::from_value(data).map_err(|e| SignalingError::InvalidPayload {
            signal_type: self.signal_type,
            reason: e.to_string(),
        })
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid envelope
    pub fn from_json(s: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Subscription topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Per-user unicast queue
    User(UserId),
    /// Per-group broadcast topic
    Group(GroupId),
}

impl Topic {
    /// Transport path of the topic
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::User(user) => format!("/user/{user}/queue/call"),
            Self::Group(group) => format!("/topic/group/{group}/call"),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Transport-assigned subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Publish/subscribe transport trait
///
/// Implement this for the messaging system in use (STOMP over websocket,
/// MQTT, an in-process bus, ...). Delivery is at most once and unordered
/// between different senders; reconnection is the transport's business.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether the transport can currently publish
    fn is_connected(&self) -> bool;

    /// Publish an envelope to a destination
    async fn publish(&self, destination: &str, envelope: &SignalEnvelope)
        -> Result<(), Self::Error>;

    /// Start receiving envelopes delivered to a topic
    async fn subscribe(
        &self,
        topic: &Topic,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SignalEnvelope>), Self::Error>;

    /// Stop a subscription; unknown ids are ignored
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Disposable subscription to one topic
///
/// Dropping the subscription disposes it.
pub struct Subscription {
    topic: Topic,
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<SignalEnvelope>,
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Topic this subscription listens on
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Transport handle
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next delivered envelope; `None` once the transport closed the topic
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.receiver.recv().await
    }

    /// Stop receiving
    pub fn dispose(mut self) {
        self.run_disposer();
    }

    fn run_disposer(&mut self) {
        if let Some(dispose) = self.disposer.take() {
            tracing::debug!(topic = %self.topic, "Disposing subscription");
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_disposer();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

/// Signaling channel bound to one local user in one group
pub struct SignalingChannel<T: SignalingTransport> {
    transport: Arc<T>,
    local_user: UserId,
    group_id: GroupId,
}

impl<T: SignalingTransport> SignalingChannel<T> {
    /// Create new signaling channel
    #[must_use]
    pub fn new(transport: Arc<T>, local_user: UserId, group_id: GroupId) -> Self {
        Self {
            transport,
            local_user,
            group_id,
        }
    }

    /// Local user this channel speaks for
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Group whose broadcasts this channel receives
    #[must_use]
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Send an envelope, fire-and-forget
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::TransportError`] if the transport is not
    /// connected or rejects the publish
    #[tracing::instrument(skip(self, envelope), fields(call_id = %envelope.call_id, signal_type = %envelope.signal_type, to = ?envelope.to_user_id))]
    pub async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if !self.transport.is_connected() {
            tracing::warn!("Signaling transport not connected, dropping envelope");
            return Err(SignalingError::TransportError(
                "transport not connected".to_string(),
            ));
        }
        tracing::debug!("Sending signaling envelope");
        self.transport
            .publish(OUTBOUND_DESTINATION, &envelope)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Encode and send a typed signal from the local user
    ///
    /// # Errors
    ///
    /// Returns error if encoding or sending fails
    pub async fn send_signal(
        &self,
        call_id: &CallId,
        to: Option<&UserId>,
        signal: &Signal,
    ) -> Result<(), SignalingError> {
        let envelope = SignalEnvelope::new(
            call_id.clone(),
            self.local_user.clone(),
            to.cloned(),
            signal,
        )?;
        self.send(envelope).await
    }

    /// Subscribe to a topic
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the subscription
    #[tracing::instrument(skip(self, topic), fields(topic = %topic))]
    pub async fn subscribe(&self, topic: Topic) -> Result<Subscription, SignalingError> {
        let (id, receiver) = self
            .transport
            .subscribe(&topic)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))?;
        let transport = Arc::clone(&self.transport);
        tracing::debug!(subscription = id.0, "Subscribed");
        Ok(Subscription {
            topic,
            id,
            receiver,
            disposer: Some(Box::new(move || transport.unsubscribe(id))),
        })
    }

    /// Subscribe to the local user's unicast queue
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the subscription
    pub async fn subscribe_user(&self) -> Result<Subscription, SignalingError> {
        self.subscribe(Topic::User(self.local_user.clone())).await
    }

    /// Subscribe to the group broadcast topic
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the subscription
    pub async fn subscribe_group(&self) -> Result<Subscription, SignalingError> {
        self.subscribe(Topic::Group(self.group_id.clone())).await
    }

    /// Whether a per-user delivery is meant for the engine
    #[must_use]
    pub fn accepts_unicast(&self, envelope: &SignalEnvelope) -> bool {
        envelope.signal_type.is_peer_unicast()
            && envelope.to_user_id.as_ref() == Some(&self.local_user)
            && envelope.from_user_id != self.local_user
    }

    /// Whether a group delivery is meant for the engine
    #[must_use]
    pub fn accepts_broadcast(&self, envelope: &SignalEnvelope) -> bool {
        envelope.signal_type.is_group_broadcast() && envelope.from_user_id != self.local_user
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    // Mock transport for testing
    struct MockTransport {
        connected: AtomicBool,
        published: Mutex<Vec<(String, SignalEnvelope)>>,
        unsubscribed: Mutex<Vec<SubscriptionId>>,
        next_id: AtomicU64,
    }

    #[derive(Debug)]
    struct MockError;

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Mock error")
        }
    }

    impl std::error::Error for MockError {}

    impl MockTransport {
        fn new() -> Self {
            Self {
                connected: AtomicBool::new(true),
                published: Mutex::new(Vec::new()),
                unsubscribed: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        type Error = MockError;

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn publish(
            &self,
            destination: &str,
            envelope: &SignalEnvelope,
        ) -> Result<(), MockError> {
            self.published
                .lock()
                .unwrap()
                .push((destination.to_string(), envelope.clone()));
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: &Topic,
        ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SignalEnvelope>), MockError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok((
                SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst)),
                rx,
            ))
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.unsubscribed.lock().unwrap().push(id);
        }
    }

    fn channel(transport: Arc<MockTransport>) -> SignalingChannel<MockTransport> {
        SignalingChannel::new(transport, UserId::new("alice"), GroupId::from("g1"))
    }

    #[tokio::test]
    async fn test_send_publishes_to_outbound_destination() {
        let transport = Arc::new(MockTransport::new());
        let ch = channel(transport.clone());

        ch.send_signal(
            &CallId::from("c1"),
            Some(&UserId::new("bob")),
            &Signal::PeerOffer(SessionDescription::offer("v=0")),
        )
        .await
        .unwrap();

        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, OUTBOUND_DESTINATION);
        assert_eq!(published[0].1.from_user_id, UserId::new("alice"));
        assert_eq!(published[0].1.to_user_id, Some(UserId::new("bob")));
        assert_eq!(published[0].1.signal_type, SignalType::PeerOffer);
    }

    #[tokio::test]
    async fn test_send_fails_when_disconnected() {
        let transport = Arc::new(MockTransport::new());
        transport.connected.store(false, Ordering::SeqCst);
        let ch = channel(transport.clone());

        let result = ch
            .send_signal(&CallId::from("c1"), None, &Signal::UserLeft)
            .await;
        assert!(matches!(result, Err(SignalingError::TransportError(_))));
        assert!(transport.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_dispose_unsubscribes_once() {
        let transport = Arc::new(MockTransport::new());
        let ch = channel(transport.clone());

        let sub = ch.subscribe_user().await.unwrap();
        assert_eq!(sub.topic(), &Topic::User(UserId::new("alice")));
        let id = sub.id();
        sub.dispose();

        let group = ch.subscribe_group().await.unwrap();
        drop(group);

        let unsubscribed = transport.unsubscribed.lock().unwrap();
        assert_eq!(unsubscribed.len(), 2);
        assert_eq!(unsubscribed[0], id);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = SignalEnvelope::new(
            CallId::from("c1"),
            UserId::new("alice"),
            Some(UserId::new("bob")),
            &Signal::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }),
        )
        .unwrap();

        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["callId"], "c1");
        assert_eq!(json["fromUserId"], "alice");
        assert_eq!(json["toUserId"], "bob");
        assert_eq!(json["type"], "ICE_CANDIDATE");
        assert_eq!(json["data"]["sdpMid"], "0");
        assert_eq!(json["data"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_broadcast_envelope_omits_recipient_and_data() {
        let env = SignalEnvelope::new(
            CallId::from("c1"),
            UserId::new("alice"),
            None,
            &Signal::UserLeft,
        )
        .unwrap();
        let json = env.to_json().unwrap();
        assert!(!json.contains("toUserId"));
        assert!(!json.contains("data"));
        assert!(!env.is_unicast());
    }

    #[test]
    fn test_decode_offer_from_json() {
        let text = r#"{"callId":"c9","fromUserId":"bob","toUserId":"alice","type":"PEER_OFFER","data":{"type":"offer","sdp":"v=0"}}"#;
        let env = SignalEnvelope::from_json(text).unwrap();
        assert_eq!(
            env.signal().unwrap(),
            Signal::PeerOffer(SessionDescription::offer("v=0"))
        );
    }

    #[test]
    fn test_decode_rejects_missing_payload() {
        let text = r#"{"callId":"c9","fromUserId":"bob","toUserId":"alice","type":"PEER_ANSWER"}"#;
        let env = SignalEnvelope::from_json(text).unwrap();
        assert!(matches!(
            env.signal(),
            Err(SignalingError::InvalidPayload {
                signal_type: SignalType::PeerAnswer,
                ..
            })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let text = r#"{"callId":"c9","fromUserId":"bob","type":"SCREEN_SHARE"}"#;
        assert!(SignalEnvelope::from_json(text).is_err());
    }

    #[test]
    fn test_filters() {
        let transport = Arc::new(MockTransport::new());
        let ch = channel(transport);
        let call = CallId::from("c1");

        let offer_to_me = SignalEnvelope::new(
            call.clone(),
            UserId::new("bob"),
            Some(UserId::new("alice")),
            &Signal::PeerOffer(SessionDescription::offer("v=0")),
        )
        .unwrap();
        assert!(ch.accepts_unicast(&offer_to_me));
        assert!(!ch.accepts_broadcast(&offer_to_me));

        let offer_to_other = SignalEnvelope {
            to_user_id: Some(UserId::new("carol")),
            ..offer_to_me.clone()
        };
        assert!(!ch.accepts_unicast(&offer_to_other));

        let joined = SignalEnvelope::new(
            call.clone(),
            UserId::new("bob"),
            None,
            &Signal::UserJoined(Participant::new("bob", "Bob")),
        )
        .unwrap();
        assert!(ch.accepts_broadcast(&joined));

        let initiated =
            SignalEnvelope::new(call.clone(), UserId::new("bob"), None, &Signal::CallInitiated)
                .unwrap();
        assert!(!ch.accepts_broadcast(&initiated));

        let my_own_leave =
            SignalEnvelope::new(call, UserId::new("alice"), None, &Signal::UserLeft).unwrap();
        assert!(!ch.accepts_broadcast(&my_own_leave));
    }

    #[test]
    fn test_topic_paths() {
        assert_eq!(
            Topic::User(UserId::new("alice")).path(),
            "/user/alice/queue/call"
        );
        assert_eq!(
            Topic::Group(GroupId::from("g1")).path(),
            "/topic/group/g1/call"
        );
    }
}
