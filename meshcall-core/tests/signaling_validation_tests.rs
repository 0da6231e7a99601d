//! Signaling channel behaviour over the in-memory bus

#![allow(clippy::unwrap_used)]

use meshcall_core::loopback::MemoryBus;
use meshcall_core::{
    CallId, GroupId, IceCandidate, Participant, SessionDescription, Signal, SignalEnvelope,
    SignalType, SignalingChannel, SignalingError, UserId,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<MemoryBus>, CallId, GroupId) {
    let bus = Arc::new(MemoryBus::new());
    let call_id = CallId::from("call-42");
    let group = GroupId::from("team");
    bus.bind_call(&call_id, &group);
    (bus, call_id, group)
}

fn channel(bus: &Arc<MemoryBus>, user: &str, group: &GroupId) -> SignalingChannel<MemoryBus> {
    SignalingChannel::new(bus.clone(), UserId::new(user), group.clone())
}

#[tokio::test]
async fn unicast_reaches_only_the_recipient() {
    let (bus, call_id, group) = setup();
    let alice = channel(&bus, "alice", &group);
    let bob = channel(&bus, "bob", &group);
    let carol = channel(&bus, "carol", &group);
    let mut bob_inbox = bob.subscribe_user().await.unwrap();
    let mut carol_inbox = carol.subscribe_user().await.unwrap();

    let offer = Signal::PeerOffer(SessionDescription::offer("v=0"));
    alice
        .send_signal(&call_id, Some(&UserId::new("bob")), &offer)
        .await
        .unwrap();

    let received = bob_inbox.recv().await.unwrap();
    assert!(bob.accepts_unicast(&received));
    assert_eq!(received.signal().unwrap(), offer);
    let nothing = tokio::time::timeout(Duration::from_millis(20), carol_inbox.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn broadcast_echo_is_not_accepted_by_the_sender() {
    let (bus, call_id, group) = setup();
    let alice = channel(&bus, "alice", &group);
    let bob = channel(&bus, "bob", &group);
    let mut alice_group = alice.subscribe_group().await.unwrap();
    let mut bob_group = bob.subscribe_group().await.unwrap();

    let joined = Signal::UserJoined(Participant::new("alice", "Alice"));
    alice.send_signal(&call_id, None, &joined).await.unwrap();

    let echo = alice_group.recv().await.unwrap();
    assert!(!alice.accepts_broadcast(&echo));
    let delivered = bob_group.recv().await.unwrap();
    assert!(bob.accepts_broadcast(&delivered));
    assert_eq!(delivered.signal().unwrap(), joined);
}

#[tokio::test]
async fn peer_signals_on_the_group_topic_are_rejected() {
    let (bus, call_id, group) = setup();
    let bob = channel(&bus, "bob", &group);
    let candidate = Signal::IceCandidate(IceCandidate {
        candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
        sdp_mid: None,
        sdp_mline_index: Some(0),
    });
    let envelope = SignalEnvelope::new(call_id, UserId::new("alice"), None, &candidate).unwrap();

    assert!(!bob.accepts_broadcast(&envelope));
    assert!(!bob.accepts_unicast(&envelope));
}

#[tokio::test]
async fn publishing_while_disconnected_fails() {
    let (bus, call_id, group) = setup();
    let alice = channel(&bus, "alice", &group);
    bus.set_connected(false);

    let err = alice
        .send_signal(&call_id, None, &Signal::UserLeft)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::TransportError(_)));
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn dropping_a_subscription_unsubscribes() {
    let (bus, _call_id, group) = setup();
    let alice = channel(&bus, "alice", &group);

    let user = alice.subscribe_user().await.unwrap();
    let group_sub = alice.subscribe_group().await.unwrap();
    assert_eq!(bus.subscription_count(), 2);

    user.dispose();
    assert_eq!(bus.subscription_count(), 1);
    drop(group_sub);
    assert_eq!(bus.subscription_count(), 0);
}

#[test]
fn envelope_survives_the_wire() {
    let envelope = SignalEnvelope::new(
        CallId::from("call-42"),
        UserId::new("alice"),
        Some(UserId::new("bob")),
        &Signal::PeerAnswer(SessionDescription::answer("v=0 answer")),
    )
    .unwrap();

    let json = envelope.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["type"], "PEER_ANSWER");
    assert_eq!(value["callId"], "call-42");
    assert_eq!(value["data"]["type"], "answer");

    let decoded = SignalEnvelope::from_json(&json).unwrap();
    assert_eq!(decoded.signal_type, SignalType::PeerAnswer);
    assert_eq!(decoded, envelope);
}

#[test]
fn offer_type_with_candidate_payload_is_invalid() {
    let json = r#"{
        "callId": "call-42",
        "fromUserId": "alice",
        "toUserId": "bob",
        "type": "PEER_OFFER",
        "data": { "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host" }
    }"#;
    let envelope = SignalEnvelope::from_json(json).unwrap();
    assert!(matches!(
        envelope.signal(),
        Err(SignalingError::InvalidPayload { .. })
    ));
}
