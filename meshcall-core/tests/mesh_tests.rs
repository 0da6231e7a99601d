//! Mesh negotiation tests over the loopback backends

#![allow(clippy::unwrap_used)]

mod common;

use common::{drain, eventually, wait_connected, Harness};
use meshcall_core::prelude::*;
use meshcall_core::{
    CallDirectory, DeviceError, IceCandidate, MeshInput, SessionDescription, Signal,
    SignalEnvelope, SignalType,
};
use pretty_assertions::assert_eq;

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

fn quiet_config() -> MeshConfig {
    MeshConfig {
        announce_presence: false,
        ..MeshConfig::default()
    }
}

#[tokio::test]
async fn test_two_party_call_connects() {
    let harness = Harness::new();
    let mut peers = harness.call_with(&["alice", "bob"]).await;
    let bob = peers.pop().unwrap();
    let mut alice = peers.pop().unwrap();

    let offers = harness.bus.published_of(SignalType::PeerOffer);
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].from_user_id, UserId::new("bob"));
    assert_eq!(offers[0].to_user_id, Some(UserId::new("alice")));

    let answers = harness.bus.published_of(SignalType::PeerAnswer);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].from_user_id, UserId::new("alice"));

    // Each side sees the other's camera and microphone
    for mesh in [&alice.mesh, &bob.mesh] {
        eventually("remote camera and microphone", || async move {
            let streams = mesh.remote_streams().await;
            streams.len() == 1 && streams[0].1.len() == 2
        })
        .await;
    }
    assert_eq!(alice.mesh.remote_streams().await[0].0, UserId::new("bob"));

    // The join announcement reached the initiator
    let alice_mesh = &alice.mesh;
    eventually("bob's announcement", || async move {
        alice_mesh.participants().len() == 2
    })
    .await;
    let ids: Vec<_> = alice
        .mesh
        .participants()
        .into_iter()
        .map(|p| p.user_id)
        .collect();
    assert_eq!(ids, vec![UserId::new("alice"), UserId::new("bob")]);

    let events = drain(&mut alice.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, MeshEvent::PeerJoined { participant } if participant.user_id.as_str() == "bob")));
    assert!(events
        .iter()
        .any(|e| matches!(e, MeshEvent::PeerConnected { user_id } if user_id.as_str() == "bob")));
}

#[tokio::test]
async fn test_joiner_offers_to_every_existing_participant() {
    let harness = Harness::new();
    let peers = harness
        .call_with(&["alice", "bob", "carol", "dave"])
        .await;

    for peer in &peers {
        wait_connected(peer, 3).await;
    }

    let offers = harness.bus.published_of(SignalType::PeerOffer);
    // One link per pair, offered by the later joiner
    assert_eq!(offers.len(), 6);
    let from_dave: Vec<_> = offers
        .iter()
        .filter(|e| e.from_user_id.as_str() == "dave")
        .map(|e| e.to_user_id.clone().unwrap())
        .collect();
    assert_eq!(
        from_dave,
        vec![UserId::new("alice"), UserId::new("bob"), UserId::new("carol")]
    );

    // USER_JOINED never triggers offers from existing participants
    assert!(offers.iter().all(|e| e.from_user_id.as_str() != "alice"));
}

#[tokio::test]
async fn test_glare_is_resolved_by_user_id() {
    let harness = Harness::new();
    let session = harness
        .directory
        .initiate(&harness.group, &UserId::new("alice"))
        .await
        .unwrap();
    // Neither roster lists the other, so starting sends no offers
    let mut bob_session = session.clone();
    bob_session.participants.clear();
    let alice = harness.build("alice", session, quiet_config());
    let bob = harness.build("bob", bob_session, quiet_config());
    alice.mesh.start().await.unwrap();
    bob.mesh.start().await.unwrap();
    assert!(harness.bus.published().is_empty());

    // Both offer before either router runs
    alice.mesh.create_offer_to(&bob.user).await;
    bob.mesh.create_offer_to(&alice.user).await;
    assert_eq!(harness.bus.published_of(SignalType::PeerOffer).len(), 2);

    wait_connected(&alice, 1).await;
    wait_connected(&bob, 1).await;

    // "bob" sorts after "alice" and keeps its offer; alice answers
    let answers = harness.bus.published_of(SignalType::PeerAnswer);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].from_user_id, UserId::new("alice"));
    assert_eq!(alice.factory.created_links().len(), 2);
    assert_eq!(bob.factory.created_links().len(), 1);
}

#[tokio::test]
async fn test_local_candidates_follow_the_offer() {
    let harness = Harness::new();
    let mut session = harness
        .directory
        .initiate(&harness.group, &UserId::new("alice"))
        .await
        .unwrap();
    session.add_participant(Participant::new("bob", "Bob"));
    let alice = harness.build("alice", session, quiet_config());
    alice.mesh.start().await.unwrap();

    let bus = &harness.bus;
    eventually("alice to publish a candidate", || async move {
        !bus.published_of(SignalType::IceCandidate).is_empty()
    })
    .await;

    let published = harness.bus.published();
    let offer_at = published
        .iter()
        .position(|e| e.signal_type == SignalType::PeerOffer)
        .unwrap();
    let candidate_at = published
        .iter()
        .position(|e| e.signal_type == SignalType::IceCandidate)
        .unwrap();
    assert!(offer_at < candidate_at);
    assert_eq!(published[candidate_at].to_user_id, Some(UserId::new("bob")));
    assert_eq!(
        alice.mesh.link_state(&UserId::new("bob")).await,
        Some(LinkState::OfferSent)
    );
}

#[tokio::test]
async fn test_remote_candidates_wait_for_the_answer() {
    let harness = Harness::new();
    let mut session = harness
        .directory
        .initiate(&harness.group, &UserId::new("alice"))
        .await
        .unwrap();
    session.add_participant(Participant::new("bob", "Bob"));
    let mut alice = harness.build("alice", session, quiet_config());
    alice.mesh.start().await.unwrap();
    let bob = UserId::new("bob");

    alice.mesh.handle_ice_candidate(&bob, candidate(1)).await;
    alice.mesh.handle_ice_candidate(&bob, candidate(2)).await;
    let link = alice.factory.link_to("bob").unwrap();
    assert!(link.applied_candidates().is_empty());

    alice
        .mesh
        .handle_answer(&bob, SessionDescription::answer("v=0 o=bob"))
        .await;
    assert_eq!(link.applied_candidates(), vec![candidate(1), candidate(2)]);

    // Later candidates go straight through
    alice.mesh.handle_ice_candidate(&bob, candidate(3)).await;
    assert_eq!(link.applied_candidates().len(), 3);

    let (mesh, bob_id) = (&alice.mesh, &bob);
    eventually("link to connect", || async move {
        mesh.link_state(bob_id).await == Some(LinkState::Connected)
    })
    .await;
    let states: Vec<_> = drain(&mut alice.events)
        .into_iter()
        .filter_map(|e| match e {
            MeshEvent::LinkStateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            LinkState::OfferSent,
            LinkState::AnswerReceived,
            LinkState::Connected
        ]
    );
}

#[tokio::test]
async fn test_glare_winner_ignores_candidates_for_abandoned_offer() {
    let harness = Harness::new();
    let mut session = harness
        .directory
        .initiate(&harness.group, &UserId::new("alice"))
        .await
        .unwrap();
    session.add_participant(Participant::new("bob", "Bob"));
    let bob = harness.build("bob", session, quiet_config());
    bob.mesh.start().await.unwrap();
    let alice = UserId::new("alice");
    let (mesh, alice_id) = (&bob.mesh, &alice);
    eventually("bob's offer", || async move {
        mesh.link_state(alice_id).await == Some(LinkState::OfferSent)
    })
    .await;

    // Trickled before alice's competing offer showed up
    bob.mesh.handle_ice_candidate(&alice, candidate(1)).await;
    bob.mesh
        .handle_offer(&alice, SessionDescription::offer("v=0 o=alice"))
        .await;
    // Belongs to the offer bob just rejected
    bob.mesh.handle_ice_candidate(&alice, candidate(2)).await;
    assert_eq!(
        bob.mesh.link_state(&alice).await,
        Some(LinkState::OfferSent)
    );

    bob.mesh
        .handle_answer(&alice, SessionDescription::answer("v=0 o=alice"))
        .await;
    let link = bob.factory.link_to("alice").unwrap();
    assert!(link.applied_candidates().is_empty());

    bob.mesh.handle_ice_candidate(&alice, candidate(3)).await;
    assert_eq!(link.applied_candidates(), vec![candidate(3)]);
    assert_eq!(bob.factory.created_links().len(), 1);
}

#[tokio::test]
async fn test_candidate_for_unknown_link_is_dropped() {
    let harness = Harness::new();
    let alice = harness.initiate("alice").await;

    alice
        .mesh
        .handle_ice_candidate(&UserId::new("zed"), candidate(1))
        .await;
    assert!(alice.mesh.all_links().await.is_empty());
    assert!(alice.factory.created_links().is_empty());
}

#[tokio::test]
async fn test_unexpected_answer_is_ignored() {
    let harness = Harness::new();
    let peers = harness.call_with(&["alice", "bob"]).await;
    let alice = &peers[0];

    alice
        .mesh
        .handle_answer(&UserId::new("carol"), SessionDescription::answer("v=0"))
        .await;
    assert!(alice.mesh.get_link(&UserId::new("carol")).await.is_none());

    alice
        .mesh
        .handle_answer(&UserId::new("bob"), SessionDescription::answer("v=0 late"))
        .await;
    assert_eq!(
        alice.mesh.link_state(&UserId::new("bob")).await,
        Some(LinkState::Connected)
    );
}

#[tokio::test]
async fn test_offer_failure_is_isolated_to_one_link() {
    let harness = Harness::new();
    let peers = harness.call_with(&["alice", "bob"]).await;
    let call_id = peers[0].mesh.call_id();

    let session = harness
        .directory
        .join(&call_id, &UserId::new("carol"))
        .await
        .unwrap();
    let mut carol = harness.build("carol", session, MeshConfig::default());
    carol.factory.fail_offers_to("bob");
    carol.mesh.start().await.unwrap();

    wait_connected(&carol, 1).await;
    assert_eq!(
        carol.mesh.link_state(&UserId::new("alice")).await,
        Some(LinkState::Connected)
    );
    assert_eq!(
        carol.mesh.link_state(&UserId::new("bob")).await,
        Some(LinkState::Failed)
    );
    assert!(drain(&mut carol.events)
        .iter()
        .any(|e| matches!(e, MeshEvent::LinkFailed { user_id, .. } if user_id.as_str() == "bob")));
    assert!(carol.factory.link_to("bob").unwrap().is_closed());
}

#[tokio::test]
async fn test_link_creation_failure_leaves_no_link() {
    let harness = Harness::new();
    let alice = harness.initiate("alice").await;
    let session = harness
        .directory
        .join(&alice.mesh.call_id(), &UserId::new("bob"))
        .await
        .unwrap();
    let mut bob = harness.build("bob", session, MeshConfig::default());
    bob.factory.fail_creation_for("alice");
    bob.mesh.start().await.unwrap();

    assert!(bob.mesh.get_link(&alice.user).await.is_none());
    assert!(harness.bus.published_of(SignalType::PeerOffer).is_empty());
    assert!(drain(&mut bob.events)
        .iter()
        .any(|e| matches!(e, MeshEvent::LinkFailed { .. })));
}

#[tokio::test]
async fn test_transport_failure_marks_link_failed() {
    let harness = Harness::new();
    let mut peers = harness.call_with(&["alice", "bob"]).await;
    let alice = &mut peers[0];
    drain(&mut alice.events);
    let bob = UserId::new("bob");
    assert!(alice.mesh.monitor().is_monitoring(&bob));

    alice.factory.link_to("bob").unwrap().fail_transport();
    let (mesh, bob_id) = (&alice.mesh, &bob);
    eventually("link to fail", || async move {
        mesh.link_state(bob_id).await == Some(LinkState::Failed)
    })
    .await;

    assert!(!alice.mesh.monitor().is_monitoring(&bob));
    assert!(alice.mesh.remote_streams().await.is_empty());
    assert!(drain(&mut alice.events)
        .iter()
        .any(|e| matches!(e, MeshEvent::LinkFailed { reason, .. } if reason == "transport failed")));
}

#[tokio::test]
async fn test_failed_link_is_replaced_by_new_offer() {
    let harness = Harness::new();
    let peers = harness.call_with(&["alice", "bob"]).await;
    let (alice, bob) = (&peers[0], &peers[1]);

    bob.factory.link_to("alice").unwrap().fail_transport();
    eventually("bob's link to fail", || async move {
        bob.mesh.link_state(&alice.user).await == Some(LinkState::Failed)
    })
    .await;

    bob.mesh.create_offer_to(&alice.user).await;
    eventually("bob to reconnect", || async move {
        bob.mesh.link_state(&alice.user).await == Some(LinkState::Connected)
    })
    .await;
    wait_connected(alice, 1).await;
    assert_eq!(bob.factory.created_links().len(), 2);
}

#[tokio::test]
async fn test_user_left_removes_peer_everywhere() {
    let harness = Harness::new();
    let peers = harness.call_with(&["alice", "bob", "carol"]).await;
    assert_eq!(harness.bus.subscription_count(), 6);

    peers[2].mesh.leave().await.unwrap();
    assert!(peers[2].mesh.is_closed());
    assert!(peers[2].mesh.all_links().await.is_empty());
    assert!(peers[2]
        .capture
        .user_streams()
        .iter()
        .all(|s| !s.is_active()));

    for peer in &peers[..2] {
        let mesh = peer.mesh.clone();
        eventually("carol to be removed", || {
            let mesh = mesh.clone();
            async move { mesh.get_link(&UserId::new("carol")).await.is_none() }
        })
        .await;
        assert_eq!(peer.mesh.participants().len(), 2);
    }
    let bus = &harness.bus;
    eventually("carol's subscriptions to be disposed", || async move {
        bus.subscription_count() == 4
    })
    .await;

    let call = harness.directory.call(&peers[0].mesh.call_id()).unwrap();
    assert!(!call.contains(&UserId::new("carol")));
}

#[tokio::test]
async fn test_remove_peer_is_idempotent() {
    let harness = Harness::new();
    let mut peers = harness.call_with(&["alice", "bob"]).await;
    let alice = &mut peers[0];
    drain(&mut alice.events);
    let bob = UserId::new("bob");
    let link = alice.factory.link_to("bob").unwrap();

    alice.mesh.remove_peer(&bob).await;
    alice.mesh.remove_peer(&bob).await;
    alice.mesh.remove_peer(&UserId::new("nobody")).await;

    let removed = drain(&mut alice.events)
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::PeerRemoved { .. }))
        .count();
    assert_eq!(removed, 1);
    assert!(alice.mesh.get_link(&bob).await.is_none());
    assert!(link.is_closed());
    assert!(alice
        .mesh
        .remote_streams()
        .await
        .iter()
        .all(|(user, _)| user != &bob));
    assert!(!alice.mesh.monitor().is_monitoring(&bob));
}

#[tokio::test]
async fn test_end_call_tears_down_everyone() {
    let harness = Harness::new();
    let mut peers = harness.call_with(&["alice", "bob", "carol"]).await;
    let call_id = peers[0].mesh.call_id();

    peers[0].mesh.end_call().await.unwrap();

    for peer in &mut peers {
        let mesh = peer.mesh.clone();
        eventually("mesh to close", || {
            let mesh = mesh.clone();
            async move { mesh.is_closed() }
        })
        .await;
        assert!(peer.mesh.all_links().await.is_empty());
        assert!(!peer.mesh.session().is_active());
        assert!(drain(&mut peer.events)
            .iter()
            .any(|e| matches!(e, MeshEvent::CallEnded { .. })));
    }
    assert!(!harness.directory.call(&call_id).unwrap().is_active());
    let bus = &harness.bus;
    eventually("every subscription to be disposed", || async move {
        bus.subscription_count() == 0
    })
    .await;
}

#[tokio::test]
async fn test_device_error_aborts_setup() {
    let harness = Harness::new();
    let session = harness
        .directory
        .initiate(&harness.group, &UserId::new("alice"))
        .await
        .unwrap();
    let mut alice = harness.build("alice", session, MeshConfig::default());
    alice
        .capture
        .deny_user_media(DeviceError::PermissionDenied("camera blocked".to_string()));

    let err = alice.mesh.start().await.unwrap_err();
    assert!(matches!(err, MeshError::Device(DeviceError::PermissionDenied(_))));
    assert_eq!(harness.bus.subscription_count(), 0);
    assert!(harness.bus.published().is_empty());
    assert!(alice.mesh.local_stream().is_none());
    assert!(matches!(
        alice.events.try_recv().unwrap(),
        MeshEvent::SetupFailed { .. }
    ));
}

#[tokio::test]
async fn test_signaling_outage_aborts_setup_and_releases_media() {
    let harness = Harness::new();
    let session = harness
        .directory
        .initiate(&harness.group, &UserId::new("alice"))
        .await
        .unwrap();
    let alice = harness.build("alice", session, MeshConfig::default());
    harness.bus.set_connected(false);

    let err = alice.mesh.start().await.unwrap_err();
    assert!(matches!(err, MeshError::Signaling(_)));
    let streams = alice.capture.user_streams();
    assert_eq!(streams.len(), 1);
    assert!(!streams[0].is_active());

    // Setup can be retried once signaling is back
    harness.bus.set_connected(true);
    alice.mesh.start().await.unwrap();
    assert_eq!(harness.bus.subscription_count(), 2);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let harness = Harness::new();
    let alice = harness.initiate("alice").await;
    assert!(matches!(
        alice.mesh.start().await,
        Err(MeshError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let harness = Harness::new();
    let mut peers = harness.call_with(&["alice", "bob", "carol"]).await;
    let alice = &mut peers[0];
    drain(&mut alice.events);
    let link = alice.factory.link_to("bob").unwrap();

    alice.mesh.cleanup().await;
    alice.mesh.cleanup().await;

    let removed = drain(&mut alice.events)
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::PeerRemoved { .. }))
        .count();
    assert_eq!(removed, 2);
    assert!(alice.mesh.monitor().monitored_users().is_empty());
    assert!(link.is_closed());
    assert!(alice.mesh.local_stream().is_none());
    assert!(matches!(alice.mesh.start().await, Err(MeshError::Closed)));
}

#[tokio::test]
async fn test_router_filters_foreign_envelopes() {
    let harness = Harness::new();
    let alice = harness.initiate("alice").await;
    let offer = Signal::PeerOffer(SessionDescription::offer("v=0 o=mallory"));

    // Another call
    let other_call = SignalEnvelope::new(
        CallId::from("other-call"),
        UserId::new("mallory"),
        Some(alice.user.clone()),
        &offer,
    )
    .unwrap();
    alice.mesh.dispatch(MeshInput::Unicast(other_call)).await;

    // Addressed to someone else
    let misrouted = SignalEnvelope::new(
        alice.mesh.call_id(),
        UserId::new("mallory"),
        Some(UserId::new("bob")),
        &offer,
    )
    .unwrap();
    alice.mesh.dispatch(MeshInput::Unicast(misrouted)).await;

    // Offer delivered on the group topic
    let broadcast =
        SignalEnvelope::new(alice.mesh.call_id(), UserId::new("mallory"), None, &offer).unwrap();
    alice.mesh.dispatch(MeshInput::Broadcast(broadcast)).await;

    // Malformed payload
    let mut malformed = SignalEnvelope::new(
        alice.mesh.call_id(),
        UserId::new("mallory"),
        Some(alice.user.clone()),
        &offer,
    )
    .unwrap();
    malformed.data = Some(serde_json::json!({ "unexpected": true }));
    alice.mesh.dispatch(MeshInput::Unicast(malformed)).await;

    assert!(alice.factory.created_links().is_empty());
    assert!(alice.mesh.all_links().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_quality_samples_are_forwarded() {
    let harness = Harness::new();
    let mut peers = harness.call_with(&["alice", "bob"]).await;
    let alice = &mut peers[0];
    drain(&mut alice.events);

    alice
        .factory
        .link_to("bob")
        .unwrap()
        .set_stats(meshcall_core::LinkStats {
            packets_lost: 10,
            packets_received: 90,
            jitter_ms: 4.0,
            bytes_received: 50_000,
            round_trip_time_ms: Some(420.0),
        });

    let sample = loop {
        match alice.events.recv().await.unwrap() {
            MeshEvent::QualitySampled(sample) => break sample,
            _ => continue,
        }
    };
    assert_eq!(sample.user_id, UserId::new("bob"));
    assert_eq!(sample.quality, NetworkQuality::Poor);
    assert!((sample.packet_loss_rate - 0.1).abs() < 1e-9);
}
