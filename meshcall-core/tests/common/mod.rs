//! Shared fixtures: participants wired to one in-memory bus, directory and
//! loopback network

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use meshcall_core::loopback::{
    BufferEncoder, InMemoryDirectory, LoopbackLinkFactory, LoopbackNetwork, MemoryBus,
    StaticCapture,
};
use meshcall_core::prelude::*;
use meshcall_core::CallDirectory;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct Harness {
    pub bus: Arc<MemoryBus>,
    pub directory: Arc<InMemoryDirectory>,
    pub network: LoopbackNetwork,
    pub group: GroupId,
}

pub struct Peer {
    pub user: UserId,
    pub mesh: PeerConnectionMesh<meshcall_core::loopback::MemoryBus>,
    pub factory: Arc<LoopbackLinkFactory>,
    pub capture: Arc<StaticCapture>,
    pub encoder: Arc<BufferEncoder>,
    pub events: broadcast::Receiver<MeshEvent>,
}

impl Harness {
    pub fn new() -> Self {
        let bus = Arc::new(MemoryBus::new());
        Self {
            directory: Arc::new(InMemoryDirectory::with_bus(bus.clone())),
            bus,
            network: LoopbackNetwork::new(),
            group: GroupId::from("team"),
        }
    }

    /// Build a mesh without starting it
    pub fn build(&self, name: &str, session: CallSession, config: MeshConfig) -> Peer {
        let capture = Arc::new(StaticCapture::new());
        self.build_with_capture(name, session, config, capture.clone(), capture)
    }

    /// Build a mesh that captures through `device`; `capture` is what the
    /// returned peer exposes for inspection
    pub fn build_with_capture(
        &self,
        name: &str,
        session: CallSession,
        config: MeshConfig,
        device: Arc<dyn CaptureDevice>,
        capture: Arc<StaticCapture>,
    ) -> Peer {
        let participant = Participant::new(name, name.to_uppercase());
        let factory = Arc::new(self.network.factory(name));
        let encoder = Arc::new(BufferEncoder::new());
        let mesh = PeerConnectionMesh::new(
            participant,
            session,
            config,
            MeshBackends {
                transport: self.bus.clone(),
                capture: device,
                links: factory.clone(),
                directory: self.directory.clone(),
                recording: encoder.clone(),
            },
        )
        .unwrap();
        let events = mesh.subscribe_events();
        Peer {
            user: UserId::new(name),
            mesh,
            factory,
            capture,
            encoder,
            events,
        }
    }

    /// Start a call for the group and bring the initiator online
    pub async fn initiate(&self, name: &str) -> Peer {
        let session = self
            .directory
            .initiate(&self.group, &UserId::new(name))
            .await
            .unwrap();
        let peer = self.build(name, session, MeshConfig::default());
        peer.mesh.start().await.unwrap();
        peer
    }

    /// Join the call and bring the participant online
    pub async fn join(&self, name: &str, call_id: &CallId) -> Peer {
        let session = self
            .directory
            .join(call_id, &UserId::new(name))
            .await
            .unwrap();
        let peer = self.build(name, session, MeshConfig::default());
        peer.mesh.start().await.unwrap();
        peer
    }

    /// Initiator plus `names` joining one after the other, each fully
    /// connected before the next joins
    pub async fn call_with(&self, names: &[&str]) -> Vec<Peer> {
        let (first, rest) = names.split_first().unwrap();
        let initiator = self.initiate(first).await;
        let call_id = initiator.mesh.call_id();
        let mut peers = vec![initiator];
        for name in rest {
            let joiner = self.join(name, &call_id).await;
            peers.push(joiner);
            let expected = peers.len() - 1;
            for peer in &peers {
                wait_connected(peer, expected).await;
            }
        }
        peers
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

/// Wait until `peer` has `count` connected links
pub async fn wait_connected(peer: &Peer, count: usize) {
    let mesh = peer.mesh.clone();
    eventually(&format!("{} to have {count} connected links", peer.user), || {
        let mesh = mesh.clone();
        async move { connected_count(&mesh).await == count }
    })
    .await;
}

pub async fn connected_count(mesh: &PeerConnectionMesh<MemoryBus>) -> usize {
    let mut connected = 0;
    for (user, _) in mesh.all_links().await {
        if mesh.link_state(&user).await == Some(LinkState::Connected) {
            connected += 1;
        }
    }
    connected
}

/// Drain every event received so far
pub fn drain(events: &mut broadcast::Receiver<MeshEvent>) -> Vec<MeshEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
