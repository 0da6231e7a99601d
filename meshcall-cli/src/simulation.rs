//! In-process group call simulation
//!
//! Every participant runs a real [`PeerConnectionMesh`] wired to one shared
//! in-memory bus, call directory and loopback link network.

use anyhow::{bail, Result};
use meshcall_core::loopback::{
    BufferEncoder, InMemoryDirectory, LoopbackLinkFactory, LoopbackNetwork, MemoryBus,
    StaticCapture,
};
use meshcall_core::prelude::*;
use meshcall_core::{LinkStats, RecordingArtifact};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const NAMES: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliet",
    "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra", "tango",
];

/// How long a joiner may take to connect to everyone already in the call
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Number of participants, initiator included
    pub participants: usize,
    /// How long the call stays up once everyone is connected
    pub seconds: u64,
    /// Initiator shares its screen for the duration
    pub share: bool,
    /// Initiator records the call for the duration
    pub record: bool,
    /// Seed for names and simulated link statistics
    pub seed: Option<u64>,
    /// Print every mesh event as it happens
    pub print_events: bool,
}

/// Outcome of one simulated call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    /// Call the participants joined
    pub call_id: String,
    /// One entry per participant in join order
    pub participants: Vec<ParticipantReport>,
    /// Initiator's recording, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingSummary>,
}

/// What one participant saw
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantReport {
    /// Participant id
    pub user_id: String,
    /// Links in CONNECTED state before leaving
    pub connected_links: usize,
    /// Remote streams received before leaving
    pub remote_streams: usize,
    /// Mesh events observed
    pub events: usize,
    /// Quality samples observed
    pub quality_samples: usize,
    /// Latest quality per remote participant
    pub quality: BTreeMap<String, NetworkQuality>,
}

/// Finalized recording
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    /// Selected container/codec
    pub mime_type: String,
    /// Artifact size
    pub size_bytes: usize,
    /// Buffered chunks
    pub chunk_count: usize,
    /// Tracks in the combined stream
    pub tracks: usize,
}

impl From<&RecordingArtifact> for RecordingSummary {
    fn from(artifact: &RecordingArtifact) -> Self {
        Self {
            mime_type: artifact.mime_type.clone(),
            size_bytes: artifact.size(),
            chunk_count: artifact.chunk_count,
            tracks: artifact.tracks.len(),
        }
    }
}

struct Member {
    name: String,
    mesh: PeerConnectionMesh<MemoryBus>,
    printer: JoinHandle<ParticipantReport>,
}

struct Fabric {
    bus: Arc<MemoryBus>,
    directory: Arc<InMemoryDirectory>,
    network: LoopbackNetwork,
}

impl Fabric {
    fn new() -> Self {
        let bus = Arc::new(MemoryBus::new());
        Self {
            directory: Arc::new(InMemoryDirectory::with_bus(bus.clone())),
            bus,
            network: LoopbackNetwork::new(),
        }
    }

    fn mesh_for(
        &self,
        name: &str,
        session: CallSession,
        config: MeshConfig,
    ) -> Result<PeerConnectionMesh<MemoryBus>, MeshError> {
        let links: Arc<LoopbackLinkFactory> = Arc::new(self.network.factory(name));
        PeerConnectionMesh::new(
            Participant::new(name, display_name(name)),
            session,
            config,
            MeshBackends {
                transport: self.bus.clone(),
                capture: Arc::new(StaticCapture::new()),
                links,
                directory: self.directory.clone(),
                recording: Arc::new(BufferEncoder::new()),
            },
        )
    }
}

/// Run one call from first join to last leave
///
/// # Errors
///
/// Returns an error if fewer than two participants are requested, if a
/// participant cannot join or connect, or if screen share or recording fails
#[tracing::instrument(skip_all, fields(participants = options.participants))]
pub async fn run(config: MeshConfig, options: &SimulationOptions) -> Result<SimulationReport> {
    if options.participants < 2 {
        bail!("a simulated call needs at least two participants");
    }

    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let fabric = Fabric::new();
    let group = GroupId::from("simulation");
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut members: Vec<Member> = Vec::with_capacity(options.participants);
    let mut call_id: Option<CallId> = None;
    for name in participant_names(&mut rng, options.participants) {
        let user = UserId::new(name.as_str());
        let session = match &call_id {
            None => fabric.directory.initiate(&group, &user).await?,
            Some(id) => fabric.directory.join(id, &user).await?,
        };
        call_id.get_or_insert_with(|| session.call_id.clone());

        let mesh = fabric.mesh_for(&name, session, config.clone())?;
        let printer = tokio::spawn(collect_events(
            name.clone(),
            mesh.subscribe_events(),
            stop_rx.clone(),
            options.print_events,
        ));
        mesh.start().await?;
        members.push(Member {
            name,
            mesh,
            printer,
        });

        let expected = members.len() - 1;
        for member in &members {
            wait_connected(member, expected).await?;
        }
        info!(user = %user, peers = expected, "Participant connected");
    }

    for a in &members {
        for b in &members {
            if a.name == b.name {
                continue;
            }
            if let Some(link) = fabric.network.link_between(a.name.as_str(), b.name.as_str()) {
                link.set_stats(random_stats(&mut rng));
            }
        }
    }

    let host = &members[0].mesh;
    if options.share {
        host.start_screen_share().await?;
    }
    if options.record {
        let mime_type = host.start_recording(None).await?;
        info!(%mime_type, "Recording started");
    }

    tokio::time::sleep(Duration::from_secs(options.seconds)).await;

    if options.share {
        host.stop_screen_share().await;
    }
    let recording = if options.record {
        let artifact = host.stop_recording().await?;
        Some(RecordingSummary::from(&artifact))
    } else {
        None
    };

    let mut snapshots = Vec::with_capacity(members.len());
    for member in &members {
        snapshots.push((
            connected_count(&member.mesh).await,
            member.mesh.remote_streams().await.len(),
        ));
    }

    for member in members.iter().rev() {
        if let Err(e) = member.mesh.leave().await {
            warn!(user = %member.name, error = %e, "Leave failed");
        }
    }
    let _ = stop_tx.send(true);

    let mut participants = Vec::with_capacity(members.len());
    for (member, (connected_links, remote_streams)) in members.into_iter().zip(snapshots) {
        let mut report = member.printer.await.unwrap_or_default();
        report.user_id = member.name;
        report.connected_links = connected_links;
        report.remote_streams = remote_streams;
        participants.push(report);
    }

    Ok(SimulationReport {
        call_id: call_id.map(|id| id.to_string()).unwrap_or_default(),
        participants,
        recording,
    })
}

/// `n` distinct participant names
pub fn participant_names(rng: &mut impl Rng, n: usize) -> Vec<String> {
    (1..=n)
        .map(|i| format!("{}-{i}", NAMES[rng.gen_range(0..NAMES.len())]))
        .collect()
}

fn display_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn random_stats(rng: &mut impl Rng) -> LinkStats {
    let packets_received = rng.gen_range(5_000..20_000);
    LinkStats {
        packets_received,
        packets_lost: rng.gen_range(0..packets_received / 8),
        jitter_ms: rng.gen_range(1.0..30.0),
        bytes_received: packets_received * 1_200,
        round_trip_time_ms: Some(rng.gen_range(20.0..450.0)),
    }
}

async fn wait_connected(member: &Member, expected: usize) -> Result<()> {
    let waited = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while connected_count(&member.mesh).await < expected
            || member.mesh.remote_streams().await.len() < expected
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if waited.is_err() {
        bail!(
            "{} did not receive media from {expected} peers within {CONNECT_TIMEOUT:?}",
            member.name
        );
    }
    Ok(())
}

async fn connected_count(mesh: &PeerConnectionMesh<MemoryBus>) -> usize {
    let mut connected = 0;
    for (user, _) in mesh.all_links().await {
        if mesh.link_state(&user).await == Some(LinkState::Connected) {
            connected += 1;
        }
    }
    connected
}

async fn collect_events(
    name: String,
    mut events: broadcast::Receiver<MeshEvent>,
    mut stop: watch::Receiver<bool>,
    print: bool,
) -> ParticipantReport {
    let mut report = ParticipantReport::default();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            event = events.recv() => match event {
                Ok(event) => record(&mut report, &name, &event, print),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(user = %name, skipped, "Event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    while let Ok(event) = events.try_recv() {
        record(&mut report, &name, &event, print);
    }
    report
}

fn record(report: &mut ParticipantReport, name: &str, event: &MeshEvent, print: bool) {
    report.events += 1;
    if let MeshEvent::QualitySampled(sample) = event {
        report.quality_samples += 1;
        report
            .quality
            .insert(sample.user_id.to_string(), sample.quality);
    }
    if print {
        println!("[{name}] {}", describe(event));
    }
}

/// One-line description of a mesh event
pub fn describe(event: &MeshEvent) -> String {
    match event {
        MeshEvent::PeerJoined { participant } => format!("{} joined", participant.user_id),
        MeshEvent::LinkStateChanged { user_id, from, to } => {
            format!("link to {user_id}: {from} -> {to}")
        }
        MeshEvent::PeerConnected { user_id } => format!("connected to {user_id}"),
        MeshEvent::LinkFailed { user_id, reason } => format!("link to {user_id} failed: {reason}"),
        MeshEvent::RemoteStreamAdded { user_id, stream } => {
            format!("media from {user_id} ({} tracks)", stream.len())
        }
        MeshEvent::PeerRemoved { user_id } => format!("{user_id} removed"),
        MeshEvent::QualitySampled(sample) => format!(
            "quality to {}: {} (loss {:.1}%, rtt {:.0} ms)",
            sample.user_id,
            sample.quality,
            sample.packet_loss_rate * 100.0,
            sample.round_trip_time_ms
        ),
        MeshEvent::ScreenShareStarted => "screen share started".to_string(),
        MeshEvent::ScreenShareStopped => "screen share stopped".to_string(),
        MeshEvent::RecordingStarted { mime_type } => format!("recording as {mime_type}"),
        MeshEvent::RecordingStopped {
            size_bytes,
            chunk_count,
        } => format!("recording finished: {size_bytes} bytes in {chunk_count} chunks"),
        MeshEvent::SetupFailed { reason } => format!("setup failed: {reason}"),
        MeshEvent::CallEnded { call_id } => format!("call {call_id} ended"),
    }
}
