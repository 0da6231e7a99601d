//! Meshcall - full-mesh group call session engine
//!
//! Every participant of a call holds one peer link to every other
//! participant. This crate establishes and tears down those links over a
//! publish/subscribe signaling channel, samples per-link network quality,
//! swaps the outbound video for a screen capture and records the combined
//! call media. It features:
//!
//! - **Signaling Channel**: typed offer/answer/candidate envelopes routed by
//!   user and group topics over any [`SignalingTransport`]
//! - **Peer Mesh**: per-link state machine with glare resolution and
//!   candidate buffering, driven by a single router task
//! - **Quality Monitor**: periodic loss, jitter, bandwidth and RTT samples
//!   classified into five quality levels
//! - **Screen Share**: in-place outbound track replacement on every link
//! - **Recording**: chunked encoding of local and remote streams
//!
//! Native links are provided by the `webrtc` feature; the `loopback`
//! feature provides in-process backends for simulations and tests.
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::prelude::*;
//! use meshcall_core::loopback::{BufferEncoder, InMemoryDirectory, LoopbackNetwork, MemoryBus, StaticCapture};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let bus = Arc::new(MemoryBus::new());
//! let directory = Arc::new(InMemoryDirectory::with_bus(bus.clone()));
//! let network = LoopbackNetwork::new();
//!
//! let alice = Participant::new("alice", "Alice");
//! let session = directory.initiate(&GroupId::from("team"), &alice.user_id).await?;
//!
//! let mesh = PeerConnectionMesh::new(
//!     alice,
//!     session,
//!     MeshConfig::default(),
//!     MeshBackends {
//!         transport: bus,
//!         capture: Arc::new(StaticCapture::new()),
//!         links: Arc::new(network.factory("alice")),
//!         directory,
//!         recording: Arc::new(BufferEncoder::new()),
//!     },
//! )?;
//! mesh.start().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Participant identity
pub mod identity;

/// Core call types and mesh events
pub mod types;

/// Engine configuration
pub mod config;

/// Media tracks and streams
pub mod media;

/// Local capture devices
pub mod capture;

/// Signaling envelopes, topics and channel
pub mod signaling;

/// Peer link abstraction
pub mod link;

/// Call directory abstraction
pub mod directory;

/// Per-link network quality sampling
pub mod monitor;

/// Screen-share track swapping
pub mod swapper;

/// Call recording
pub mod recorder;

/// Full-mesh connection manager
pub mod mesh;

mod registry;

/// Native links backed by the webrtc crate
#[cfg(feature = "webrtc")]
pub mod webrtc_link;

/// In-process backends for simulations and tests
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;

// Re-export main types at crate root
pub use capture::{CaptureDevice, DeviceError, MediaConstraints};
pub use config::{ConfigError, IceServerConfig, MeshConfig, MonitorConfig, RecordingConfig};
pub use directory::{CallDirectory, DirectoryError};
pub use identity::{Participant, UserId};
pub use link::{
    LinkError, LinkEvent, LinkEventSink, LinkFactory, LinkHandle, LinkNotification, LinkStats,
    PeerLink, TransportState,
};
pub use media::{MediaStream, MediaTrack, TrackInfo, TrackKind};
pub use mesh::{MeshBackends, MeshError, MeshInput, PeerConnectionMesh};
pub use monitor::{classify, packet_loss_rate, NetworkQualityMonitor};
pub use recorder::{
    EncoderSession, RecordingArtifact, RecordingBackend, RecordingError, StreamRecorder,
};
pub use signaling::{
    IceCandidate, SdpKind, SessionDescription, Signal, SignalEnvelope, SignalType,
    SignalingChannel, SignalingError, SignalingTransport, Subscription, Topic,
};
pub use swapper::{MediaTrackSwapper, PendingShare, SwapError};
pub use types::*;
#[cfg(feature = "webrtc")]
pub use webrtc_link::{WebRtcLink, WebRtcLinkFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::capture::{CaptureDevice, MediaConstraints};
    pub use crate::config::{MeshConfig, RecordingConfig};
    pub use crate::directory::CallDirectory;
    pub use crate::identity::{Participant, UserId};
    pub use crate::link::{LinkFactory, PeerLink};
    pub use crate::media::{MediaStream, MediaTrack, TrackKind};
    pub use crate::mesh::{MeshBackends, MeshError, PeerConnectionMesh};
    pub use crate::signaling::{SignalingChannel, SignalingTransport};
    pub use crate::types::{
        CallId, CallSession, GroupId, LinkState, MeshEvent, NetworkQuality, NetworkSample,
    };
}
