//! Call recording
//!
//! The recorder merges several live streams into one combined stream (all
//! video tracks first, then all audio tracks, each in input order), opens an
//! encoder for the first supported container format and collects the
//! encoder's output in fixed-length time chunks until it is stopped.

use crate::config::{ConfigError, RecordingConfig};
use crate::media::{MediaStream, TrackInfo};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Recording errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordingError {
    /// A recording is already running
    #[error("Recording already in progress")]
    AlreadyRecording,

    /// Stop was requested without a running recording
    #[error("No active recording")]
    NoActiveRecording,

    /// None of the input streams carries a track
    #[error("Nothing to record: input streams have no tracks")]
    NoTracks,

    /// The encoder failed
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// The recording configuration cannot be used
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Platform encoder factory
pub trait RecordingBackend: Send + Sync {
    /// Whether the platform can encode this container/codec string
    fn is_type_supported(&self, mime_type: &str) -> bool;

    /// Start encoding `stream` as `mime_type`
    ///
    /// # Errors
    ///
    /// Returns [`RecordingError::Encoder`] if the encoder cannot be opened
    fn open(
        &self,
        stream: &MediaStream,
        mime_type: &str,
    ) -> Result<Box<dyn EncoderSession>, RecordingError>;
}

/// One running encoder
#[async_trait]
pub trait EncoderSession: Send {
    /// Take the data encoded since the previous request
    ///
    /// # Errors
    ///
    /// Returns [`RecordingError::Encoder`] if the encoder failed
    fn request_chunk(&mut self) -> Result<Option<Bytes>, RecordingError>;

    /// Suspend encoding
    fn pause(&mut self);

    /// Resume encoding
    fn resume(&mut self);

    /// Flush and close the encoder, returning any trailing data
    ///
    /// # Errors
    ///
    /// Returns [`RecordingError::Encoder`] if finalization failed
    async fn finish(self: Box<Self>) -> Result<Option<Bytes>, RecordingError>;
}

/// Finalized recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingArtifact {
    /// Container/codec the data is encoded as
    pub mime_type: String,
    /// Concatenated chunks
    pub data: Bytes,
    /// Number of chunks that made up the data
    pub chunk_count: usize,
    /// Tracks of the combined stream, video first
    pub tracks: Vec<TrackInfo>,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Time between start and stop, pauses included
    pub duration: Duration,
}

impl RecordingArtifact {
    /// Size of the encoded data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Merge streams: every video track, then every audio track, in input order
pub fn combine_streams(streams: &[MediaStream]) -> MediaStream {
    let mut combined = MediaStream::new(format!("recording-{}", uuid::Uuid::new_v4()));
    for track in streams.iter().flat_map(MediaStream::video_tracks) {
        combined.add_track(track.clone());
    }
    for track in streams.iter().flat_map(MediaStream::audio_tracks) {
        combined.add_track(track.clone());
    }
    combined
}

/// First preferred format the backend supports, or the platform default
pub fn select_mime_type(backend: &dyn RecordingBackend, preferences: &[String]) -> String {
    preferences
        .iter()
        .find(|mime| backend.is_type_supported(mime))
        .cloned()
        .unwrap_or_else(|| RecordingConfig::FALLBACK_MIME_TYPE.to_string())
}

struct ActiveRecording {
    session: Box<dyn EncoderSession>,
    chunks: Vec<Bytes>,
    mime_type: String,
    tracks: Vec<TrackInfo>,
    started_at: DateTime<Utc>,
    started: Instant,
    paused: bool,
    timer: JoinHandle<()>,
}

impl ActiveRecording {
    fn collect_chunk(&mut self) {
        if self.paused {
            return;
        }
        match self.session.request_chunk() {
            Ok(Some(chunk)) if !chunk.is_empty() => self.chunks.push(chunk),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Chunk request failed, skipping tick"),
        }
    }
}

type SharedState = Arc<Mutex<Option<ActiveRecording>>>;

/// Records a set of streams into one artifact
pub struct StreamRecorder {
    backend: Arc<dyn RecordingBackend>,
    defaults: RecordingConfig,
    state: SharedState,
}

impl StreamRecorder {
    /// Create an idle recorder
    pub fn new(backend: Arc<dyn RecordingBackend>, defaults: RecordingConfig) -> Self {
        Self {
            backend,
            defaults,
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a recording is running (paused counts as running)
    pub fn is_recording(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Whether the running recording is paused
    pub fn is_paused(&self) -> bool {
        self.state.lock().as_ref().is_some_and(|a| a.paused)
    }

    /// Chunks buffered so far
    pub fn chunk_count(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |a| a.chunks.len())
    }

    /// Format of the running recording
    pub fn mime_type(&self) -> Option<String> {
        self.state.lock().as_ref().map(|a| a.mime_type.clone())
    }

    /// Start recording the combination of `streams`
    ///
    /// Uses the recorder's defaults when `config` is `None`. Returns the
    /// selected format. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RecordingError::InvalidConfig`] for a zero chunk interval,
    /// [`RecordingError::AlreadyRecording`] if a recording is running,
    /// [`RecordingError::NoTracks`] if the streams are empty, or the encoder's
    /// error if it cannot be opened
    #[tracing::instrument(skip(self, streams, config), fields(streams = streams.len()))]
    pub fn start(
        &self,
        streams: &[MediaStream],
        config: Option<&RecordingConfig>,
    ) -> Result<String, RecordingError> {
        let config = config.unwrap_or(&self.defaults);
        config.validate()?;
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }

        let combined = combine_streams(streams);
        if combined.is_empty() {
            return Err(RecordingError::NoTracks);
        }
        let mime_type = select_mime_type(self.backend.as_ref(), &config.mime_preferences);
        let session = self.backend.open(&combined, &mime_type)?;
        let timer = spawn_chunk_timer(Arc::downgrade(&self.state), config.chunk_interval());

        tracing::info!(mime_type = %mime_type, tracks = combined.len(), "Recording started");
        *state = Some(ActiveRecording {
            session,
            chunks: Vec::new(),
            mime_type: mime_type.clone(),
            tracks: combined.tracks().iter().map(|t| t.info()).collect(),
            started_at: Utc::now(),
            started: Instant::now(),
            paused: false,
            timer,
        });
        Ok(mime_type)
    }

    /// Finalize the recording into one artifact
    ///
    /// The recorder is idle afterwards whether or not finalization succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`RecordingError::NoActiveRecording`] if nothing is running and
    /// [`RecordingError::Encoder`] if the encoder fails to finalize; buffered
    /// chunks are discarded in that case
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<RecordingArtifact, RecordingError> {
        let active = self
            .state
            .lock()
            .take()
            .ok_or(RecordingError::NoActiveRecording)?;
        active.timer.abort();

        let ActiveRecording {
            session,
            mut chunks,
            mime_type,
            tracks,
            started_at,
            started,
            ..
        } = active;

        match session.finish().await {
            Ok(Some(tail)) if !tail.is_empty() => chunks.push(tail),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, discarded = chunks.len(), "Recording finalization failed");
                return Err(e);
            }
        }

        let mut data = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in &chunks {
            data.extend_from_slice(chunk);
        }
        let artifact = RecordingArtifact {
            mime_type,
            data: data.freeze(),
            chunk_count: chunks.len(),
            tracks,
            started_at,
            duration: started.elapsed(),
        };
        tracing::info!(
            size = artifact.size(),
            chunks = artifact.chunk_count,
            "Recording finalized"
        );
        Ok(artifact)
    }

    /// Suspend chunk collection; no-op unless recording and not paused
    pub fn pause(&self) {
        if let Some(active) = self.state.lock().as_mut() {
            if !active.paused {
                active.paused = true;
                active.session.pause();
                tracing::debug!("Recording paused");
            }
        }
    }

    /// Resume chunk collection; no-op unless paused
    pub fn resume(&self) {
        if let Some(active) = self.state.lock().as_mut() {
            if active.paused {
                active.paused = false;
                active.session.resume();
                tracing::debug!("Recording resumed");
            }
        }
    }

    /// Drop the running recording without finalizing; safe to call repeatedly
    pub fn cleanup(&self) {
        if let Some(active) = self.state.lock().take() {
            active.timer.abort();
            tracing::debug!(discarded = active.chunks.len(), "Recording discarded");
        }
    }
}

impl Drop for StreamRecorder {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn spawn_chunk_timer(state: Weak<Mutex<Option<ActiveRecording>>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            let mut guard = state.lock();
            match guard.as_mut() {
                Some(active) => active.collect_chunk(),
                None => break,
            }
        }
    })
}
