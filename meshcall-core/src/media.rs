//! Media track and stream model
//!
//! Tracks are produced by the capture layer (local) or by a peer link
//! (remote). The engine only moves them between links, combines them for
//! recording and stops them; it never reads media samples. A track may carry
//! an opaque native handle that the link backend understands (for the
//! `webrtc` backend an `Arc<dyn TrackLocal + Send + Sync>`).

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio samples
    Audio,
    /// Video frames
    Video,
}

/// A single media track
///
/// Clones share the ended state, so stopping any clone ends them all.
#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    ended: Arc<watch::Sender<bool>>,
    native: Option<Arc<dyn Any + Send + Sync>>,
}

impl MediaTrack {
    /// Create a live track with a random id
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, label)
    }

    /// Create a live track with a known id
    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            ended: Arc::new(ended),
            native: None,
        }
    }

    /// Attach a backend-specific handle
    #[must_use]
    pub fn with_native<T: Any + Send + Sync>(mut self, handle: T) -> Self {
        self.native = Some(Arc::new(handle));
        self
    }

    /// Backend-specific handle, if one of type `T` is attached
    pub fn native<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.native.as_ref()?.downcast_ref::<T>()
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Human-readable source label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether this is a video track
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    /// Whether this is an audio track
    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }

    /// Stop the track and release its source
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    /// Whether the track has ended
    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Wait until the track ends, either through [`stop`](Self::stop) or
    /// because the platform terminated the source
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        // The sender lives as long as `self`, so this only returns once ended.
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Serializable description of this track
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id.clone(),
            kind: self.kind,
            label: self.label.clone(),
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MediaTrack {}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("ended", &self.is_ended())
            .field("native", &self.native.is_some())
            .finish()
    }
}

/// Serializable track description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Track id
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
    /// Source label
    pub label: String,
}

/// An ordered group of tracks from one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Create an empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Create a stream from tracks
    pub fn with_tracks(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks in insertion order
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Add a track unless one with the same id is present
    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    /// Video tracks in insertion order
    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> + '_ {
        self.tracks.iter().filter(|t| t.is_video())
    }

    /// Audio tracks in insertion order
    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> + '_ {
        self.tracks.iter().filter(|t| t.is_audio())
    }

    /// First video track, if any
    pub fn first_video(&self) -> Option<&MediaTrack> {
        self.video_tracks().next()
    }

    /// Whether any track is still live
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_ended())
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Number of tracks
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Whether the stream has no tracks
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_track_stop_is_shared_between_clones() {
        let track = MediaTrack::new(TrackKind::Video, "camera");
        let clone = track.clone();
        assert!(!clone.is_ended());
        track.stop();
        assert!(clone.is_ended());
        track.stop();
        assert!(track.is_ended());
    }

    #[tokio::test]
    async fn test_track_ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, "screen");
        let waiter = track.clone();
        let handle = tokio::spawn(async move { waiter.ended().await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        track.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_native_handle_downcast() {
        let track = MediaTrack::new(TrackKind::Audio, "mic").with_native(42u32);
        assert_eq!(track.native::<u32>(), Some(&42));
        assert!(track.native::<String>().is_none());
    }

    #[test]
    fn test_stream_track_views() {
        let stream = MediaStream::with_tracks(
            "local",
            vec![
                MediaTrack::with_id("a1", TrackKind::Audio, "mic"),
                MediaTrack::with_id("v1", TrackKind::Video, "camera"),
                MediaTrack::with_id("v2", TrackKind::Video, "camera-2"),
            ],
        );
        let videos: Vec<_> = stream.video_tracks().map(MediaTrack::id).collect();
        let audios: Vec<_> = stream.audio_tracks().map(MediaTrack::id).collect();
        assert_eq!(videos, vec!["v1", "v2"]);
        assert_eq!(audios, vec!["a1"]);
        assert_eq!(stream.first_video().map(MediaTrack::id), Some("v1"));
        assert!(stream.is_active());
        stream.stop_all();
        assert!(!stream.is_active());
    }

    #[test]
    fn test_stream_add_track_dedups_by_id() {
        let mut stream = MediaStream::new("remote");
        let track = MediaTrack::with_id("t", TrackKind::Audio, "mic");
        stream.add_track(track.clone());
        stream.add_track(track);
        assert_eq!(stream.len(), 1);
    }
}
