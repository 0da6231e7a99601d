//! Outbound track swapping for screen sharing
//!
//! Starting a share acquires a display stream and replaces the outbound
//! video track (and, when the display stream carries one, the outbound audio
//! track) on every link without renegotiation. Stopping restores the saved
//! originals. Only one swap is ever active, so every link sends the same
//! video track.

use crate::capture::{CaptureDevice, DeviceError};
use crate::link::LinkHandle;
use crate::media::{MediaStream, MediaTrack};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Screen-share errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwapError {
    /// A share is already running
    #[error("Screen share already active")]
    AlreadySharing,

    /// Display capture failed
    #[error("Display capture failed: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Default)]
struct SwapState {
    screen: Option<MediaStream>,
    // Display capture in progress, not yet applied
    acquiring: bool,
    saved_video: Option<MediaTrack>,
    saved_audio: Option<MediaTrack>,
}

/// Swaps the local outbound tracks across a set of links
pub struct MediaTrackSwapper {
    capture: Arc<dyn CaptureDevice>,
    with_system_audio: bool,
    state: Mutex<SwapState>,
    // Serializes start/stop so a swap never interleaves with a restore
    op_lock: tokio::sync::Mutex<()>,
}

impl MediaTrackSwapper {
    /// Create a swapper that captures through `capture`
    pub fn new(capture: Arc<dyn CaptureDevice>, with_system_audio: bool) -> Self {
        Self {
            capture,
            with_system_audio,
            state: Mutex::new(SwapState::default()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether a share is running
    pub fn is_sharing(&self) -> bool {
        self.state.lock().screen.is_some()
    }

    /// Screen video track being sent, while sharing
    pub fn current_video_track(&self) -> Option<MediaTrack> {
        self.state
            .lock()
            .screen
            .as_ref()
            .and_then(|s| s.first_video().cloned())
    }

    /// Screen audio track being sent, while sharing with system audio
    pub fn current_audio_track(&self) -> Option<MediaTrack> {
        self.state
            .lock()
            .screen
            .as_ref()
            .and_then(|s| s.audio_tracks().next().cloned())
    }

    /// Start sharing the screen on every link
    ///
    /// Shorthand for [`acquire`](Self::acquire) followed by
    /// [`apply`](Self::apply).
    ///
    /// # Errors
    ///
    /// Returns [`SwapError::AlreadySharing`] on a second start and
    /// [`SwapError::Device`] if display capture fails; neither changes state
    pub async fn start(
        &self,
        links: &[LinkHandle],
        camera: Option<&MediaTrack>,
    ) -> Result<MediaTrack, SwapError> {
        let pending = self.acquire().await?;
        Ok(self.apply(pending, links, camera).await)
    }

    /// Acquire the display stream without touching any link
    ///
    /// The platform picker may stay open for a long time, so callers should
    /// not hold locks across this. While the returned share is pending any
    /// other start is rejected; dropping it unapplied releases the capture.
    ///
    /// # Errors
    ///
    /// Returns [`SwapError::AlreadySharing`] while a share is running or
    /// pending and [`SwapError::Device`] if display capture fails
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> Result<PendingShare<'_>, SwapError> {
        let flag = {
            let mut state = self.state.lock();
            if state.screen.is_some() || state.acquiring {
                return Err(SwapError::AlreadySharing);
            }
            state.acquiring = true;
            AcquiringFlag(self)
        };

        let screen = self
            .capture
            .acquire_display_media(self.with_system_audio)
            .await?;
        let Some(video) = screen.first_video().cloned() else {
            screen.stop_all();
            return Err(SwapError::Device(DeviceError::Unsupported(
                "display stream has no video track".to_string(),
            )));
        };
        Ok(PendingShare {
            screen,
            video,
            applied: false,
            _flag: flag,
        })
    }

    /// Send an acquired screen on every link
    ///
    /// `camera` is remembered as the track to restore when no link reports
    /// an outbound video track of its own. Returns the screen video track so
    /// the caller can watch for the platform ending it.
    #[tracing::instrument(skip_all, fields(links = links.len()))]
    pub async fn apply(
        &self,
        mut pending: PendingShare<'_>,
        links: &[LinkHandle],
        camera: Option<&MediaTrack>,
    ) -> MediaTrack {
        let _op = self.op_lock.lock().await;
        let video = pending.video.clone();
        let audio = pending.screen.audio_tracks().next().cloned();

        let mut saved_video = None;
        let mut saved_audio = None;
        for link in links {
            if let Some(previous) = replace_on(link, &video).await {
                saved_video.get_or_insert(previous);
            }
            if let Some(audio) = &audio {
                if let Some(previous) = replace_on(link, audio).await {
                    saved_audio.get_or_insert(previous);
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.saved_video = saved_video.or_else(|| camera.cloned());
            state.saved_audio = saved_audio;
            state.screen = Some(pending.screen.clone());
        }
        // Clears `acquiring` only after the screen is recorded as shared
        pending.applied = true;
        drop(pending);
        tracing::info!(track = video.id(), "Screen share started");
        video
    }

    /// Restore the saved tracks on every link and release the screen
    ///
    /// Returns `false` without doing anything when not sharing.
    #[tracing::instrument(skip(self, links), fields(links = links.len()))]
    pub async fn stop(&self, links: &[LinkHandle]) -> bool {
        let _op = self.op_lock.lock().await;
        let (screen, saved_video, saved_audio) = {
            let mut state = self.state.lock();
            let Some(screen) = state.screen.take() else {
                return false;
            };
            (screen, state.saved_video.take(), state.saved_audio.take())
        };

        for link in links {
            match &saved_video {
                Some(original) => {
                    replace_on(link, original).await;
                }
                None => tracing::debug!(
                    peer = %link.remote_user(),
                    "No original video track to restore"
                ),
            }
            if let Some(original) = &saved_audio {
                replace_on(link, original).await;
            }
        }

        screen.stop_all();
        tracing::info!("Screen share stopped");
        true
    }

    /// Stop sharing if a share is running; safe to call repeatedly
    pub async fn cleanup(&self, links: &[LinkHandle]) {
        self.stop(links).await;
    }
}

/// A display stream acquired by [`MediaTrackSwapper::acquire`] and not yet
/// sent on any link
pub struct PendingShare<'a> {
    screen: MediaStream,
    video: MediaTrack,
    applied: bool,
    _flag: AcquiringFlag<'a>,
}

impl PendingShare<'_> {
    /// Screen video track that [`MediaTrackSwapper::apply`] will send
    pub fn video_track(&self) -> &MediaTrack {
        &self.video
    }
}

impl Drop for PendingShare<'_> {
    fn drop(&mut self) {
        if !self.applied {
            tracing::debug!("Pending screen share dropped, releasing capture");
            self.screen.stop_all();
        }
    }
}

impl std::fmt::Debug for PendingShare<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingShare")
            .field("video", &self.video.id())
            .field("applied", &self.applied)
            .finish()
    }
}

// Clears the in-progress marker however acquisition ends
struct AcquiringFlag<'a>(&'a MediaTrackSwapper);

impl Drop for AcquiringFlag<'_> {
    fn drop(&mut self) {
        self.0.state.lock().acquiring = false;
    }
}

/// Replace one outbound track; a failure only affects this link
async fn replace_on(link: &LinkHandle, track: &MediaTrack) -> Option<MediaTrack> {
    match link.replace_outbound_track(track).await {
        Ok(previous) => previous,
        Err(e) => {
            tracing::warn!(
                peer = %link.remote_user(),
                kind = ?track.kind(),
                error = %e,
                "Track replacement failed, link keeps its current track"
            );
            None
        }
    }
}

impl std::fmt::Debug for MediaTrackSwapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MediaTrackSwapper")
            .field("sharing", &state.screen.is_some())
            .field(
                "saved_video",
                &state.saved_video.as_ref().map(MediaTrack::id),
            )
            .field("with_system_audio", &self.with_system_audio)
            .finish()
    }
}
