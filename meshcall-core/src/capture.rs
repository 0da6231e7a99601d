//! Capture layer seam
//!
//! Camera, microphone and display capture are platform capabilities outside
//! the engine. The engine asks a [`CaptureDevice`] for ready-made streams and
//! maps every platform failure onto a [`DeviceError`].

use crate::media::MediaStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capture failures; always fatal to the operation that requested capture
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The user or platform denied access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The device is in use by another application
    #[error("Device busy: {0}")]
    Busy(String),

    /// No matching device exists
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The platform cannot capture this kind of media
    #[error("Capture not supported: {0}")]
    Unsupported(String),
}

/// Media constraints for local capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Source of local media streams
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire camera and/or microphone
    ///
    /// # Errors
    ///
    /// Returns a [`DeviceError`] when access is denied, the device is busy or
    /// absent, or the constraints cannot be satisfied
    async fn acquire_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, DeviceError>;

    /// Acquire the screen, optionally with system audio
    ///
    /// # Errors
    ///
    /// Returns a [`DeviceError`] when the user cancels the picker or display
    /// capture is unavailable
    async fn acquire_display_media(&self, with_audio: bool) -> Result<MediaStream, DeviceError>;
}
