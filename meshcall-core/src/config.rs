//! Engine configuration

use crate::capture::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the engine cannot run with
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// STUN/TURN server used by native links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    /// Server URLs (`stun:` / `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// A credential-less STUN server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Network quality sampling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Sampling interval in milliseconds
    pub interval_ms: u64,
}

impl MonitorConfig {
    /// Sampling interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a zero interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("monitor.intervalMs", self.interval_ms)
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_ms: 2_000 }
    }
}

/// Recording configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecordingConfig {
    /// Container/codec strings probed in order; the first supported wins
    pub mime_preferences: Vec<String>,
    /// Length of one buffered chunk in milliseconds
    pub chunk_interval_ms: u64,
}

impl RecordingConfig {
    /// Platform default used when no preference is supported
    pub const FALLBACK_MIME_TYPE: &'static str = "video/webm";

    /// Chunk length
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a zero chunk interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("recording.chunkIntervalMs", self.chunk_interval_ms)
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mime_preferences: vec![
                "video/webm;codecs=vp9,opus".to_string(),
                "video/webm;codecs=vp8,opus".to_string(),
                "video/webm".to_string(),
            ],
            chunk_interval_ms: 10_000,
        }
    }
}

/// Mesh configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    /// Servers handed to every native link
    pub ice_servers: Vec<IceServerConfig>,
    /// Local capture constraints
    pub constraints: MediaConstraints,
    /// Broadcast USER_JOINED after subscribing
    pub announce_presence: bool,
    /// Capture system audio along with the screen
    pub share_system_audio: bool,
    /// Capacity of the mesh event channel
    pub event_buffer: usize,
    /// Quality sampling
    pub monitor: MonitorConfig,
    /// Recording defaults
    pub recording: RecordingConfig,
}

impl MeshConfig {
    /// Check values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for zero intervals or buffers
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitor.validate()?;
        self.recording.validate()?;
        positive("eventBuffer", self.event_buffer as u64)?;
        if let Some(server) = self.ice_servers.iter().find(|s| s.urls.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "iceServers",
                reason: format!("server entry without urls: {server:?}"),
            });
        }
        Ok(())
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            constraints: MediaConstraints::video_call(),
            announce_presence: true,
            share_system_audio: false,
            event_buffer: 1000,
            monitor: MonitorConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}
