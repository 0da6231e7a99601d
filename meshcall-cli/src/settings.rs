//! Configuration loading
//!
//! The effective [`MeshConfig`] is built in three layers: defaults, an
//! optional JSON file, then command-line flags or `MESHCALL_*` variables.

use anyhow::{Context, Result};
use clap::Args;
use directories::ProjectDirs;
use meshcall_core::config::IceServerConfig;
use meshcall_core::prelude::*;
use std::path::{Path, PathBuf};

/// File name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "meshcall.json";

/// Per-field overrides applied on top of the config file
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Quality sampling interval in milliseconds
    #[arg(long, env = "MESHCALL_MONITOR_INTERVAL_MS", global = true)]
    pub monitor_interval_ms: Option<u64>,

    /// Recording chunk length in milliseconds
    #[arg(long, env = "MESHCALL_CHUNK_INTERVAL_MS", global = true)]
    pub chunk_interval_ms: Option<u64>,

    /// Single STUN server replacing the configured ICE servers
    #[arg(long, env = "MESHCALL_STUN", global = true)]
    pub stun: Option<String>,

    /// Capture the microphone only
    #[arg(long, env = "MESHCALL_AUDIO_ONLY", global = true)]
    pub audio_only: bool,

    /// Do not broadcast USER_JOINED after subscribing
    #[arg(long, env = "MESHCALL_NO_ANNOUNCE", global = true)]
    pub no_announce: bool,
}

impl Overrides {
    /// Apply every set override to `config`
    pub fn apply(&self, config: &mut MeshConfig) {
        if let Some(ms) = self.monitor_interval_ms {
            config.monitor.interval_ms = ms;
        }
        if let Some(ms) = self.chunk_interval_ms {
            config.recording.chunk_interval_ms = ms;
        }
        if let Some(url) = &self.stun {
            config.ice_servers = vec![IceServerConfig::stun(url.clone())];
        }
        if self.audio_only {
            config.constraints = MediaConstraints::audio_only();
        }
        if self.no_announce {
            config.announce_presence = false;
        }
    }
}

/// Loaded configuration and where it came from
#[derive(Debug, Clone)]
pub struct Settings {
    /// Effective engine configuration
    pub mesh: MeshConfig,
    /// File the configuration was read from, if any
    pub source: Option<PathBuf>,
}

/// `meshcall.json` in the platform config directory
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "meshcall", "meshcall")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Resolve the effective configuration
///
/// An explicit path must exist. The default location is optional and
/// silently skipped when absent.
///
/// # Errors
///
/// Returns an error if a file cannot be read or parsed, or if the result
/// fails validation
pub fn load(explicit: Option<&Path>, overrides: &Overrides) -> Result<Settings> {
    let source = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|path| path.is_file()),
    };

    let mut mesh = match &source {
        Some(path) => read_file(path)?,
        None => MeshConfig::default(),
    };
    overrides.apply(&mut mesh);
    mesh.validate().context("invalid configuration")?;

    Ok(Settings { mesh, source })
}

fn read_file(path: &Path) -> Result<MeshConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded configuration file");
    Ok(config)
}
