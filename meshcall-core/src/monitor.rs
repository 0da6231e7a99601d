//! Network quality sampling
//!
//! One periodic task per monitored link reads transport counters, derives
//! loss rate and bandwidth, classifies the link and publishes a
//! [`NetworkSample`] on a broadcast channel. Only the previous byte counter
//! is kept between ticks.

use crate::config::{ConfigError, MonitorConfig};
use crate::identity::UserId;
use crate::link::{LinkHandle, LinkStats};
use crate::types::{NetworkQuality, NetworkSample};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const SAMPLE_CHANNEL_CAPACITY: usize = 256;

/// Classify a link from its loss rate and round-trip time
///
/// The first matching row wins:
///
/// | condition                      | quality        |
/// |--------------------------------|----------------|
/// | loss >= 0.50                   | disconnected   |
/// | loss < 0.02 and rtt < 150 ms   | excellent      |
/// | loss < 0.05 and rtt < 300 ms   | good           |
/// | loss < 0.10 and rtt < 500 ms   | fair           |
/// | otherwise                      | poor           |
#[must_use]
pub fn classify(packet_loss_rate: f64, round_trip_time_ms: f64) -> NetworkQuality {
    if packet_loss_rate >= 0.50 {
        NetworkQuality::Disconnected
    } else if packet_loss_rate < 0.02 && round_trip_time_ms < 150.0 {
        NetworkQuality::Excellent
    } else if packet_loss_rate < 0.05 && round_trip_time_ms < 300.0 {
        NetworkQuality::Good
    } else if packet_loss_rate < 0.10 && round_trip_time_ms < 500.0 {
        NetworkQuality::Fair
    } else {
        NetworkQuality::Poor
    }
}

/// `lost / (lost + received)`, 0 when nothing was counted
#[must_use]
pub fn packet_loss_rate(packets_lost: u64, packets_received: u64) -> f64 {
    let total = packets_lost.saturating_add(packets_received);
    if total == 0 {
        0.0
    } else {
        packets_lost as f64 / total as f64
    }
}

/// Byte counter remembered between ticks
#[derive(Debug, Clone, Copy)]
struct ByteMark {
    bytes: u64,
    at: Instant,
}

/// Inbound kbit/s since the previous mark; 0 without one or after a reset
fn bandwidth_kbps(previous: Option<ByteMark>, current: ByteMark) -> f64 {
    let Some(prev) = previous else {
        return 0.0;
    };
    if current.bytes < prev.bytes {
        return 0.0;
    }
    let elapsed = current.at.saturating_duration_since(prev.at).as_secs_f64();
    if elapsed <= 0.0 {
        return 0.0;
    }
    ((current.bytes - prev.bytes) as f64 * 8.0) / elapsed / 1000.0
}

fn build_sample(user_id: &UserId, stats: &LinkStats, bandwidth_estimate: f64) -> NetworkSample {
    let loss = packet_loss_rate(stats.packets_lost, stats.packets_received);
    let rtt = stats.round_trip_time_ms.unwrap_or(0.0);
    NetworkSample {
        user_id: user_id.clone(),
        quality: classify(loss, rtt),
        packets_lost: stats.packets_lost,
        packets_received: stats.packets_received,
        packet_loss_rate: loss,
        jitter: stats.jitter_ms,
        bandwidth_estimate,
        round_trip_time_ms: rtt,
        sampled_at: Utc::now(),
    }
}

/// Periodic per-link quality sampler
#[derive(Debug)]
pub struct NetworkQualityMonitor {
    config: MonitorConfig,
    loops: Arc<Mutex<HashMap<UserId, JoinHandle<()>>>>,
    sample_sender: broadcast::Sender<NetworkSample>,
}

impl NetworkQualityMonitor {
    /// Create a monitor; nothing is sampled until [`start_monitoring`](Self::start_monitoring)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a zero sampling interval
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (sample_sender, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            loops: Arc::new(Mutex::new(HashMap::new())),
            sample_sender,
        })
    }

    /// Receive every sample produced from now on
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkSample> {
        self.sample_sender.subscribe()
    }

    /// Start sampling a link, replacing any loop already running for the user
    ///
    /// Must be called from within a tokio runtime.
    #[tracing::instrument(skip(self, link), fields(peer = %user_id))]
    pub fn start_monitoring(&self, user_id: UserId, link: LinkHandle) {
        let interval = self.config.interval();
        let sender = self.sample_sender.clone();
        let task_user = user_id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut previous: Option<ByteMark> = None;

            loop {
                ticker.tick().await;
                let stats = match link.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        tracing::debug!(peer = %task_user, error = %e, "Stats read failed, skipping tick");
                        continue;
                    }
                };
                let mark = ByteMark {
                    bytes: stats.bytes_received,
                    at: Instant::now(),
                };
                let sample = build_sample(&task_user, &stats, bandwidth_kbps(previous, mark));
                previous = Some(mark);

                tracing::trace!(
                    peer = %task_user,
                    quality = %sample.quality,
                    loss = sample.packet_loss_rate,
                    rtt_ms = sample.round_trip_time_ms,
                    "Quality sample"
                );
                // No subscribers is fine
                let _ = sender.send(sample);
            }
        });

        if let Some(previous) = self.loops.lock().insert(user_id, handle) {
            previous.abort();
            tracing::debug!("Replaced existing monitoring loop");
        } else {
            tracing::debug!("Started monitoring");
        }
    }

    /// Stop sampling one link; returns whether a loop was running
    pub fn stop_monitoring(&self, user_id: &UserId) -> bool {
        match self.loops.lock().remove(user_id) {
            Some(handle) => {
                handle.abort();
                tracing::debug!(peer = %user_id, "Stopped monitoring");
                true
            }
            None => false,
        }
    }

    /// Stop every loop; safe to call repeatedly
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.loops.lock().drain().collect();
        for (_, handle) in &drained {
            handle.abort();
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Stopped all monitoring loops");
        }
    }

    /// Whether a loop is running for the user
    pub fn is_monitoring(&self, user_id: &UserId) -> bool {
        self.loops.lock().contains_key(user_id)
    }

    /// Users with a running loop, sorted
    pub fn monitored_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.loops.lock().keys().cloned().collect();
        users.sort();
        users
    }
}

impl Drop for NetworkQualityMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
