//! Synchronization engine configuration.

use std::time::Duration;

/// Tuneable parameters for a [`SyncController`](crate::SyncController).
///
/// Use [`SyncConfig::new`] (or [`Default::default()`]) and override fields as
/// needed.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Market to subscribe to (e.g. "XBT/USD").
    pub market: String,
    /// Levels requested from the transport and retained per side.
    pub depth_limit: usize,
    /// Upper bound on how long `start`/`resync` wait for a snapshot.
    pub snapshot_timeout: Duration,
    /// Pause before an automatic resync attempt.
    pub resync_delay: Duration,
    /// Automatic resync attempts before the supervisor gives up and stops.
    pub max_resync_attempts: u32,
    /// Resync when a Synced book receives nothing for this long. `None` disables.
    pub stale_after: Option<Duration>,
    /// How often the supervisor checks for staleness.
    pub stale_check_interval: Duration,
}

impl SyncConfig {
    pub fn new(market: impl Into<String>) -> Self {
        Self {
            market: market.into(),
            ..Default::default()
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            market: String::new(),
            depth_limit: 10,
            snapshot_timeout: Duration::from_secs(10),
            resync_delay: Duration::from_secs(1),
            max_resync_attempts: 5,
            stale_after: None,
            stale_check_interval: Duration::from_secs(10),
        }
    }
}
