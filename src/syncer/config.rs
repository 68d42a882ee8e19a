//! Syncer configuration.

use crate::error::{Result, SyncError};
use crate::history::DEFAULT_HISTORY_CAPACITY;
use serde::Deserialize;
use std::time::Duration;

/// Records per live batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Interval between heartbeats.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Messages buffered per follower before it is treated as a straggler.
pub const DEFAULT_FOLLOWER_QUEUE_SIZE: usize = 1024;

/// Syncer configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncerConfig {
    /// Records kept in the history buffer for catch-up.
    /// Default: 10000
    pub history_capacity: usize,

    /// Max records in one live batch, counting the one that woke the engine.
    /// Default: 100
    pub max_batch_size: usize,

    /// Heartbeat interval in milliseconds.
    /// Default: 10000
    pub keep_alive_interval_ms: u64,

    /// Bounded outbound queue per follower.
    /// Default: 1024
    pub follower_queue_size: usize,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL.as_millis() as u64,
            follower_queue_size: DEFAULT_FOLLOWER_QUEUE_SIZE,
        }
    }
}

impl SyncerConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("history_capacity", self.history_capacity as u64),
            ("max_batch_size", self.max_batch_size as u64),
            ("keep_alive_interval_ms", self.keep_alive_interval_ms),
            ("follower_queue_size", self.follower_queue_size as u64),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        match zero {
            Some((field, _)) => Err(SyncError::InvalidConfig(format!(
                "{} must be greater than zero",
                field
            ))),
            None => Ok(()),
        }
    }
}
