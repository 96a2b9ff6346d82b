//! Tunables for the VK transport
//!
//! The retry and heartbeat values are calibrated to the card's timing. The
//! card watchdog fires after 20s with 2s of jitter, so the host declares the
//! link dead only after 27s without uptime progress.

use crate::error::{Result, VkError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VkConfig {
    /// Message queue settings
    #[serde(default)]
    pub msgq: MsgqConfig,

    /// Heartbeat monitor settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Reset sequence settings
    #[serde(default)]
    pub reset: ResetConfig,
}

/// Message queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgqConfig {
    /// Enqueue attempts on a full ring before giving up
    #[serde(default = "default_enq_retry")]
    pub enq_retry: u32,

    /// Sleep between enqueue attempts
    #[serde(default = "default_enq_retry_delay_ms")]
    pub enq_retry_delay_ms: u64,

    /// Bytes of scatter-gather list that may be carried inband (0 = off)
    #[serde(default)]
    pub ib_sgl_size: usize,

    /// Occupancy samples per statistics report (0 = off)
    #[serde(default)]
    pub qstats_interval: u32,
}

impl Default for MsgqConfig {
    fn default() -> Self {
        Self {
            enq_retry: default_enq_retry(),
            enq_retry_delay_ms: default_enq_retry_delay_ms(),
            ib_sgl_size: 0,
            qstats_interval: 0,
        }
    }
}

impl MsgqConfig {
    pub fn enq_retry_delay(&self) -> Duration {
        Duration::from_millis(self.enq_retry_delay_ms)
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Poll interval in seconds
    #[serde(default = "default_hb_interval")]
    pub interval_secs: u64,

    /// Ticks without uptime progress tolerated before the link is declared dead
    #[serde(default = "default_hb_lost_max")]
    pub lost_max: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_hb_interval(),
            lost_max: default_hb_lost_max(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Reset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Lower bound for the caller-supplied grace period
    #[serde(default = "default_min_grace")]
    pub min_grace_secs: u64,

    /// Wait after pressing the reset doorbell
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            min_grace_secs: default_min_grace(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl ResetConfig {
    /// Clamp a requested grace period to the configured minimum
    pub fn grace(&self, requested: Duration) -> Duration {
        requested.max(Duration::from_secs(self.min_grace_secs))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

// Default value functions
fn default_enq_retry() -> u32 {
    10
}

fn default_enq_retry_delay_ms() -> u64 {
    50
}

fn default_hb_interval() -> u64 {
    3
}

fn default_hb_lost_max() -> u32 {
    27 / default_hb_interval() as u32
}

fn default_min_grace() -> u64 {
    2
}

fn default_settle_ms() -> u64 {
    100
}

impl VkConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VkError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VkConfig::default();
        assert_eq!(config.msgq.enq_retry, 10);
        assert_eq!(config.msgq.enq_retry_delay(), Duration::from_millis(50));
        assert_eq!(config.heartbeat.lost_max, 9);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_toml() {
        let config = VkConfig::from_toml(
            r#"
            [msgq]
            enq_retry = 3

            [reset]
            min_grace_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.msgq.enq_retry, 3);
        assert_eq!(config.msgq.enq_retry_delay_ms, 50);
        assert_eq!(config.heartbeat.lost_max, 9);
        assert_eq!(config.reset.grace(Duration::from_secs(1)), Duration::from_secs(5));
        assert_eq!(config.reset.grace(Duration::from_secs(8)), Duration::from_secs(8));
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            VkConfig::from_toml("[msgq]\nenq_retry = \"many\""),
            Err(VkError::Config(_))
        ));
    }
}
