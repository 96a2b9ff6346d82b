//! Configuration for the vkd host agent

use anyhow::{Context, Result};
use libvk::VkConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VkdConfig {
    /// Card selection and agent settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Transport tunables
    #[serde(default)]
    pub driver: VkConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// PCI address of the card, e.g. `0000:01:00.0`
    #[serde(default = "default_pci_address")]
    pub pci_address: String,

    /// UIO node delivering the card's interrupts
    #[serde(default)]
    pub uio: Option<PathBuf>,

    /// Interval between queue sync attempts while the card is not ready
    #[serde(default = "default_sync_retry")]
    pub sync_retry_secs: u64,

    /// Default log filter
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            pci_address: default_pci_address(),
            uio: None,
            sync_retry_secs: default_sync_retry(),
            log_level: default_log_level(),
        }
    }
}

impl DeviceConfig {
    /// Sysfs directory of the card
    pub fn sysfs_dir(&self) -> PathBuf {
        Path::new("/sys/bus/pci/devices").join(&self.pci_address)
    }

    pub fn sync_retry(&self) -> Duration {
        Duration::from_secs(self.sync_retry_secs.max(1))
    }
}

fn default_pci_address() -> String {
    "0000:01:00.0".into()
}

fn default_sync_retry() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".into()
}

impl VkdConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = VkdConfig::load(Path::new("/nonexistent/vkd.toml")).unwrap();
        assert_eq!(config.device.pci_address, "0000:01:00.0");
        assert_eq!(config.device.sync_retry(), Duration::from_secs(1));
        assert_eq!(config.driver.heartbeat.lost_max, 9);
    }

    #[test]
    fn test_parse_sections() {
        let config: VkdConfig = toml::from_str(
            r#"
            [device]
            pci_address = "0000:65:00.0"
            uio = "/dev/uio0"
            log_level = "warn"

            [driver.msgq]
            ib_sgl_size = 1024

            [driver.heartbeat]
            interval_secs = 1
            "#,
        )
        .unwrap();

        assert_eq!(
            config.device.sysfs_dir(),
            PathBuf::from("/sys/bus/pci/devices/0000:65:00.0")
        );
        assert_eq!(config.device.uio, Some(PathBuf::from("/dev/uio0")));
        assert_eq!(config.device.log_level, "warn");
        assert_eq!(config.driver.msgq.ib_sgl_size, 1024);
        assert_eq!(config.driver.msgq.enq_retry, 10);
        assert_eq!(config.driver.heartbeat.interval_secs, 1);
        assert_eq!(config.driver.heartbeat.lost_max, 9);
    }
}
