//! Engine configuration

use crate::channel::OverflowPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration.
///
/// Everything has a default; a config file only needs to name what it
/// overrides:
///
/// ```toml
/// capacity = 8192
/// overflow = "drop-oldest"
///
/// [device]
/// vendor_id = 0x16d0
/// product_id = 0x0af3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Inbound channel capacity in bytes. Must be greater than zero.
    #[serde(default = "EngineConfig::default_capacity")]
    pub capacity: u32,
    /// Overflow policy when the channel is full (`block` by default).
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

/// Which device and endpoint pair to open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "DeviceSettings::default_product_id")]
    pub product_id: u16,
    /// Bulk IN endpoint address (bit 7 set).
    #[serde(default = "DeviceSettings::default_in_endpoint")]
    pub in_endpoint: u8,
    /// Bulk OUT endpoint address (bit 7 clear).
    #[serde(default = "DeviceSettings::default_out_endpoint")]
    pub out_endpoint: u8,
    /// Interface to claim.
    #[serde(default)]
    pub interface: u8,
}

/// Transfer tuning for the read and write paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bytes requested per device read (one bulk packet by default).
    #[serde(default = "TransferSettings::default_read_chunk")]
    pub read_chunk: u32,
    /// Device read timeout. Bounds shutdown latency: the dispatcher notices
    /// the stop signal after at most one of these.
    #[serde(default = "TransferSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Device write timeout.
    #[serde(default = "TransferSettings::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            overflow: OverflowPolicy::default(),
            device: DeviceSettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            in_endpoint: Self::default_in_endpoint(),
            out_endpoint: Self::default_out_endpoint(),
            interface: 0,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            read_chunk: Self::default_read_chunk(),
            read_timeout_ms: Self::default_read_timeout_ms(),
            write_timeout_ms: Self::default_write_timeout_ms(),
        }
    }
}

impl DeviceSettings {
    fn default_vendor_id() -> u16 {
        0x16d0
    }

    fn default_product_id() -> u16 {
        0x0af3
    }

    fn default_in_endpoint() -> u8 {
        0x83
    }

    fn default_out_endpoint() -> u8 {
        0x02
    }
}

impl TransferSettings {
    fn default_read_chunk() -> u32 {
        64
    }

    fn default_read_timeout_ms() -> u64 {
        100
    }

    fn default_write_timeout_ms() -> u64 {
        2000
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl EngineConfig {
    fn default_capacity() -> u32 {
        4096
    }

    /// Stock configuration with the given channel capacity.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Load configuration from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;

        config.validate()?;

        tracing::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the default path, falling back to defaults if absent or
    /// unreadable.
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("failed to load config: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// Default configuration file path.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-bridge").join("engine.toml")
        } else {
            PathBuf::from(".config/usb-bridge/engine.toml")
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidCapacity);
        }

        if self.transfer.read_chunk == 0 {
            return Err(Error::Config("read_chunk must be greater than zero".into()));
        }

        if self.device.in_endpoint & 0x80 == 0 {
            return Err(Error::Config(format!(
                "in_endpoint {:#04x} is not an IN endpoint (direction bit clear)",
                self.device.in_endpoint
            )));
        }

        if self.device.out_endpoint & 0x80 != 0 {
            return Err(Error::Config(format!(
                "out_endpoint {:#04x} is not an OUT endpoint (direction bit set)",
                self.device.out_endpoint
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.overflow, OverflowPolicy::Block);
        assert_eq!(config.device.vendor_id, 0x16d0);
        assert_eq!(config.device.product_id, 0x0af3);
        assert_eq!(config.device.in_endpoint, 0x83);
        assert_eq!(config.device.out_endpoint, 0x02);
        assert_eq!(config.transfer.read_chunk, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_invalid() {
        let config = EngineConfig::with_capacity(0);
        assert!(matches!(config.validate(), Err(Error::InvalidCapacity)));
    }

    #[test]
    fn test_endpoint_direction_validation() {
        let mut config = EngineConfig::default();
        config.device.in_endpoint = 0x03;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default();
        config.device.out_endpoint = 0x82;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_read_chunk_invalid() {
        let mut config = EngineConfig::default();
        config.transfer.read_chunk = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let mut config = EngineConfig::with_capacity(128);
        config.overflow = OverflowPolicy::DropOldest;

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.capacity, 128);
        assert_eq!(parsed.overflow, OverflowPolicy::DropOldest);
        assert_eq!(parsed.device.vendor_id, config.device.vendor_id);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: EngineConfig = toml::from_str("capacity = 256").unwrap();
        assert_eq!(parsed.capacity, 256);
        assert_eq!(parsed.overflow, OverflowPolicy::Block);
        assert_eq!(parsed.transfer.read_timeout_ms, 100);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "capacity = 512\noverflow = \"drop-oldest\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.capacity, 512);
        assert_eq!(config.overflow, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "capacity = 0\n").unwrap();

        assert!(matches!(
            EngineConfig::load(&path),
            Err(Error::InvalidCapacity)
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(EngineConfig::load(&path), Err(Error::Config(_))));
    }
}
