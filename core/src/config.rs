/// Bridge configuration
///
/// Timeouts, buffer capacity and scan filtering for the adapter and the
/// devices it opens. Serializable so frontends can persist it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Default per-characteristic notification queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Advertised name of a LEGO WeDo 2.0 smart hub
pub const WEDO2_HUB_NAME: &str = "LPF2 Smart Hub";

/// Number of service announcements a WeDo 2.0 hub sends after subscription
pub const WEDO2_SERVICE_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Only consider devices advertising exactly this name when scanning
    pub device_name: Option<String>,

    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,

    /// Notification queue capacity per subscribed characteristic
    pub queue_capacity: usize,

    /// How long a read waits for a first notification, in milliseconds
    pub drain_timeout_ms: u64,

    /// Acknowledged-write timeout in milliseconds
    pub write_timeout_ms: u64,

    /// Default pump interval in milliseconds
    pub pump_interval_ms: u64,

    /// Multi-source readiness barrier settings
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Upper bound on a readiness wait in milliseconds
    pub timeout_ms: u64,

    /// Sources to wait for when a caller subscribes without naming a count
    pub default_sources: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            scan_timeout_ms: 10_000,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_timeout_ms: 100,
            write_timeout_ms: 30_000,
            pump_interval_ms: 1_000,
            readiness: ReadinessConfig::default(),
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            default_sources: None,
        }
    }
}

impl BridgeConfig {
    /// Preset for WeDo 2.0 hubs: filter by hub name and wait for all six
    /// service announcements before handing control back.
    pub fn hub_config() -> Self {
        Self {
            device_name: Some(WEDO2_HUB_NAME.to_string()),
            readiness: ReadinessConfig {
                default_sources: Some(WEDO2_SERVICE_COUNT),
                ..ReadinessConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if self.scan_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "scan_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.readiness.timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "readiness.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.readiness.default_sources == Some(0) {
            return Err(BridgeError::InvalidConfig(
                "readiness.default_sources must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.drain_timeout(), Duration::from_millis(100));
        assert_eq!(config.write_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_hub_config() {
        let config = BridgeConfig::hub_config();
        assert_eq!(config.device_name.as_deref(), Some("LPF2 Smart Hub"));
        assert_eq!(config.readiness.default_sources, Some(6));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = BridgeConfig {
            queue_capacity: 0,
            ..BridgeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_sources_rejected() {
        let mut config = BridgeConfig::default();
        config.readiness.default_sources = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"queue_capacity": 8, "readiness": {"default_sources": 2}}"#)
                .expect("Should parse");

        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.readiness.default_sources, Some(2));
        assert_eq!(config.readiness.timeout_ms, 10_000);
        assert_eq!(config.scan_timeout_ms, 10_000);
    }
}
