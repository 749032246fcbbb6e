//! Transport abstraction layer for the bridge
//!
//! Defines the boundary with the underlying asynchronous BLE stack: how a
//! central discovers and opens peripherals, and what a link to one
//! peripheral must support.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Normalized GATT characteristic key (trimmed, lower-cased)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId(String);

impl CharacteristicId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CharacteristicId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for CharacteristicId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Delivery path for characteristic notifications.
///
/// Invoked by the transport for every notification on a characteristic
/// that has been started with [`Link::start_notify`].
pub type NotificationSink = Arc<dyn Fn(&CharacteristicId, &[u8]) + Send + Sync>;

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Platform address (MAC, or a UUID on macOS)
    pub address: String,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.address
        )?;
        if let Some(rssi) = self.rssi {
            write!(f, " {} dBm", rssi)?;
        }
        Ok(())
    }
}

/// Discovery and link creation: the adapter side of the BLE stack
#[async_trait]
pub trait Central: Send + Sync + 'static {
    type Link: Link;

    /// Scan for `timeout` and report every peripheral seen
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>>;

    /// Create an unconnected link to the peripheral at `address`
    async fn open(&self, address: &str) -> Result<Self::Link>;
}

/// Operations on one peripheral connection.
///
/// Implementations may assume calls on one link never overlap.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Write `data`; with `wait_for_response` the future resolves on acknowledgement
    async fn write_characteristic(
        &self,
        id: &CharacteristicId,
        data: &[u8],
        wait_for_response: bool,
    ) -> Result<()>;

    async fn read_characteristic(&self, id: &CharacteristicId) -> Result<Vec<u8>>;

    /// Begin notification delivery for `id` into `sink`
    async fn start_notify(&self, id: &CharacteristicId, sink: NotificationSink) -> Result<()>;

    async fn stop_notify(&self, id: &CharacteristicId) -> Result<()>;
}

/// Record of one call across the transport boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportCall {
    Connect,
    Disconnect,
    Write {
        id: CharacteristicId,
        data: Vec<u8>,
        wait_for_response: bool,
    },
    Read { id: CharacteristicId },
    StartNotify { id: CharacteristicId },
    StopNotify { id: CharacteristicId },
}

impl fmt::Display for TransportCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportCall::Connect => write!(f, "Connect"),
            TransportCall::Disconnect => write!(f, "Disconnect"),
            TransportCall::Write {
                id,
                data,
                wait_for_response,
            } => write!(
                f,
                "Write {{ id: {}, data_len: {}, wait_for_response: {} }}",
                id,
                data.len(),
                wait_for_response
            ),
            TransportCall::Read { id } => write!(f, "Read {{ id: {} }}", id),
            TransportCall::StartNotify { id } => write!(f, "StartNotify {{ id: {} }}", id),
            TransportCall::StopNotify { id } => write!(f, "StopNotify {{ id: {} }}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_id_normalized() {
        let upper = CharacteristicId::new("00001560-1212-EFDE-1523-785FEABCD123");
        let lower = CharacteristicId::new("00001560-1212-efde-1523-785feabcd123");
        assert_eq!(upper, lower);
        assert_eq!(upper.as_str(), "00001560-1212-efde-1523-785feabcd123");
    }

    #[test]
    fn test_characteristic_id_trims() {
        assert_eq!(CharacteristicId::from("  ABC "), CharacteristicId::from("abc"));
    }

    #[test]
    fn test_discovered_device_display() {
        let device = DiscoveredDevice {
            name: Some("LPF2 Smart Hub".to_string()),
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            rssi: Some(-60),
        };
        assert_eq!(device.to_string(), "LPF2 Smart Hub (AA:BB:CC:DD:EE:FF) -60 dBm");

        let anonymous = DiscoveredDevice {
            name: None,
            address: "11:22:33:44:55:66".to_string(),
            rssi: None,
        };
        assert_eq!(anonymous.to_string(), "<unnamed> (11:22:33:44:55:66)");
    }

    #[test]
    fn test_transport_call_display() {
        let call = TransportCall::Write {
            id: CharacteristicId::new("abc"),
            data: vec![1, 2, 3],
            wait_for_response: true,
        };
        let display = call.to_string();
        assert!(display.contains("Write"));
        assert!(display.contains("data_len: 3"));
    }
}
