//! btleplug transport backend
//!
//! Enabled with the `btleplug` feature. Wraps the platform adapter and
//! peripheral types; each connected link runs one fan-out task that routes
//! the peripheral's notification stream to per-characteristic sinks.

use async_trait::async_trait;
use btleplug::api::{Central as _, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::abstraction::{Central, CharacteristicId, DiscoveredDevice, Link, NotificationSink};
use crate::error::{BridgeError, Result};

/// How long `open` scans for an address the adapter has not seen yet
const OPEN_SCAN_WINDOW: Duration = Duration::from_secs(5);
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn transport_error(e: btleplug::Error) -> BridgeError {
    BridgeError::Transport(e.to_string())
}

async fn describe(peripheral: &Peripheral) -> Result<DiscoveredDevice> {
    let properties = peripheral.properties().await.map_err(transport_error)?;
    Ok(match properties {
        Some(p) => DiscoveredDevice {
            name: p.local_name,
            address: p.address.to_string(),
            rssi: p.rssi,
        },
        None => DiscoveredDevice {
            name: None,
            address: peripheral.id().to_string(),
            rssi: None,
        },
    })
}

/// The first Bluetooth adapter on this host
pub struct BtleCentral {
    adapter: Adapter,
}

impl BtleCentral {
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(transport_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(transport_error)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::Transport("No Bluetooth adapter found".to_string()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }
        Ok(Self { adapter })
    }

    async fn find(&self, address: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await.map_err(transport_error)? {
            let seen = describe(&peripheral).await?;
            if seen.address.eq_ignore_ascii_case(address)
                || peripheral.id().to_string().eq_ignore_ascii_case(address)
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Central for BtleCentral {
    type Link = BtleLink;

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(transport_error)?;
        tokio::time::sleep(timeout).await;

        let peripherals = self.adapter.peripherals().await.map_err(transport_error);
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let mut found = Vec::new();
        for peripheral in peripherals? {
            found.push(describe(&peripheral).await?);
        }
        debug!("Discovered {} peripherals", found.len());
        Ok(found)
    }

    async fn open(&self, address: &str) -> Result<BtleLink> {
        if let Some(peripheral) = self.find(address).await? {
            return Ok(BtleLink::new(peripheral));
        }

        debug!("{} not cached, scanning for it", address);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(transport_error)?;

        let deadline = tokio::time::Instant::now() + OPEN_SCAN_WINDOW;
        let mut found = None;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(OPEN_POLL_INTERVAL).await;
            if let Some(peripheral) = self.find(address).await? {
                found = Some(peripheral);
                break;
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        found
            .map(BtleLink::new)
            .ok_or_else(|| BridgeError::DeviceNotFound(address.to_string()))
    }
}

type SinkMap = HashMap<Uuid, (CharacteristicId, NotificationSink)>;

/// Link to one platform peripheral
pub struct BtleLink {
    peripheral: Peripheral,
    sinks: Arc<Mutex<SinkMap>>,
    fan_out: Mutex<Option<JoinHandle<()>>>,
}

impl BtleLink {
    fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            sinks: Arc::new(Mutex::new(HashMap::new())),
            fan_out: Mutex::new(None),
        }
    }

    fn characteristic(&self, id: &CharacteristicId) -> Result<btleplug::api::Characteristic> {
        let uuid = Uuid::parse_str(id.as_str())
            .map_err(|e| BridgeError::Transport(format!("{} is not a UUID: {}", id, e)))?;
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BridgeError::Transport(format!("Characteristic {} not found", id)))
    }

    async fn start_fan_out(&self) -> Result<()> {
        let mut stream = self.peripheral.notifications().await.map_err(transport_error)?;
        let sinks = self.sinks.clone();

        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                // Clone the route out so the sink runs without the map locked
                let route = sinks.lock().get(&notification.uuid).cloned();
                match route {
                    Some((id, sink)) => sink(&id, &notification.value),
                    None => debug!("Unrouted notification from {}", notification.uuid),
                }
            }
            debug!("Notification stream ended");
        });

        if let Some(previous) = self.fan_out.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl Link for BtleLink {
    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await.map_err(transport_error)?;
        self.peripheral
            .discover_services()
            .await
            .map_err(transport_error)?;
        debug!(
            "Discovered {} characteristics",
            self.peripheral.characteristics().len()
        );
        self.start_fan_out().await
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.fan_out.lock().take() {
            task.abort();
        }
        self.sinks.lock().clear();
        self.peripheral.disconnect().await.map_err(transport_error)
    }

    async fn write_characteristic(
        &self,
        id: &CharacteristicId,
        data: &[u8],
        wait_for_response: bool,
    ) -> Result<()> {
        let characteristic = self.characteristic(id)?;
        let write_type = if wait_for_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(transport_error)
    }

    async fn read_characteristic(&self, id: &CharacteristicId) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(id)?;
        self.peripheral
            .read(&characteristic)
            .await
            .map_err(transport_error)
    }

    async fn start_notify(&self, id: &CharacteristicId, sink: NotificationSink) -> Result<()> {
        let characteristic = self.characteristic(id)?;
        self.sinks
            .lock()
            .insert(characteristic.uuid, (id.clone(), sink));

        if let Err(e) = self.peripheral.subscribe(&characteristic).await {
            self.sinks.lock().remove(&characteristic.uuid);
            return Err(transport_error(e));
        }
        Ok(())
    }

    async fn stop_notify(&self, id: &CharacteristicId) -> Result<()> {
        let characteristic = self.characteristic(id)?;
        self.sinks.lock().remove(&characteristic.uuid);
        self.peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(transport_error)
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        if let Some(task) = self.fan_out.get_mut().take() {
            task.abort();
        }
    }
}
