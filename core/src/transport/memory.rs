//! In-memory transport
//!
//! A simulated central and peripherals implementing the transport traits
//! without radio hardware. Every call across the boundary is recorded, and
//! notifications are injected with [`SimulatedPeripheral::notify`]. Used by
//! the test suites and the CLI demo.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::abstraction::{
    Central, CharacteristicId, DiscoveredDevice, Link, NotificationSink, TransportCall,
};
use crate::error::{BridgeError, Result};

#[derive(Default)]
struct PeripheralState {
    connected: bool,
    calls: Vec<TransportCall>,
    values: HashMap<CharacteristicId, Vec<u8>>,
    sinks: HashMap<CharacteristicId, NotificationSink>,
    announcements: HashMap<CharacteristicId, Vec<u8>>,
    fail_connect: Option<String>,
    fail_stop_notify: Option<String>,
    write_latency: Duration,
}

/// A scripted peripheral
pub struct SimulatedPeripheral {
    name: Option<String>,
    address: String,
    rssi: Option<i16>,
    state: Mutex<PeripheralState>,
}

impl SimulatedPeripheral {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
            rssi: None,
            state: Mutex::new(PeripheralState::default()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn advertisement(&self) -> DiscoveredDevice {
        DiscoveredDevice {
            name: self.name.clone(),
            address: self.address.clone(),
            rssi: self.rssi,
        }
    }

    /// Value returned by reads of `id`
    pub fn set_value(&self, id: impl Into<CharacteristicId>, value: &[u8]) {
        self.state.lock().values.insert(id.into(), value.to_vec());
    }

    /// Push `payload` on `id` shortly after notifications start for it
    pub fn announce_on_subscribe(&self, id: impl Into<CharacteristicId>, payload: &[u8]) {
        self.state
            .lock()
            .announcements
            .insert(id.into(), payload.to_vec());
    }

    /// Make the next connect attempt fail with `reason`
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.state.lock().fail_connect = Some(reason.into());
    }

    /// Make the next stop-notify request fail with `reason`, leaving notifications on
    pub fn fail_next_stop_notify(&self, reason: impl Into<String>) {
        self.state.lock().fail_stop_notify = Some(reason.into());
    }

    /// Delay before an acknowledged write resolves
    pub fn set_write_latency(&self, latency: Duration) {
        self.state.lock().write_latency = latency;
    }

    /// Deliver a notification. Returns false if nobody is subscribed to `id`.
    pub fn notify(&self, id: impl Into<CharacteristicId>, payload: &[u8]) -> bool {
        let id = id.into();
        // Clone the sink out so delivery runs without our lock held
        let sink = self.state.lock().sinks.get(&id).cloned();
        match sink {
            Some(sink) => {
                sink(&id, payload);
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_notifying(&self, id: impl Into<CharacteristicId>) -> bool {
        self.state.lock().sinks.contains_key(&id.into())
    }

    /// Every call made across the transport boundary, in order
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: TransportCall) {
        debug!("{} <- {}", self.address, call);
        self.state.lock().calls.push(call);
    }

    fn require_connected(&self) -> Result<()> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(BridgeError::Transport(format!("{} is not connected", self.address)))
        }
    }
}

/// Simulated adapter owning a set of peripherals
#[derive(Default)]
pub struct MemoryCentral {
    peripherals: RwLock<Vec<Arc<SimulatedPeripheral>>>,
}

impl MemoryCentral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peripheral` discoverable and connectable
    pub fn add(&self, peripheral: SimulatedPeripheral) -> Arc<SimulatedPeripheral> {
        let peripheral = Arc::new(peripheral);
        self.peripherals.write().push(peripheral.clone());
        peripheral
    }

    pub fn peripheral(&self, address: &str) -> Option<Arc<SimulatedPeripheral>> {
        self.peripherals
            .read()
            .iter()
            .find(|p| p.address.eq_ignore_ascii_case(address))
            .cloned()
    }
}

#[async_trait]
impl Central for MemoryCentral {
    type Link = MemoryLink;

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        tokio::time::sleep(timeout).await;
        Ok(self
            .peripherals
            .read()
            .iter()
            .map(|p| p.advertisement())
            .collect())
    }

    async fn open(&self, address: &str) -> Result<MemoryLink> {
        self.peripheral(address)
            .map(|peripheral| MemoryLink { peripheral })
            .ok_or_else(|| BridgeError::DeviceNotFound(address.to_string()))
    }
}

/// Link to a [`SimulatedPeripheral`]
pub struct MemoryLink {
    peripheral: Arc<SimulatedPeripheral>,
}

impl MemoryLink {
    pub fn peripheral(&self) -> &Arc<SimulatedPeripheral> {
        &self.peripheral
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn connect(&self) -> Result<()> {
        self.peripheral.record(TransportCall::Connect);
        let mut state = self.peripheral.state.lock();
        if let Some(reason) = state.fail_connect.take() {
            return Err(BridgeError::Transport(reason));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.record(TransportCall::Disconnect);
        let mut state = self.peripheral.state.lock();
        state.connected = false;
        state.sinks.clear();
        Ok(())
    }

    async fn write_characteristic(
        &self,
        id: &CharacteristicId,
        data: &[u8],
        wait_for_response: bool,
    ) -> Result<()> {
        self.peripheral.record(TransportCall::Write {
            id: id.clone(),
            data: data.to_vec(),
            wait_for_response,
        });
        self.peripheral.require_connected()?;

        let latency = self.peripheral.state.lock().write_latency;
        if wait_for_response && !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.peripheral
            .state
            .lock()
            .values
            .insert(id.clone(), data.to_vec());
        Ok(())
    }

    async fn read_characteristic(&self, id: &CharacteristicId) -> Result<Vec<u8>> {
        self.peripheral.record(TransportCall::Read { id: id.clone() });
        self.peripheral.require_connected()?;
        self.peripheral
            .state
            .lock()
            .values
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::Transport(format!("{} is not readable", id)))
    }

    async fn start_notify(&self, id: &CharacteristicId, sink: NotificationSink) -> Result<()> {
        self.peripheral
            .record(TransportCall::StartNotify { id: id.clone() });
        self.peripheral.require_connected()?;

        let announcement = {
            let mut state = self.peripheral.state.lock();
            state.sinks.insert(id.clone(), sink);
            state.announcements.get(id).cloned()
        };

        if let Some(payload) = announcement {
            let peripheral = self.peripheral.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                peripheral.notify(id, &payload);
            });
        }
        Ok(())
    }

    async fn stop_notify(&self, id: &CharacteristicId) -> Result<()> {
        self.peripheral
            .record(TransportCall::StopNotify { id: id.clone() });
        let mut state = self.peripheral.state.lock();
        if let Some(reason) = state.fail_stop_notify.take() {
            return Err(BridgeError::Transport(reason));
        }
        state.sinks.remove(id);
        Ok(())
    }
}
