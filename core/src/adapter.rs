//! Adapter: discovery, connection and orderly teardown
//!
//! The adapter owns the set of currently connected devices. It holds only
//! weak references, so a device's lifetime belongs to whoever connected it;
//! the set exists so `stop()` can disconnect whatever is still up.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::device::{Device, HubDevice};
use crate::error::{BridgeError, Result};
use crate::executor::{BlockingExecutor, Waiter};
use crate::transport::{Central, DiscoveredDevice};

/// Extra time granted to a scan past its own timeout before giving up on it
const SCAN_GRACE: Duration = Duration::from_secs(2);

/// Devices currently connected through one adapter
#[derive(Default)]
pub struct ConnectedSet {
    devices: Mutex<HashMap<u64, Weak<dyn HubDevice>>>,
}

impl ConnectedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, key: u64, device: Weak<dyn HubDevice>) {
        self.devices.lock().insert(key, device);
    }

    pub(crate) fn remove(&self, key: u64) {
        self.devices.lock().remove(&key);
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Take every live member out of the set
    fn drain(&self) -> Vec<Arc<dyn HubDevice>> {
        let members: Vec<_> = self.devices.lock().drain().map(|(_, d)| d).collect();
        members.iter().filter_map(Weak::upgrade).collect()
    }

    fn live(&self) -> Vec<Arc<dyn HubDevice>> {
        self.devices
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

pub struct Adapter<C: Central> {
    central: C,
    executor: Arc<BlockingExecutor>,
    config: BridgeConfig,
    connected: Arc<ConnectedSet>,
}

impl<C: Central> Adapter<C> {
    /// Create an adapter with its own executor
    pub fn new(central: C, config: BridgeConfig) -> Result<Self> {
        let executor = Arc::new(BlockingExecutor::new()?);
        Self::with_executor(central, config, executor)
    }

    /// Create an adapter sharing an existing executor
    pub fn with_executor(
        central: C,
        config: BridgeConfig,
        executor: Arc<BlockingExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            central,
            executor,
            config,
            connected: Arc::new(ConnectedSet::new()),
        })
    }

    pub fn executor(&self) -> &Arc<BlockingExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn central(&self) -> &C {
        &self.central
    }

    /// A sleep capability for protocol clients
    pub fn waiter(&self) -> Arc<dyn Waiter> {
        self.executor.clone()
    }

    /// Keep background delivery running for `duration`
    pub fn pump(&self, duration: Duration) -> Result<()> {
        self.executor.pump(duration)
    }

    /// Discover nearby peripherals, keeping those matching the configured name.
    ///
    /// `timeout` defaults to the configured scan timeout.
    pub fn scan(&self, timeout: Option<Duration>) -> Result<Vec<DiscoveredDevice>> {
        let timeout = timeout.unwrap_or_else(|| self.config.scan_timeout());
        info!("Scanning for {:?}", timeout);

        let found = self
            .executor
            .run_to_completion(self.central.discover(timeout), Some(timeout + SCAN_GRACE))??;

        let matching: Vec<_> = found
            .into_iter()
            .filter(|d| self.matches_filter(d))
            .collect();
        debug!("Scan found {} matching devices", matching.len());
        Ok(matching)
    }

    /// Open and connect the peripheral at `address`
    pub fn connect(&self, address: &str) -> Result<Arc<Device<C::Link>>> {
        let link = self
            .executor
            .run_to_completion(self.central.open(address), Some(self.config.scan_timeout()))??;

        let device = Device::new(
            address,
            link,
            self.executor.clone(),
            self.config.clone(),
            Arc::downgrade(&self.connected),
        );
        device.connect()?;
        Ok(device)
    }

    /// Scan and connect to the matching peripheral with the strongest signal
    pub fn connect_nearest(&self) -> Result<Arc<Device<C::Link>>> {
        let nearest = self
            .scan(None)?
            .into_iter()
            .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
            .ok_or_else(|| {
                BridgeError::DeviceNotFound(
                    self.config
                        .device_name
                        .clone()
                        .unwrap_or_else(|| "any device".to_string()),
                )
            })?;

        info!("Nearest device: {}", nearest);
        self.connect(&nearest.address)
    }

    /// Addresses of devices currently connected through this adapter
    pub fn connected_devices(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self
            .connected
            .live()
            .iter()
            .map(|d| d.address().to_string())
            .collect();
        addresses.sort();
        addresses
    }

    /// Disconnect every device still connected. Safe to call repeatedly.
    pub fn stop(&self) {
        let devices = self.connected.drain();
        if devices.is_empty() {
            return;
        }

        info!("Stopping adapter: disconnecting {} devices", devices.len());
        for device in devices {
            if let Err(e) = device.disconnect() {
                warn!("Failed to disconnect {}: {}", device.address(), e);
            }
        }
    }

    fn matches_filter(&self, device: &DiscoveredDevice) -> bool {
        match &self.config.device_name {
            Some(wanted) => device.name.as_deref() == Some(wanted.as_str()),
            None => true,
        }
    }
}

impl<C: Central> Waiter for Adapter<C> {
    fn sleep(&self, duration: Duration) -> Result<()> {
        self.pump(duration)
    }
}

impl<C: Central> Drop for Adapter<C> {
    fn drop(&mut self) {
        self.stop();
    }
}
