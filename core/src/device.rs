//! Synchronous device facade
//!
//! [`Device`] wraps one transport link behind ordinary blocking calls. Every
//! transport operation goes through the shared [`BlockingExecutor`] under a
//! per-connection gate, so operations on one connection never overlap.
//! Notifications land in per-characteristic [`LatestValueBuffer`]s and feed
//! the device's [`ReadinessBarrier`].

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::ConnectedSet;
use crate::barrier::ReadinessBarrier;
use crate::buffer::{BufferStats, LatestValueBuffer, Payload};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::executor::BlockingExecutor;
use crate::transport::{CharacteristicId, Link, NotificationSink};

/// User callback invoked with every notification on a subscribed characteristic
pub type NotificationCallback = Arc<dyn Fn(&CharacteristicId, &[u8]) + Send + Sync>;

static NEXT_DEVICE_KEY: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Disconnected => write!(f, "disconnected"),
            DeviceState::Connecting => write!(f, "connecting"),
            DeviceState::Connected => write!(f, "connected"),
            DeviceState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// The blocking device API handed to protocol clients
pub trait HubDevice: Send + Sync {
    fn address(&self) -> &str;

    fn connect(&self) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    fn write(
        &self,
        id: &CharacteristicId,
        payload: &[u8],
        wait_for_response: bool,
        timeout: Option<Duration>,
    ) -> Result<()>;

    fn read(&self, id: &CharacteristicId) -> Result<Payload>;

    fn subscribe(
        &self,
        id: &CharacteristicId,
        callback: NotificationCallback,
        needed_sources: Option<usize>,
    ) -> Result<()>;

    fn unsubscribe(&self, id: &CharacteristicId) -> Result<()>;
}

/// Subscription registry entry
pub struct Subscription {
    id: CharacteristicId,
    buffer: LatestValueBuffer,
    callback: Mutex<Option<NotificationCallback>>,
}

impl Subscription {
    fn new(
        id: CharacteristicId,
        capacity: usize,
        executor: Arc<BlockingExecutor>,
        callback: Option<NotificationCallback>,
    ) -> Self {
        Self {
            buffer: LatestValueBuffer::new(id.clone(), capacity, executor),
            id,
            callback: Mutex::new(callback),
        }
    }

    pub fn id(&self) -> &CharacteristicId {
        &self.id
    }

    pub fn buffer(&self) -> &LatestValueBuffer {
        &self.buffer
    }

    fn deliver(&self, payload: &[u8]) {
        // Saturation is logged and latched by the buffer; the callback still runs
        let _ = self.buffer.on_notify(payload);

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(&self.id, payload);
        }
    }
}

/// State reachable from the transport's notification path
struct Shared {
    subscriptions: Mutex<HashMap<CharacteristicId, Arc<Subscription>>>,
    barrier: ReadinessBarrier,
}

impl Shared {
    fn dispatch(&self, id: &CharacteristicId, payload: &[u8]) {
        let subscription = self.subscriptions.lock().get(id).cloned();
        match subscription {
            Some(subscription) => subscription.deliver(payload),
            None => debug!("Dropping notification for unregistered {}", id),
        }

        // After delivery: a released waiter finds the value buffered
        self.barrier.observe(id);
    }
}

pub struct Device<L: Link> {
    key: u64,
    address: String,
    link: L,
    executor: Arc<BlockingExecutor>,
    config: BridgeConfig,
    state: Mutex<DeviceState>,
    shared: Arc<Shared>,
    gate: ReentrantMutex<()>,
    connected_set: Weak<ConnectedSet>,
    me: Weak<Device<L>>,
}

impl<L: Link> fmt::Debug for Device<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("state", &*self.state.lock())
            .field("subscriptions", &self.subscriptions())
            .finish_non_exhaustive()
    }
}

impl<L: Link> Device<L> {
    /// Wrap an unconnected `link`. The device joins `connected_set` while connected.
    ///
    /// `config` is used as given, without [`BridgeConfig::validate`]. The
    /// adapter validates before constructing devices; a device built here
    /// directly may run with settings `validate` rejects, such as a zero
    /// queue capacity, whose buffers then report `QueueSaturated`.
    pub fn new(
        address: impl Into<String>,
        link: L,
        executor: Arc<BlockingExecutor>,
        config: BridgeConfig,
        connected_set: Weak<ConnectedSet>,
    ) -> Arc<Self> {
        let address = address.into();
        Arc::new_cyclic(|me| Self {
            key: NEXT_DEVICE_KEY.fetch_add(1, Ordering::Relaxed),
            address,
            link,
            executor,
            config,
            state: Mutex::new(DeviceState::Disconnected),
            shared: Arc::new(Shared {
                subscriptions: Mutex::new(HashMap::new()),
                barrier: ReadinessBarrier::new(),
            }),
            gate: ReentrantMutex::new(()),
            connected_set,
            me: me.clone(),
        })
    }

    /// A device not tracked by any adapter. Like [`Device::new`] this skips
    /// config validation.
    pub fn standalone(
        address: impl Into<String>,
        link: L,
        executor: Arc<BlockingExecutor>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Self::new(address, link, executor, config, Weak::new())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == DeviceState::Connected
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn executor(&self) -> &Arc<BlockingExecutor> {
        &self.executor
    }

    pub fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                DeviceState::Connected => return Ok(()),
                DeviceState::Disconnected => *state = DeviceState::Connecting,
                other => {
                    return Err(BridgeError::InvalidState {
                        operation: "connect",
                        state: other.to_string(),
                    })
                }
            }
        }

        info!("Connecting to {}", self.address);
        match self.call(self.link.connect(), None) {
            Ok(()) => {
                self.shared.barrier.reset();
                *self.state.lock() = DeviceState::Connected;
                if let Some(set) = self.connected_set.upgrade() {
                    let me: Weak<dyn HubDevice> = self.me.clone();
                    set.insert(self.key, me);
                }
                info!("Connected to {}", self.address);
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = DeviceState::Disconnected;
                warn!("Connection to {} failed: {}", self.address, e);
                Err(e)
            }
        }
    }

    /// Unsubscribe everything, close the link and leave the connected set.
    ///
    /// The device always ends up Disconnected; the first transport failure
    /// met on the way is returned.
    pub fn disconnect(&self) -> Result<()> {
        self.executor.blocking(|| {
            // Held for the whole teardown: nothing registers or starts until Disconnected
            let _gate = self.gate.lock();
            self.teardown()
        })?
    }

    fn teardown(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                DeviceState::Disconnected | DeviceState::Disconnecting => return Ok(()),
                DeviceState::Connected => *state = DeviceState::Disconnecting,
                DeviceState::Connecting => {
                    return Err(BridgeError::InvalidState {
                        operation: "disconnect",
                        state: DeviceState::Connecting.to_string(),
                    })
                }
            }
        }

        info!("Disconnecting from {}", self.address);
        let mut first_error = None;

        for id in self.subscriptions() {
            if let Err(e) = self.remove_subscription(&id) {
                warn!("Failed to stop notifications on {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.call(self.link.disconnect(), None) {
            warn!("Transport disconnect from {} failed: {}", self.address, e);
            first_error.get_or_insert(e);
        }

        // Entries whose stop failed go with the link
        let leftover: Vec<_> = self
            .shared
            .subscriptions
            .lock()
            .drain()
            .map(|(_, s)| s)
            .collect();
        for subscription in leftover {
            subscription.buffer.reset();
        }

        self.shared.barrier.reset();
        *self.state.lock() = DeviceState::Disconnected;
        if let Some(set) = self.connected_set.upgrade() {
            set.remove(self.key);
        }
        info!("Disconnected from {}", self.address);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write `payload` to `id`.
    ///
    /// Without `wait_for_response` this returns once the write is
    /// dispatched; with it, once the peripheral acknowledges. `timeout`
    /// defaults to the configured write timeout.
    pub fn write(
        &self,
        id: impl Into<CharacteristicId>,
        payload: &[u8],
        wait_for_response: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let id = id.into();
        self.ensure_connected()?;

        debug!(
            "Write {} bytes to {} (response: {})",
            payload.len(),
            id,
            wait_for_response
        );
        let timeout = timeout.unwrap_or_else(|| self.config.write_timeout());
        self.call_connected(
            self.link.write_characteristic(&id, payload, wait_for_response),
            Some(timeout),
        )
    }

    /// Acknowledged write with the configured timeout
    pub fn write_request(&self, id: impl Into<CharacteristicId>, payload: &[u8]) -> Result<()> {
        self.write(id, payload, true, None)
    }

    /// Latest value of `id`, subscribing to it on first use
    pub fn read(&self, id: impl Into<CharacteristicId>) -> Result<Payload> {
        let id = id.into();
        self.ensure_connected()?;

        let subscription = self.ensure_subscription(&id, None)?;
        subscription.buffer.read_latest(self.config.drain_timeout())
    }

    /// Pull-read `id` straight from the peripheral, bypassing the buffer
    pub fn read_direct(&self, id: impl Into<CharacteristicId>) -> Result<Vec<u8>> {
        let id = id.into();
        self.ensure_connected()?;
        self.call_connected(self.link.read_characteristic(&id), Some(self.config.write_timeout()))
    }

    /// Start notifications on `id` and route them to `callback`.
    ///
    /// With `needed_sources` (or the configured default) this blocks until
    /// that many distinct characteristics on this device have notified at
    /// least once, failing with `ReadinessTimeout` at the configured bound.
    pub fn subscribe(
        &self,
        id: impl Into<CharacteristicId>,
        callback: NotificationCallback,
        needed_sources: Option<usize>,
    ) -> Result<()> {
        let id = id.into();
        self.ensure_connected()?;
        if needed_sources == Some(0) {
            return Err(BridgeError::InvalidConfig(
                "needed_sources must be positive".to_string(),
            ));
        }

        self.ensure_subscription(&id, Some(callback))?;

        if let Some(needed) = needed_sources.or(self.config.readiness.default_sources) {
            info!("Waiting for {} distinct sources on {}", needed, self.address);
            self.shared
                .barrier
                .wait(&self.executor, needed, self.config.readiness_timeout())?;
            debug!("Readiness reached on {}", self.address);
        }
        Ok(())
    }

    /// Stop notifications on `id` and discard its buffered data
    pub fn unsubscribe(&self, id: impl Into<CharacteristicId>) -> Result<()> {
        let id = id.into();
        self.ensure_connected()?;
        self.executor.blocking(|| {
            let _gate = self.gate.lock();
            self.ensure_connected()?;
            self.remove_subscription(&id)
        })?
    }

    /// Wait while keeping notification delivery running
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.executor.pump(duration)
    }

    /// Currently registered characteristics, sorted
    pub fn subscriptions(&self) -> Vec<CharacteristicId> {
        let mut ids: Vec<_> = self.shared.subscriptions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscription(&self, id: impl Into<CharacteristicId>) -> Option<Arc<Subscription>> {
        self.shared.subscriptions.lock().get(&id.into()).cloned()
    }

    pub fn buffer_stats(&self, id: impl Into<CharacteristicId>) -> Option<BufferStats> {
        self.subscription(id).map(|s| s.buffer.stats())
    }

    /// Distinct characteristics that have notified since connecting
    pub fn ready_sources(&self) -> usize {
        self.shared.barrier.seen()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BridgeError::NotConnected)
        }
    }

    /// Run a transport operation under the connection gate
    fn call<T, F>(&self, operation: F, timeout: Option<Duration>) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.executor.blocking(|| {
            let _gate = self.gate.lock();
            self.executor.run_to_completion(operation, timeout)
        })??
    }

    /// [`Device::call`] that fails with `NotConnected` if a disconnect got
    /// the gate first
    fn call_connected<T, F>(&self, operation: F, timeout: Option<Duration>) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.executor.blocking(|| {
            let _gate = self.gate.lock();
            self.ensure_connected()?;
            self.executor.run_to_completion(operation, timeout)?
        })?
    }

    fn ensure_subscription(
        &self,
        id: &CharacteristicId,
        callback: Option<NotificationCallback>,
    ) -> Result<Arc<Subscription>> {
        self.executor.blocking(|| {
            // Held across check, insert and start so concurrent first reads start once
            let _gate = self.gate.lock();
            self.ensure_connected()?;

            if let Some(existing) = self.shared.subscriptions.lock().get(id).cloned() {
                if let Some(callback) = callback {
                    *existing.callback.lock() = Some(callback);
                }
                return Ok(existing);
            }

            let subscription = Arc::new(Subscription::new(
                id.clone(),
                self.config.queue_capacity,
                self.executor.clone(),
                callback,
            ));
            // Registered before starting so the first notifications are kept
            self.shared
                .subscriptions
                .lock()
                .insert(id.clone(), subscription.clone());

            if let Err(e) = self.call(self.link.start_notify(id, self.sink()), None) {
                self.shared.subscriptions.lock().remove(id);
                return Err(e);
            }
            debug!("Subscribed to {} on {}", id, self.address);
            Ok(subscription)
        })?
    }

    fn remove_subscription(&self, id: &CharacteristicId) -> Result<()> {
        let existing = self.shared.subscriptions.lock().get(id).cloned();
        match existing {
            Some(subscription) => {
                // The entry stays until the transport stops, so a retry stops again
                self.call(self.link.stop_notify(id), None)?;
                self.shared.subscriptions.lock().remove(id);
                subscription.buffer.reset();
                debug!("Unsubscribed from {} on {}", id, self.address);
                Ok(())
            }
            None => {
                debug!("{} was not subscribed on {}", id, self.address);
                Ok(())
            }
        }
    }

    fn sink(&self) -> NotificationSink {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |id, payload| {
            if let Some(shared) = shared.upgrade() {
                shared.dispatch(id, payload);
            }
        })
    }
}

impl<L: Link> HubDevice for Device<L> {
    fn address(&self) -> &str {
        Device::address(self)
    }

    fn connect(&self) -> Result<()> {
        Device::connect(self)
    }

    fn disconnect(&self) -> Result<()> {
        Device::disconnect(self)
    }

    fn write(
        &self,
        id: &CharacteristicId,
        payload: &[u8],
        wait_for_response: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        Device::write(self, id.clone(), payload, wait_for_response, timeout)
    }

    fn read(&self, id: &CharacteristicId) -> Result<Payload> {
        Device::read(self, id.clone())
    }

    fn subscribe(
        &self,
        id: &CharacteristicId,
        callback: NotificationCallback,
        needed_sources: Option<usize>,
    ) -> Result<()> {
        Device::subscribe(self, id.clone(), callback, needed_sources)
    }

    fn unsubscribe(&self, id: &CharacteristicId) -> Result<()> {
        Device::unsubscribe(self, id.clone())
    }
}

impl<L: Link> Drop for Device<L> {
    fn drop(&mut self) {
        if *self.state.get_mut() == DeviceState::Connected {
            if let Err(e) = self.disconnect() {
                warn!("Disconnect of {} on drop failed: {}", self.address, e);
            }
        }
    }
}
