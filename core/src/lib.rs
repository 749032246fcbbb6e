// blesync core — synchronous access to asynchronous BLE peripherals
#![allow(clippy::empty_line_after_doc_comments)]
//
// Protocol clients written as straight-line blocking code drive a
// notification-based GATT stack through the types exported here.

pub mod adapter;
pub mod barrier;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod transport;

pub use adapter::{Adapter, ConnectedSet};
pub use barrier::ReadinessBarrier;
pub use buffer::{BufferStats, LatestValueBuffer, NotificationQueue, Payload};
pub use config::{
    BridgeConfig, ReadinessConfig, DEFAULT_QUEUE_CAPACITY, WEDO2_HUB_NAME, WEDO2_SERVICE_COUNT,
};
pub use device::{Device, DeviceState, HubDevice, NotificationCallback, Subscription};
pub use error::{BridgeError, Result};
pub use executor::{BlockingExecutor, Waiter};
pub use transport::{Central, CharacteristicId, DiscoveredDevice, Link, NotificationSink};
