// Transport module — the boundary with the asynchronous BLE stack

pub mod abstraction;
pub mod memory;

#[cfg(feature = "btleplug")]
pub mod btle;

pub use abstraction::{
    Central, CharacteristicId, DiscoveredDevice, Link, NotificationSink, TransportCall,
};
pub use memory::{MemoryCentral, MemoryLink, SimulatedPeripheral};

#[cfg(feature = "btleplug")]
pub use btle::{BtleCentral, BtleLink};
