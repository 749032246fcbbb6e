//! Readiness barrier integration tests
//!
//! A hub announces its attached services as a burst of notifications on
//! several characteristics after the first subscription. These tests drive
//! that through the adapter and device against simulated peripherals.
//!
//! Run with: cargo test --test integration_readiness

use blesync_core::transport::memory::{MemoryCentral, SimulatedPeripheral};
use blesync_core::{
    Adapter, BridgeConfig, BridgeError, NotificationCallback, Payload, ReadinessConfig,
    WEDO2_HUB_NAME, WEDO2_SERVICE_COUNT,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const HUB: &str = "00:16:53:A1:B2:C3";
const PORT_INFO: &str = "00001527-1212-efde-1523-785feabcd123";
const SENSOR_VALUE: &str = "00001560-1212-efde-1523-785feabcd123";
const BUTTON: &str = "00001526-1212-efde-1523-785feabcd123";
const BATTERY: &str = "00002a19-0000-1000-8000-00805f9b34fb";

fn config(readiness_ms: u64) -> BridgeConfig {
    BridgeConfig {
        scan_timeout_ms: 20,
        readiness: ReadinessConfig {
            timeout_ms: readiness_ms,
            default_sources: None,
        },
        ..BridgeConfig::default()
    }
}

fn recorder() -> (NotificationCallback, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: NotificationCallback = Arc::new(move |id, _payload| {
        sink.lock().push(id.to_string());
    });
    (callback, seen)
}

#[test]
fn test_subscribe_waits_for_three_sources() {
    let central = MemoryCentral::new();
    let hub = central.add(SimulatedPeripheral::new(HUB).with_name(WEDO2_HUB_NAME));
    let adapter = Adapter::new(central, config(2_000)).expect("Adapter");
    let device = adapter.connect(HUB).expect("Connect");

    // Port info arrives once its notifications are on; the others are
    // registered before the announcer starts
    hub.announce_on_subscribe(PORT_INFO, &[0x01, 0x01]);
    device.read(BUTTON).expect("Subscribe button");
    device.read(BATTERY).expect("Subscribe battery");

    let announcer_hub = hub.clone();
    let announcer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        for (id, payload) in [(BUTTON, &[0x00][..]), (BATTERY, &[0x64][..])] {
            assert!(announcer_hub.notify(id, payload));
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let (callback, seen) = recorder();
    device
        .subscribe(PORT_INFO, callback, Some(3))
        .expect("Three sources report");
    announcer.join().expect("Announcer");

    assert!(device.ready_sources() >= 3);
    assert!(!seen.lock().is_empty());
    assert_eq!(device.read(BATTERY).expect("Read"), Payload::Value(vec![0x64]));
}

#[test]
fn test_subscribe_fails_when_only_two_sources_report() {
    let central = MemoryCentral::new();
    let hub = central.add(SimulatedPeripheral::new(HUB));
    hub.announce_on_subscribe(PORT_INFO, &[0x01]);
    hub.announce_on_subscribe(BUTTON, &[0x00]);

    let adapter = Adapter::new(central, config(150)).expect("Adapter");
    let device = adapter.connect(HUB).expect("Connect");
    device.read(BUTTON).expect("Subscribe button");

    let (callback, _seen) = recorder();
    let started = Instant::now();
    let result = device.subscribe(PORT_INFO, callback, Some(3));

    assert_eq!(result, Err(BridgeError::ReadinessTimeout { needed: 3, seen: 2 }));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(result.unwrap_err().is_retryable());

    // The subscription itself stays in place
    assert!(device.subscription(PORT_INFO).is_some());
}

#[test]
fn test_default_sources_from_hub_config() {
    let central = MemoryCentral::new();
    let hub = central.add(SimulatedPeripheral::new(HUB).with_name(WEDO2_HUB_NAME));
    let services: Vec<String> = (0..WEDO2_SERVICE_COUNT)
        .map(|i| format!("0000{:04x}-1212-efde-1523-785feabcd123", 0x1560 + i))
        .collect();
    for id in &services {
        hub.announce_on_subscribe(id.as_str(), &[0x0f]);
    }

    let mut config = BridgeConfig::hub_config();
    config.scan_timeout_ms = 20;
    config.readiness.timeout_ms = 2_000;
    let adapter = Adapter::new(central, config).expect("Adapter");
    let device = adapter.connect_nearest().expect("Connect nearest hub");

    // Register all but the last without waiting, then let the last subscribe wait
    for id in &services[..services.len() - 1] {
        device.read(id.as_str()).expect("Subscribe");
    }
    let (callback, _seen) = recorder();
    device
        .subscribe(services[services.len() - 1].as_str(), callback, None)
        .expect("All services announced");

    assert_eq!(device.ready_sources(), WEDO2_SERVICE_COUNT);
}

#[test]
fn test_readiness_resets_on_reconnect() {
    let central = MemoryCentral::new();
    let hub = central.add(SimulatedPeripheral::new(HUB));
    let adapter = Adapter::new(central, config(100)).expect("Adapter");
    let device = adapter.connect(HUB).expect("Connect");

    device.read(BUTTON).expect("Subscribe");
    hub.notify(BUTTON, &[1]);
    assert_eq!(device.ready_sources(), 1);

    device.disconnect().expect("Disconnect");
    device.connect().expect("Reconnect");
    assert_eq!(device.ready_sources(), 0);
}
