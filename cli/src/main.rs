// blesync — command-line front end for the BLE bridge
//
// Scans, reads, writes and watches GATT characteristics through the blocking
// bridge API. Radio access needs the `hardware` feature; `demo` runs against
// a simulated hub on any build.

mod config;

use anyhow::{Context, Result};
use blesync_core::transport::memory::{MemoryCentral, SimulatedPeripheral};
use blesync_core::transport::TransportCall;
use blesync_core::{
    Adapter, BridgeConfig, Central, CharacteristicId, NotificationCallback, Payload,
    WEDO2_HUB_NAME, WEDO2_SERVICE_COUNT,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "hardware")]
type HardwareCentral = blesync_core::transport::BtleCentral;
#[cfg(not(feature = "hardware"))]
type HardwareCentral = MemoryCentral;

#[derive(Parser)]
#[command(name = "blesync")]
#[command(about = "Blocking access to BLE GATT peripherals", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby peripherals
    Scan {
        /// Scan duration in seconds (defaults to the configured scan timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Read the latest value of a characteristic
    Read {
        address: String,
        characteristic: String,
        /// Pull the value with a GATT read instead of subscribing
        #[arg(long)]
        direct: bool,
    },
    /// Write hex bytes to a characteristic
    Write {
        address: String,
        characteristic: String,
        hex: String,
        /// Do not wait for the peripheral to acknowledge
        #[arg(long)]
        no_response: bool,
    },
    /// Print notifications from a characteristic
    Watch {
        address: String,
        characteristic: String,
        /// Wait until this many distinct characteristics have notified
        #[arg(long)]
        sources: Option<usize>,
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
    /// Run the bridge end to end against a simulated hub
    Demo {
        #[arg(long, default_value_t = WEDO2_SERVICE_COUNT)]
        sources: usize,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Restore every setting to its default
    Reset,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
    tracing::debug!("blesync {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Config { action } => cmd_config(action),
        Commands::Demo { sources } => cmd_demo(sources),
        Commands::Scan { timeout } => {
            let adapter = hardware_adapter()?;
            cmd_scan(&adapter, timeout.map(Duration::from_secs))
        }
        Commands::Read {
            address,
            characteristic,
            direct,
        } => {
            let adapter = hardware_adapter()?;
            cmd_read(&adapter, &address, &characteristic, direct)
        }
        Commands::Write {
            address,
            characteristic,
            hex,
            no_response,
        } => {
            let adapter = hardware_adapter()?;
            cmd_write(&adapter, &address, &characteristic, &hex, !no_response)
        }
        Commands::Watch {
            address,
            characteristic,
            sources,
            seconds,
        } => {
            let adapter = hardware_adapter()?;
            cmd_watch(
                &adapter,
                &address,
                &characteristic,
                sources,
                Duration::from_secs(seconds),
            )
        }
    }
}

#[cfg(feature = "hardware")]
fn hardware_adapter() -> Result<Adapter<HardwareCentral>> {
    let config = config::Config::load()?;
    tracing::debug!("Using bridge config {:?}", config.bridge);
    let executor = Arc::new(blesync_core::BlockingExecutor::new()?);
    let central = executor
        .run_to_completion(HardwareCentral::new(), None)?
        .context("Failed to open the Bluetooth adapter")?;
    Ok(Adapter::with_executor(central, config.bridge, executor)?)
}

#[cfg(not(feature = "hardware"))]
fn hardware_adapter() -> Result<Adapter<HardwareCentral>> {
    anyhow::bail!(
        "This build has no BLE backend. Rebuild with `--features hardware`, or try `blesync demo`."
    )
}

fn parse_hex(raw: &str) -> Result<Vec<u8>> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).with_context(|| format!("Invalid hex payload: {}", raw))
}

fn format_payload(payload: &Payload) -> ColoredString {
    match payload {
        Payload::Value(bytes) if bytes.is_empty() => "(zero-length value)".yellow(),
        Payload::Value(bytes) => hex::encode(bytes).bright_green(),
        Payload::Empty => "(no data)".dimmed(),
        Payload::Timeout => "(timed out)".dimmed(),
    }
}

fn cmd_scan<C: Central>(adapter: &Adapter<C>, timeout: Option<Duration>) -> Result<()> {
    let timeout = timeout.unwrap_or_else(|| adapter.config().scan_timeout());
    println!("{} for {}s...", "Scanning".bold(), timeout.as_secs_f32());

    let mut found = adapter.scan(Some(timeout)).context("Scan failed")?;
    found.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));

    if found.is_empty() {
        println!("  {}", "(no devices found)".dimmed());
    }
    for device in found {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {:<20} {:<28} {}",
            device.address.bright_cyan(),
            device.name.as_deref().unwrap_or("<unnamed>"),
            rssi.dimmed()
        );
    }
    Ok(())
}

fn cmd_read<C: Central>(
    adapter: &Adapter<C>,
    address: &str,
    characteristic: &str,
    direct: bool,
) -> Result<()> {
    let device = adapter
        .connect(address)
        .with_context(|| format!("Failed to connect to {}", address))?;
    let id = CharacteristicId::new(characteristic);

    let payload = if direct {
        Payload::Value(device.read_direct(id.clone()).context("Read failed")?)
    } else {
        // The first read only starts notifications; give the peripheral a moment
        let mut payload = device.read(id.clone()).context("Read failed")?;
        if !payload.is_value() {
            device.sleep(adapter.config().pump_interval())?;
            payload = device.read(id.clone()).context("Read failed")?;
        }
        payload
    };

    println!("{} = {}", id.to_string().bright_cyan(), format_payload(&payload));
    device.disconnect()?;
    Ok(())
}

fn cmd_write<C: Central>(
    adapter: &Adapter<C>,
    address: &str,
    characteristic: &str,
    hex: &str,
    wait_for_response: bool,
) -> Result<()> {
    let payload = parse_hex(hex)?;
    let device = adapter
        .connect(address)
        .with_context(|| format!("Failed to connect to {}", address))?;

    device
        .write(characteristic, &payload, wait_for_response, None)
        .context("Write failed")?;

    let mode = if wait_for_response {
        "acknowledged"
    } else {
        "sent"
    };
    println!(
        "{} {} bytes {} to {}",
        "✓".green(),
        payload.len(),
        mode,
        CharacteristicId::new(characteristic).to_string().bright_cyan()
    );
    device.disconnect()?;
    Ok(())
}

fn cmd_watch<C: Central>(
    adapter: &Adapter<C>,
    address: &str,
    characteristic: &str,
    sources: Option<usize>,
    duration: Duration,
) -> Result<()> {
    let device = adapter
        .connect(address)
        .with_context(|| format!("Failed to connect to {}", address))?;

    let callback: NotificationCallback = Arc::new(|id, payload| {
        println!("  {} {}", id.to_string().dimmed(), hex::encode(payload).bright_green());
    });
    device
        .subscribe(characteristic, callback, sources)
        .context("Subscribe failed")?;

    println!(
        "{} {} for {}s (Ctrl-C to stop)",
        "Watching".bold(),
        CharacteristicId::new(characteristic).to_string().bright_cyan(),
        duration.as_secs()
    );
    device.sleep(duration)?;

    if let Some(stats) = device.buffer_stats(characteristic) {
        println!(
            "{} received {}, evicted {}",
            "Done:".bold(),
            stats.received,
            stats.evicted
        );
    }
    device.disconnect()?;
    Ok(())
}

const DEMO_HUB: &str = "00:16:53:A4:CD:7E";
const DEMO_SENSOR: &str = "00001560-1212-efde-1523-785feabcd123";
const DEMO_MOTOR: &str = "00001565-1212-efde-1523-785feabcd123";

/// Announcement characteristics of the simulated hub
fn demo_services() -> Vec<CharacteristicId> {
    (0..WEDO2_SERVICE_COUNT)
        .map(|i| CharacteristicId::new(format!("0000{:04x}-1212-efde-1523-785feabcd123", 0x1527 + i)))
        .collect()
}

fn cmd_demo(sources: usize) -> Result<()> {
    if sources == 0 || sources > WEDO2_SERVICE_COUNT {
        anyhow::bail!(
            "--sources must be between 1 and {} for the simulated hub",
            WEDO2_SERVICE_COUNT
        );
    }

    let central = MemoryCentral::new();
    let hub = central.add(
        SimulatedPeripheral::new(DEMO_HUB)
            .with_name(WEDO2_HUB_NAME)
            .with_rssi(-48),
    );
    central.add(
        SimulatedPeripheral::new("5C:F3:70:11:22:33")
            .with_name("Heart Rate")
            .with_rssi(-31),
    );
    let services = demo_services();
    for (port, id) in services.iter().enumerate() {
        hub.announce_on_subscribe(id.clone(), &[port as u8, 0x01, 0x22]);
    }

    let mut bridge = BridgeConfig::hub_config();
    bridge.scan_timeout_ms = 200;
    bridge.readiness.default_sources = Some(sources);
    let adapter = Adapter::new(central, bridge)?;

    println!("{}", "Simulated hub demo".bold());
    println!();

    cmd_scan(&adapter, None)?;
    println!();

    let device = adapter.connect_nearest().context("No hub found")?;
    println!("  {} Connected to {}", "✓".green(), device.address().bright_cyan());

    // Register all but one announcement source; the last subscribe waits for readiness
    let announced = Arc::new(AtomicUsize::new(0));
    for id in &services[..sources - 1] {
        device.read(id.clone())?;
    }
    let counter = announced.clone();
    device
        .subscribe(
            services[sources - 1].clone(),
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
            None,
        )
        .context("Hub never became ready")?;
    println!(
        "  {} Hub ready: {} of {} services announced",
        "✓".green(),
        device.ready_sources(),
        sources
    );

    // A sensor that samples faster than the client reads
    device.read(DEMO_SENSOR)?;
    let sampler = {
        let hub = hub.clone();
        std::thread::spawn(move || {
            for distance in 0u8..=250 {
                hub.notify(DEMO_SENSOR, &[0x02, distance]);
                std::thread::sleep(Duration::from_micros(200));
            }
        })
    };
    adapter.pump(Duration::from_millis(200))?;
    sampler
        .join()
        .map_err(|_| anyhow::anyhow!("Sensor thread panicked"))?;

    let latest = device.read(DEMO_SENSOR)?;
    println!("  {} Latest distance reading: {}", "✓".green(), format_payload(&latest));
    if let Some(stats) = device.buffer_stats(DEMO_SENSOR) {
        println!(
            "    {} notifications, {} evicted by the bounded queue",
            stats.received, stats.evicted
        );
    }

    device.write_request(DEMO_MOTOR, &[0x01, 0x01, 0x01, 0x64])?;
    device.sleep(Duration::from_millis(50))?;
    device.write(DEMO_MOTOR, &[0x01, 0x01, 0x01, 0x00], false, None)?;
    println!("  {} Motor spun up and stopped", "✓".green());

    adapter.stop();
    println!("  {} Adapter stopped, hub connected: {}", "✓".green(), hub.is_connected());

    let calls = hub.calls();
    let writes = calls
        .iter()
        .filter(|c| matches!(c, TransportCall::Write { .. }))
        .count();
    println!();
    println!(
        "{} {} transport calls ({} writes)",
        "Summary:".bold(),
        calls.len(),
        writes
    );
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }

        ConfigAction::Reset => {
            config = config::Config::default();
            config.save()?;
            println!("{} Configuration reset to defaults", "✓".green());
        }
    }

    Ok(())
}
