//! FRUpilot daemon
//!
//! Runs the FRU management engine in simulation mode: both controllers of
//! the appliance are instantiated in-process and wired back to back over a
//! loopback inter-controller link, with a scripted device topology. This is
//! the same assembly a hardware build would use, with the simulated adapters
//! swapped for the physical discovery, programmer, and link bindings.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use frupilot::adapters::{
    loopback_pair, InMemoryImageRepository, LoggingEventSink, SimulatedDiscovery,
};
use frupilot::domain::{DeviceLocation, FirmwareProtocol, ForceFlags, RawDeviceSignal, SpId};
use frupilot::engine::{Engine, EngineConfig, EnginePorts};
use frupilot::fup::{FupConfig, Manifest, ManifestCache};
use frupilot::monitor::{DebounceConfig, MonitorConfig, RedundancyGroups};
use frupilot::persist::InMemoryPersist;
use bytes::Bytes;

// =============================================================================
// CLI Arguments
// =============================================================================

/// FRUpilot - redundant FRU management and firmware upgrade engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Firmware manifest file (YAML); built-in demo manifest when omitted
    #[arg(long, env = "FRU_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Scheduler tick interval in milliseconds
    #[arg(long, env = "FRU_TICK_INTERVAL_MS", default_value = "500")]
    tick_interval_ms: u64,

    /// Fault debounce window in seconds
    #[arg(long, env = "FRU_DEBOUNCE_SECONDS", default_value = "6")]
    debounce_seconds: u64,

    /// Settle delay before the first upgrade phase, in seconds
    #[arg(long, env = "FRU_UPGRADE_DELAY_SECONDS", default_value = "10")]
    upgrade_delay_seconds: u64,

    /// Minimum spacing between activations within one redundancy group,
    /// in seconds
    #[arg(long, env = "FRU_INTER_DEVICE_DELAY_SECONDS", default_value = "30")]
    inter_device_delay_seconds: u64,

    /// Run as a single-controller system (no peer coordination)
    #[arg(long, env = "FRU_SINGLE_SP")]
    single_sp: bool,

    /// Upgrade devices even when they already run the image revision
    #[arg(long, env = "FRU_FORCE_NO_REVISION_CHECK")]
    force_no_revision_check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting FRUpilot");
    info!("  Tick interval: {} ms", args.tick_interval_ms);
    info!("  Debounce window: {} s", args.debounce_seconds);
    info!("  Single-SP mode: {}", args.single_sp);

    let (link_a, link_b) = loopback_pair();
    let cancel = CancellationToken::new();

    let (engine_a, surface_a) = build_engine(&args, SpId::SpA, Box::new(link_a))?;
    let handle_a = tokio::spawn(engine_a.run(cancel.clone()));

    let handle_b = if args.single_sp {
        None
    } else {
        let (engine_b, _surface_b) = build_engine(&args, SpId::SpB, Box::new(link_b))?;
        Some(tokio::spawn(engine_b.run(cancel.clone())))
    };

    info!("Engines running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    info!("  Final cache status: {}", surface_a.get_cache_status());
    cancel.cancel();

    let _ = handle_a.await;
    if let Some(handle) = handle_b {
        let _ = handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Assembly
// =============================================================================

const DEMO_MANIFEST: &str = r#"
products:
  ACME-PS-550:
    - target: primary
      image: acme_ps_550_2_17.bin
"#;

/// Build one controller's engine over the scripted demo topology: two
/// enclosures with one power supply per controller each.
fn build_engine(
    args: &Args,
    local_sp: SpId,
    transport: Box<dyn frupilot::domain::ports::PeerTransport>,
) -> Result<(Engine, frupilot::ControlSurface)> {
    let slots = [
        (DeviceLocation::new(0, 0, 0), SpId::SpA),
        (DeviceLocation::new(0, 0, 1), SpId::SpB),
        (DeviceLocation::new(0, 1, 0), SpId::SpA),
        (DeviceLocation::new(0, 1, 1), SpId::SpB),
    ];
    let groups = RedundancyGroups::new(vec![
        vec![slots[0].0, slots[1].0],
        vec![slots[2].0, slots[3].0],
    ]);

    let (discovery, seed) = SimulatedDiscovery::new();
    for (location, owner) in slots {
        seed.seed(
            location,
            RawDeviceSignal {
                inserted: true,
                general_fault: false,
                internal_fault: false,
                overtemp: false,
                fault_register_fail: false,
                firmware_rev: "2.05".into(),
                product_id: "ACME-PS-550".into(),
                downloadable: true,
                protocol: FirmwareProtocol::Manifest,
                owner,
            },
        );
    }

    let mut images = InMemoryImageRepository::new();
    images.insert(
        "acme_ps_550_2_17.bin",
        "2.17",
        Bytes::from_static(b"demo firmware image"),
    );

    let manifest = match &args.manifest {
        Some(path) => ManifestCache::new(path.clone()),
        None => ManifestCache::preloaded(Manifest::from_yaml(DEMO_MANIFEST)?),
    };

    let config = EngineConfig {
        local_sp,
        tick_interval: Duration::from_millis(args.tick_interval_ms),
        groups,
        monitor: MonitorConfig {
            debounce: DebounceConfig {
                window: Duration::from_secs(args.debounce_seconds),
            },
            ..MonitorConfig::default()
        },
        fup: FupConfig {
            delay_before_upgrade: Duration::from_secs(args.upgrade_delay_seconds),
            inter_device_delay: Duration::from_secs(args.inter_device_delay_seconds),
            single_sp: args.single_sp,
            default_force: ForceFlags {
                no_revision_check: args.force_no_revision_check,
                ..ForceFlags::default()
            },
            ..FupConfig::default()
        },
        ..EngineConfig::default()
    };
    let ports = EnginePorts {
        discovery: Box::new(discovery),
        programmer: Box::new(frupilot::adapters::SimulatedProgrammer::new()),
        images: Box::new(images),
        transport,
        persist: Box::new(InMemoryPersist::new()),
        events: Box::new(LoggingEventSink::new()),
        manifest,
    };

    info!(sp = %local_sp, "engine assembled");
    Ok(Engine::new(config, ports))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
