use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt as _;
use log::{LevelFilter, error, info, warn};

mod alerts;
mod ble;
mod cache;
mod config;
mod device_store;
mod identity;
mod instance;
mod messages;
mod mqtt;
mod orchestrator;
mod reading;
mod scheduler;

use crate::ble::LowEnergyReader;
use crate::cache::{CacheStore, DeviceIdentity};
use crate::identity::Scanner;
use crate::messages::Severity;

/// Watch the battery of a paired Bluetooth peripheral.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Take one reading, print it as JSON and exit
    #[arg(long)]
    once: bool,

    /// Forget the cached device before the first reading
    #[arg(long)]
    rescan: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(if verbose { LevelFilter::Debug } else { LevelFilter::Info });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn load_config(path: &Path) -> anyhow::Result<config::AppConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::de::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("No config at {}, using defaults", path.display());
            Ok(config::AppConfig::default())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args.config)?;
    let poll = config.poll();

    let cache_path = config.cache_path();
    let _instance = match cache_path.as_deref().map(instance::lock_path) {
        Some(lock_path) => match instance::InstanceLock::acquire(&lock_path) {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                info!("Another instance holds {}, exiting", lock_path.display());
                return Ok(());
            }
            Err(err) => {
                warn!("Running without the single-instance lock: {:#}", err);
                None
            }
        },
        None => None,
    };

    let mut cache = cache_path
        .map(CacheStore::load)
        .unwrap_or_else(CacheStore::in_memory);
    match cache.path() {
        Some(path) => info!("Cache: {}", path.display()),
        None => warn!("No cache location available; nothing will persist"),
    }
    if args.rescan {
        cache.clear_device();
    } else if let (None, Some(address)) = (cache.device(), config.pinned_address()) {
        cache.set_device(DeviceIdentity {
            name: config.device_name().unwrap_or_else(|| address.to_string()),
            address,
            resolved_at: std::time::SystemTime::now(),
        });
    }

    let (scanner, low_energy): (Arc<dyn Scanner>, Arc<dyn LowEnergyReader>) =
        match ble::BleTransport::first_adapter().await {
            Ok(transport) => {
                let transport = Arc::new(transport);
                (transport.clone(), transport)
            }
            Err(err) => {
                warn!("Bluetooth unavailable, using the device store only: {:#}", err);
                (Arc::new(ble::NoAdapter), Arc::new(ble::NoAdapter))
            }
        };
    let resolver = identity::IdentityResolver::new(scanner, poll.scan_timeout(), poll.failure_limit());
    let orchestrator = orchestrator::Orchestrator::new(
        resolver,
        low_energy,
        device_store::HostDeviceStore::default(),
        cache,
        orchestrator::AcquireOptions {
            keywords: config.keywords(),
            device_name: config.device_name(),
            connect_timeout: poll.connect_timeout(),
            fallback_timeout: poll.fallback_timeout(),
            stale_after: poll.stale_after(),
        },
    );

    let (scheduler, handle) = scheduler::Scheduler::new(
        orchestrator,
        alerts::AlertState::new(config.thresholds()),
        poll.interval(),
    );

    if args.once {
        tokio::spawn(scheduler.run());
        let reading = handle.acquire().await?;
        println!("{}", serde_json::to_string_pretty(&reading)?);
        return Ok(());
    }
    info!(
        "Polling every {}s, alerting at {:?}",
        poll.interval().as_secs(),
        config.thresholds()
    );

    tokio::spawn(log_alerts(handle.clone()));
    #[cfg(unix)]
    tokio::spawn(forward_signals(handle.clone()));

    let mqtt_client = match config.mqtt.as_ref() {
        Some(mqtt_config) => {
            let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
            mqtt_client.subscribe().await?;
            let commands = handle.clone();
            let client = mqtt_client.clone();
            tokio::spawn(async move { client.event_loop(&mut eventloop, commands).await });
            let client = mqtt_client.clone();
            let readings = handle.clone();
            tokio::spawn(async move { client.publish_loop(readings).await });
            Some(mqtt_client)
        }
        None => None,
    };

    tokio::select! {
        _ = scheduler.run() => {}
        _ = shutdown_signal() => info!("Shutting down"),
    }

    if let Some(mqtt_client) = mqtt_client {
        if let Err(err) = mqtt_client.disconnect().await {
            error!("Error disconnecting MQTT client: {:?}", err);
        }
    }
    info!("Last reading: {}", handle.current_reading());

    Ok(())
}

/// Stand-in for a desktop notifier: every threshold event is logged.
async fn log_alerts(handle: scheduler::SchedulerHandle) {
    let mut alerts = Box::pin(handle.alerts());
    while let Some(event) = alerts.next().await {
        let label = match event.severity {
            Severity::Critical => "CRITICAL",
            Severity::VeryLow => "Very Low",
            Severity::Low => "Low",
        };
        let message = format!(
            "{} Battery {}: battery is at {}. Please charge soon.",
            event.reading.device_name,
            label,
            event
                .reading
                .percent
                .map(|p| p.to_string())
                .unwrap_or_else(|| "?".to_string())
        );
        match event.severity {
            Severity::Critical => error!("{}", message),
            _ => warn!("{}", message),
        }
    }
}

/// SIGUSR1 refreshes, SIGUSR2 rescans.
#[cfg(unix)]
async fn forward_signals(handle: scheduler::SchedulerHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut refresh, mut rescan) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(refresh), Ok(rescan)) => (refresh, rescan),
        (Err(err), _) | (_, Err(err)) => {
            warn!("Manual refresh signals unavailable: {}", err);
            return;
        }
    };

    loop {
        tokio::select! {
            Some(()) = refresh.recv() => {
                info!("SIGUSR1: refresh");
                handle.refresh();
            }
            Some(()) = rescan.recv() => {
                info!("SIGUSR2: rescan");
                if let Err(err) = handle.rescan().await {
                    error!("Error requesting rescan: {:?}", err);
                }
            }
            else => break,
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
