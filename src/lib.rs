use std::env;
use std::path::PathBuf;
use std::time::Duration;
use clap::Parser;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::LinkConfig;
use crate::device::btle::BtleHost;
use crate::device::connection::ConnectionManager;
use crate::device::constants::POLL_DELAY;
use crate::device::host::{event_queue, BleHost};
use crate::device::types::{ConnectionState, DeviceEvent};
use crate::error::AppRunError;

pub mod config;
pub mod device;
pub mod error;
pub mod protocol;

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Finds a compatible toy over Bluetooth LE, connects to it and keeps the link alive.", long_about = None)]
pub struct Cli {
    /// Read and write the config at this path instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Length of a scan window in seconds
    #[arg(long)]
    pub scan_secs: Option<u64>,

    /// Connect to the device with this address once it is found
    #[arg(long)]
    pub address: Option<String>,

    /// Vibration level (0-20) to set after connecting, instead of the short confirmation pulse
    #[arg(long)]
    pub vibrate: Option<u8>,

    /// Log debug output
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn init_logging(level: log::LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // btleplug is very chatty at debug
        .level_for("btleplug", log::LevelFilter::Info)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

/// Settings for this run: the stored config with the command line applied on top.
fn run_config(stored: LinkConfig, cli: &Cli) -> LinkConfig {
    let mut config = stored;

    if let Some(secs) = cli.scan_secs {
        config.scan_duration_ms = secs.saturating_mul(1000);
    }
    if let Some(address) = &cli.address {
        // auto-connect prefers the last connected device
        config.last_connected_device = Some(address.clone());
        config.auto_connect = true;
    }
    if let Some(level) = cli.vibrate {
        config.default_vibration_level = level;
    }

    config
}

/// Record the connected device in the stored config, leaving the command line overrides out of it.
async fn remember_device(config_io: &ConfigIO, address: &str, name: &str) {
    let mut stored = match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            warn!("Not remembering the device, failed to read config: {}", err);
            return;
        },
    };

    if stored.last_connected_device.as_deref() == Some(address) && stored.last_connected_name.as_deref() == Some(name) {
        return;
    }

    stored.remember_device(address, name);
    if let Err(err) = config_io.save(&stored).await {
        warn!("Failed to save config: {}", err);
    }
}

async fn on_device_event<H: BleHost>(manager: &mut ConnectionManager<H>, config_io: &ConfigIO, cli: &Cli, event: DeviceEvent) {
    match event {
        DeviceEvent::StateChange(ConnectionState::Connected) => {
            if let Some(device) = manager.current_device() {
                info!("Connected to {} ({})", device.name, device.address);
                let (address, name) = (device.address.clone(), device.name.clone());
                remember_device(config_io, &address, &name).await;
            }
        },
        // auto-connect did not pick a device
        DeviceEvent::StateChange(ConnectionState::Idle) if manager.state() == ConnectionState::Idle => {
            let wanted_missing = cli.address.as_deref().map_or(false, |address| !manager.registry().contains(address));
            if manager.registry().is_empty() || wanted_missing {
                info!("No matching device found, scanning again");
                let duration = manager.config().scan_duration();
                if let Err(err) = manager.start_scan(duration).await {
                    warn!("{}", err);
                }
            } else if manager.registry().len() > 1 {
                info!("Several compatible devices found, pick one with --address:");
                for device in manager.devices() {
                    info!("  {} {} ({} dBm)", device.address, device.name, device.rssi);
                }
            }
        },
        DeviceEvent::StateChange(ConnectionState::Failed) => {
            // reconnecting has given up, start over
            info!("Connection failed, scanning again");
            let duration = manager.config().scan_duration();
            if let Err(err) = manager.start_scan(duration).await {
                warn!("{}", err);
            }
        },
        DeviceEvent::StateChange(state) => debug!("State: {}", state),
        DeviceEvent::DeviceInfo(info) => {
            info!("Device: {} firmware {} mac {}", info.model_type, info.firmware_version, info.mac_address);
        },
        DeviceEvent::BatteryLevel(level) => info!("Battery: {}%", level),
    }
}

async fn run_link(cli: &Cli, config_io: &ConfigIO) -> Result<(), AppRunError> {
    let stored = match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            warn!("Failed to read config, using defaults: {}", err);
            LinkConfig::default()
        },
    };
    let config = run_config(stored, cli);

    let (event_sender, events) = event_queue();
    let host = BtleHost::new(event_sender.clone()).await?;
    let mut manager = ConnectionManager::new(host, config, event_sender, events);
    let mut device_events = manager.subscribe();

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(err) => warn!("Failed to listen for ctrl-c: {}", err),
        }
        ctrl_c_cancel.cancel();
    });

    let duration = manager.config().scan_duration();
    if let Err(err) = manager.start_scan(duration).await {
        warn!("{}", err);
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = device_events.next() => match event {
                Some(event) => on_device_event(&mut manager, config_io, cli, event).await,
                None => break,
            },
            _ = sleep(Duration::from_millis(POLL_DELAY)) => manager.update().await,
        }
    }

    manager.shutdown().await;
    Ok(())
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(cli.config.as_deref())?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_link(&cli, &config_io))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_stored_config() {
        let cli = Cli::parse_from(["toylink", "--scan-secs", "3", "--address", "aa:bb", "--vibrate", "6"]);
        let stored = LinkConfig {
            auto_connect: false,
            last_connected_device: Some("cc:dd".to_string()),
            ..LinkConfig::default()
        };

        let config = run_config(stored, &cli);

        assert_eq!(config.scan_duration(), Duration::from_secs(3));
        assert_eq!(config.last_connected_device.as_deref(), Some("aa:bb"));
        assert!(config.auto_connect);
        assert_eq!(config.default_vibration_level, 6);
    }

    #[test]
    fn stored_config_is_kept_without_flags() {
        let cli = Cli::parse_from(["toylink", "--verbose"]);
        assert!(cli.verbose);

        let config = run_config(LinkConfig::default(), &cli);
        assert_eq!(config, LinkConfig::default());
    }

    #[tokio::test]
    async fn remembered_device_is_saved_without_overrides() {
        let path = env::temp_dir().join(format!("toylink-test-remember-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let config_io = ConfigIO::new_sync(Some(&path)).unwrap();

        remember_device(&config_io, "aa:bb", "LVS-Nora").await;

        let stored = config_io.read().await.unwrap();
        assert_eq!(stored.last_connected_device.as_deref(), Some("aa:bb"));
        assert_eq!(stored.last_connected_name.as_deref(), Some("LVS-Nora"));
        assert_eq!(stored.default_vibration_level, 0);

        let _ = std::fs::remove_file(&path);
    }
}
