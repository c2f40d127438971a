// gattduo: dual-role BLE session manager CLI
//
// Cross-platform command-line front end for the gattduo session core.

mod btle;
mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use gattduo_core::transport::ble::{ConnectionState, RemoteDevice};
use gattduo_core::{spawn_session, DeviceId, SessionCommand, SessionSnapshot};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How long `scan --connect` waits for service enumeration
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "gattduo")]
#[command(about = "gattduo: scan, connect and exchange messages over BLE GATT", long_about = None)]
#[command(version)]
struct Cli {
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run both roles over an in-process loopback link
    Simulate {
        /// Payload the peripheral notifies to the central
        #[arg(short, long, default_value = "Hello Central!")]
        payload: String,
        /// Message the central writes back
        #[arg(short, long, default_value = "Hello Peripheral!")]
        message: String,
        /// Notification size negotiated by the simulated central
        #[arg(long, default_value = "20")]
        mtu: usize,
    },
    /// Scan for peripherals with the local Bluetooth adapter
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Connect to this device id after scanning and list its services
        #[arg(short, long)]
        connect: Option<String>,
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
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Simulate {
            payload,
            message,
            mtu,
        } => cmd_simulate(payload, message, mtu),
        Commands::Scan { duration, connect } => cmd_scan(duration, connect).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn init_logging(
    log_file: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .context("Log file path has no file name")?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn cmd_simulate(payload: String, message: String, mtu: usize) -> Result<()> {
    let config = config::Config::load()?;

    println!("{}", "gattduo loopback simulation".bold());
    println!();

    let report = simulate::run(&config.session, &payload, &message, mtu)?;

    print_devices(&report.devices);
    println!();
    println!("{}", "Central log".bold());
    for line in report.central_log.lines() {
        println!("  {}", line.dimmed());
    }
    println!();

    for text in &report.received_messages {
        println!("{} Central received: {}", "✓".green(), text.bright_cyan());
    }
    match report.last_write_received {
        Some(text) => println!("{} Peripheral received: {}", "✓".green(), text.bright_cyan()),
        None => println!("{} Peripheral received nothing", "✗".red()),
    }

    Ok(())
}

async fn cmd_scan(duration: Option<u64>, connect: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let duration = Duration::from_secs(duration.unwrap_or(config.scan_seconds));

    let adapter = btle::default_adapter().await?;
    let (radio, commands) = btle::BtleplugRadio::new();
    let (handle, mut snapshots) = spawn_session(config.session.clone(), Arc::new(radio))?;
    let worker = tokio::spawn(btle::run_worker(adapter, commands, handle.clone()));

    snapshots
        .wait_for(|s| s.central_power.is_on())
        .await
        .context("Session stopped before the adapter powered on")?;
    println!("{} Bluetooth adapter ready", "✓".green());

    handle.command(SessionCommand::StartScan).await?;
    println!("Scanning for {}s...", duration.as_secs());
    tokio::time::sleep(duration).await;
    handle.command(SessionCommand::StopScan).await?;

    let snapshot = snapshots.borrow().clone();
    println!();
    print_devices(&snapshot.devices);

    if let Some(id) = connect {
        let device = DeviceId::new(id);
        if snapshot.device(&device).is_none() {
            anyhow::bail!("Device {} was not discovered", device);
        }

        println!();
        println!("Connecting to {}...", device.to_string().bright_cyan());
        handle
            .command(SessionCommand::Connect {
                device: device.clone(),
            })
            .await?;

        let enumerated = tokio::time::timeout(
            CONNECT_TIMEOUT,
            snapshots.wait_for(|s| is_enumerated(s, &device)),
        )
        .await
        .map(|waited| waited.map(|s| s.clone()));
        match enumerated {
            Ok(Ok(snapshot)) => {
                if let Some(remote) = snapshot.device(&device) {
                    print_services(remote);
                }
            }
            Ok(Err(_)) => anyhow::bail!("Session stopped while connecting"),
            Err(_) => println!("{} Timed out waiting for services", "✗".red()),
        }

        handle.command(SessionCommand::Disconnect { device }).await?;
    }

    handle.shutdown().await?;
    worker.abort();
    Ok(())
}

fn is_enumerated(snapshot: &SessionSnapshot, device: &DeviceId) -> bool {
    snapshot.device(device).is_some_and(|d| {
        d.state == ConnectionState::Connected
            && !d.services.is_empty()
            && d.services.iter().all(|s| !s.characteristics.is_empty())
    })
}

fn print_devices(devices: &[RemoteDevice]) {
    println!("{}", "Devices".bold());
    if devices.is_empty() {
        println!("  {}", "(none found)".dimmed());
        return;
    }
    for device in devices {
        println!(
            "  {:<40} {:<24} {:>5} dBm  {:?}",
            device.id.to_string().bright_cyan(),
            device.display_name(),
            device.rssi,
            device.state
        );
    }
}

fn print_services(device: &RemoteDevice) {
    println!("{}", "Services".bold());
    for service in &device.services {
        println!("  {}", service.uuid.to_string().bright_yellow());
        for characteristic in &service.characteristics {
            let marker = if characteristic.subscribed { " (subscribed)" } else { "" };
            println!("    {}{}", characteristic.id.characteristic, marker);
        }
    }
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save_to(&config::Config::config_file()?)?;
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
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}
