//! usb-link
//!
//! Command-line front end for the USB data link. Opens a reliable byte stream
//! over a pair of bulk endpoints and relays it to stdin/stdout.

mod config;
mod relay;

use anyhow::{Context, Result};
use async_channel::Receiver;
use clap::{Parser, Subcommand};
use common::{UsbAddress, setup_logging};
use config::CliConfig;
use link::{Notification, Role, RusbDriver, UsbDataLink};
use relay::RelayEnd;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-link")]
#[command(
    author,
    version,
    about = "USB data link - A reliable byte stream over USB bulk endpoints"
)]
#[command(long_about = "
Opens a framed, flow-controlled byte stream between two hosts joined by a USB
device with a bulk IN and a bulk OUT endpoint, and relays it to stdin/stdout.

EXAMPLES:
    # List USB devices
    usb-link list

    # Actively connect (sends the handshake and waits for the answer)
    usb-link connect 04f9:0042

    # Pick a specific device and non-default endpoints
    usb-link connect 04f9:0042@1.5/0x82,0x02,1

    # Wait for the peer to connect
    usb-link listen 04f9:0042

    # Write the default configuration file
    usb-link save-config

ADDRESSES:
    VID:PID[@BUS.ADDR][/IN,OUT,IFACE]   (hex ids, endpoints default to 0x81,0x01,0)

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-link/config.toml
    3. /etc/usb-link/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List USB devices and exit
    List,
    /// Open the link actively and relay stdin/stdout
    Connect {
        /// Device address, falls back to `default_address` from the config
        address: Option<UsbAddress>,
    },
    /// Open the link passively, answer the peer's handshake, then relay
    Listen {
        /// Device address, falls back to `default_address` from the config
        address: Option<UsbAddress>,
    },
    /// Save default configuration and exit
    SaveConfig {
        /// Destination, defaults to the per-user config path
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle save-config early (before loading config)
    if let Command::SaveConfig { path } = &args.command {
        let path = path.clone().unwrap_or_else(CliConfig::default_path);
        CliConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        CliConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CliConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-link v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    match args.command {
        Command::List => list_devices(&config).await,
        Command::Connect { address } => {
            let address = config.address(address)?;
            run_link(config, address, Role::Active).await
        }
        Command::Listen { address } => {
            let address = config.address(address)?;
            run_link(config, address, Role::Passive).await
        }
        Command::SaveConfig { .. } => Ok(()),
    }
}

/// List USB devices and exit
async fn list_devices(config: &CliConfig) -> Result<()> {
    info!("Listing USB devices...");

    let driver = RusbDriver::new(config.link.poll_interval())
        .context("Failed to initialize libusb")?;
    let devices = tokio::task::spawn_blocking(move || driver.devices())
        .await
        .context("Device enumeration panicked")?
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!(
                "  {:04x}:{:04x} - {} {}",
                device.vendor_id,
                device.product_id,
                device
                    .manufacturer
                    .as_deref()
                    .unwrap_or("Unknown Manufacturer"),
                device.product.as_deref().unwrap_or("Unknown Product")
            );
            println!(
                "      Bus {:03} Device {:03}",
                device.bus_number, device.device_address
            );
            println!();
        }
    }

    Ok(())
}

/// Open the link in the given role, relay until done, then close it
async fn run_link(config: CliConfig, address: UsbAddress, role: Role) -> Result<()> {
    let driver = Arc::new(
        RusbDriver::new(config.link.poll_interval()).context("Failed to initialize libusb")?,
    );
    let (tx, rx) = async_channel::unbounded::<Notification>();
    let link = Arc::new(
        UsbDataLink::new(driver, config.link.clone(), Arc::new(tx))
            .context("Failed to create link")?,
    );

    info!("Opening {} as {:?} ({})", address, role, link.id());
    let opener = link.clone();
    tokio::task::spawn_blocking(move || match role {
        Role::Active => opener.connect(&address),
        Role::Passive => opener.bind(&address),
    })
    .await
    .context("Open task panicked")?
    .with_context(|| format!("Failed to open link on {}", address))?;

    let result = relay_link(&link, &rx, role).await;

    info!("Closing link...");
    let closer = link.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || closer.close()).await {
        error!("Close task panicked: {}", e);
    }

    match result? {
        RelayEnd::Disconnected => info!("Peer disconnected"),
        RelayEnd::Interrupted => info!("Interrupted"),
    }
    Ok(())
}

async fn relay_link(
    link: &Arc<UsbDataLink<RusbDriver>>,
    events: &Receiver<Notification>,
    role: Role,
) -> Result<RelayEnd> {
    if role == Role::Passive {
        relay::answer_handshake(link, events).await?;
    }
    info!("Link open, relaying stdin/stdout (Ctrl+C to stop)");
    relay::run(link.clone(), events.clone()).await
}
