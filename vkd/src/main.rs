//! # vkd
//!
//! Host agent for Valkyrie (VK) PCIe accelerator cards.
//!
//! ## Features
//!
//! - **BAR Mapping**: Maps the card's register and shared memory windows
//!   from sysfs
//! - **Queue Sync**: Picks up the card's queue definitions once its OS is
//!   up, and again after every reset
//! - **Interrupts**: Forwards UIO interrupts into the transport
//! - **Supervision**: Heartbeat monitoring and deferred work run in the
//!   transport's own threads

mod config;
mod irq;

use anyhow::{Context, Result};
use clap::Parser;
use config::VkdConfig;
use libvk::{Hardware, MmioBar, VkDevice, VkError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// vkd - VK card host agent
#[derive(Parser, Debug)]
#[command(name = "vkd", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/vkd/vkd.toml")]
    config: PathBuf,

    /// PCI address of the card (overrides the config file)
    #[arg(long, env = "VKD_DEVICE")]
    device: Option<String>,

    /// UIO node for interrupts (overrides the config file)
    #[arg(long)]
    uio: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = VkdConfig::load(&args.config)?;
    if let Some(device) = args.device {
        config.device.pci_address = device;
    }
    if let Some(uio) = args.uio {
        config.device.uio = Some(uio);
    }

    let log_level = if args.debug {
        "debug".to_string()
    } else {
        config.device.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!(
        "vkd v{} starting for {}",
        env!("CARGO_PKG_VERSION"),
        config.device.pci_address
    );

    run_daemon(config).await
}

async fn run_daemon(config: VkdConfig) -> Result<()> {
    let dir = config.device.sysfs_dir();
    let bar0 = MmioBar::map_resource(&dir.join("resource0"))
        .with_context(|| format!("mapping BAR0 of {}", config.device.pci_address))?;
    let bar1 = MmioBar::map_resource(&dir.join("resource2"))
        .with_context(|| format!("mapping BAR2 of {}", config.device.pci_address))?;

    let dev = VkDevice::builder(Hardware::new(Arc::new(bar0), Arc::new(bar1)))
        .config(config.driver.clone())
        .build();
    dev.start()?;

    let stop = Arc::new(AtomicBool::new(false));
    let irq_handle = match &config.device.uio {
        Some(path) => Some(irq::spawn(path, dev.clone(), stop.clone())?),
        None => {
            warn!(
                "No UIO node configured, polling queues every {:?}",
                config.device.sync_retry()
            );
            None
        }
    };

    let mut sync_interval = tokio::time::interval(config.device.sync_retry());

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(
        tokio::signal::unix::SignalKind::terminate()
    )?;
    #[cfg(unix)]
    let mut sigint = tokio::signal::unix::signal(
        tokio::signal::unix::SignalKind::interrupt()
    )?;

    info!("vkd ready");

    loop {
        tokio::select! {
            _ = sync_interval.tick() => {
                if !dev.drv_access_ok() {
                    try_sync(&dev);
                } else if irq_handle.is_none() {
                    dev.queue_work();
                }
            }

            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                break;
            }

            _ = sigint.recv() => {
                info!("Received SIGINT, initiating shutdown");
                break;
            }
        }
    }

    stop.store(true, Ordering::Release);
    if let Some(handle) = irq_handle {
        if let Err(e) = handle.await {
            error!("Interrupt task failed: {}", e);
        }
    }

    let dev_shutdown = dev.clone();
    tokio::task::spawn_blocking(move || dev_shutdown.shutdown()).await?;
    info!("vkd stopped");
    Ok(())
}

fn try_sync(dev: &VkDevice) {
    match dev.sync_msgq(false) {
        Ok(true) => info!("Card ready, {} queues per direction", dev.queue_count()),
        Ok(false) => debug!("Card not ready yet"),
        Err(VkError::AlreadySynced) => {}
        Err(VkError::NotReady) => debug!("Transport blocked until the card is reset"),
        Err(e) => warn!("Queue sync failed: {}", e),
    }
}
