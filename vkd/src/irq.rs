//! UIO interrupt forwarding
//!
//! Each interrupt makes the UIO node readable with a 32-bit event count.
//! Writing 1 back re-enables the interrupt.

use anyhow::{Context, Result};
use libvk::VkDevice;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const POLL_MS: u16 = 200;

/// Forward interrupts from `path` to `dev` until `stop` is set
pub fn spawn(path: &Path, dev: Arc<VkDevice>, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    let mut uio = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    enable(&mut uio)?;
    info!("Forwarding interrupts from {}", path.display());

    Ok(tokio::task::spawn_blocking(move || {
        if let Err(e) = run(&mut uio, &dev, &stop) {
            error!("Interrupt forwarding stopped: {:#}", e);
        }
    }))
}

fn run(uio: &mut File, dev: &VkDevice, stop: &AtomicBool) -> Result<()> {
    while !stop.load(Ordering::Acquire) {
        let mut fds = [PollFd::new(uio.as_fd(), PollFlags::POLLIN)];
        if poll(&mut fds, PollTimeout::from(POLL_MS))? == 0 {
            continue;
        }

        let mut count = [0u8; 4];
        uio.read_exact(&mut count)?;
        debug!("Interrupt count {}", u32::from_ne_bytes(count));

        enable(uio)?;
        dev.irq();
    }
    Ok(())
}

fn enable(uio: &mut File) -> Result<()> {
    uio.write_all(&1u32.to_ne_bytes())
        .context("re-enabling interrupt")?;
    Ok(())
}
