//! # libvk
//!
//! Host side message transport for Valkyrie (VK) PCIe offload cards.
//!
//! The card publishes a set of ring buffers in BAR1: host to card (h2vk)
//! rings carry requests, card to host (vk2h) rings carry responses. Every
//! message is a run of 32-byte blocks whose first block is the header.
//! This crate owns the rings, message id translation, per-session
//! response routing, card alerts, the heartbeat and the reset sequence.
//!
//! ## Example
//!
//! ```rust,ignore
//! use libvk::{Hardware, MmioBar, VkDevice};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let dir = Path::new("/sys/bus/pci/devices/0000:01:00.0");
//! let bar0 = Arc::new(MmioBar::map_resource(&dir.join("resource0"))?);
//! let bar1 = Arc::new(MmioBar::map_resource(&dir.join("resource2"))?);
//! let dev = VkDevice::builder(Hardware::new(bar0, bar1)).build();
//! dev.start()?;
//! dev.sync_msgq(false)?;
//!
//! let session = dev.open(std::process::id())?;
//! session.write(&request)?;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod alert;
pub mod config;
pub mod context;
mod dequeue;
pub mod device;
pub mod dispatch;
pub mod dma;
mod enqueue;
pub mod error;
mod heartbeat;
pub mod hw;
pub mod msg;
pub mod msgid;
pub mod pending;
pub mod qstats;
pub mod regs;
pub mod reset;
pub mod session;
mod sync;

pub use alert::{AlertState, HostAlert, PeerAlert};
pub use config::VkConfig;
pub use context::Context;
pub use device::{VkDevice, VkDeviceBuilder};
pub use dispatch::FirmwareLoader;
pub use dma::{DmaBuffer, DmaDirection, DmaMapper, VkData};
pub use error::{Result, VkError};
pub use hw::{Bar, Hardware, MemBar, MmioBar, QueueInfo};
pub use msg::{MsgBlock, BLK_SIZE};
pub use qstats::QueueStats;
pub use reset::{NixSignaller, ResetPhase, SessionSignaller};
pub use session::Session;
