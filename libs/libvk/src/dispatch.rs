//! Deferred work dispatcher
//!
//! A single worker thread runs everything the interrupt path, the heartbeat
//! and alert raisers defer. Requests are bits in an offload set; the worker
//! clears a bit when it picks the request up and always finishes with a
//! dequeue pass.

use crate::alert::{HostAlert, ERR_LOG_INTF_DOWN};
use crate::device::VkDevice;
use crate::error::Result;
use crate::regs::bar0;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Alert notification pending
pub const WQ_NOTF_PEND: u32 = 1 << 0;
/// Firmware download requested
pub const WQ_DWNLD_PEND: u32 = 1 << 1;
/// Requested download is the automatic boot load
pub const WQ_DWNLD_AUTO: u32 = 1 << 2;

/// Messages to the worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMsg {
    Run,
    Stop,
}

/// Boot image loader (fastboot handshake lives outside the transport)
pub trait FirmwareLoader: Send + Sync {
    /// Load every boot stage; runs on the dispatcher worker
    fn auto_load(&self, dev: &VkDevice) -> Result<()>;
}

impl VkDevice {
    pub(crate) fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(self);

        let handle = std::thread::Builder::new()
            .name("vk-wq".into())
            .spawn(move || {
                while let Ok(WorkerMsg::Run) = rx.recv() {
                    let Some(dev) = weak.upgrade() else { break };
                    dev.work_scheduled.store(false, Ordering::Release);
                    dev.process_work();
                }
                debug!("Dispatcher worker exiting");
            })?;

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.work_tx = Some(tx);
        threads.handles.push(handle);
        Ok(())
    }

    /// Schedule the worker; requests made while one is queued coalesce
    pub fn queue_work(&self) {
        if self.work_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        match &threads.work_tx {
            Some(tx) if tx.send(WorkerMsg::Run).is_ok() => {}
            _ => self.work_scheduled.store(false, Ordering::Release),
        }
    }

    /// Interrupt entry
    pub fn irq(&self) {
        if !self.drv_access_ok() {
            error!("Interrupt received when msgq not inited");
            return;
        }
        self.queue_work();
    }

    /// Latch host alert bits and get the notification handled
    pub fn set_host_alert(&self, bits: HostAlert) {
        self.host_alert.raise(bits);
        if self.offload.fetch_or(WQ_NOTF_PEND, Ordering::AcqRel) & WQ_NOTF_PEND == 0 {
            self.queue_work();
        }
    }

    /// Ask the worker to run the firmware auto loader; returns false when a
    /// download is already pending
    pub fn request_auto_download(&self) -> bool {
        if self.offload.fetch_or(WQ_DWNLD_PEND, Ordering::AcqRel) & WQ_DWNLD_PEND != 0 {
            return false;
        }
        self.offload.fetch_or(WQ_DWNLD_AUTO, Ordering::AcqRel);
        self.queue_work();
        true
    }

    /// One pass of deferred work
    pub fn process_work(&self) {
        if self.offload.load(Ordering::Acquire) & WQ_NOTF_PEND != 0 {
            self.offload.fetch_and(!WQ_NOTF_PEND, Ordering::AcqRel);
            self.handle_notf();
        }

        if self.offload.load(Ordering::Acquire) & WQ_DWNLD_AUTO != 0 {
            self.auto_load();
            self.offload
                .fetch_and(!(WQ_DWNLD_AUTO | WQ_DWNLD_PEND), Ordering::AcqRel);
        }

        match self.dequeue() {
            Ok(0) => debug!("Spurious trigger for workqueue"),
            Ok(_) => {}
            Err(e) => {
                error!("Dequeue failed: {}", e);
                self.blk_drv_access();
            }
        }
    }

    /// Read peer alerts from the card and log every change
    fn handle_notf(&self) {
        let reg = self.hw.bar0.read32(bar0::CARD_ERR_LOG);
        if reg == ERR_LOG_INTF_DOWN {
            self.blk_drv_access();
            self.host_alert.raise(HostAlert::PCIE_DOWN);
        } else {
            self.peer_alert.report(reg);
        }

        self.host_alert.handle();
        self.peer_alert.handle();
    }

    fn auto_load(&self) {
        let Some(loader) = self.loader.clone() else {
            warn!("Auto download requested without a firmware loader");
            return;
        };

        match loader.auto_load(self) {
            Ok(()) => match self.sync_msgq(true) {
                Ok(true) => info!("Auto download complete, queues synced"),
                Ok(false) => warn!("Auto download complete, queues not published yet"),
                Err(e) => error!("Sync after auto download failed: {}", e),
            },
            Err(e) => error!("Auto download failed: {}", e),
        }
    }
}
