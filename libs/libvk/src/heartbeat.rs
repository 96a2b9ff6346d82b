//! Heartbeat monitor
//!
//! The card's own watchdog is expected to catch a stuck card; this is the
//! host's last resort. Each tick compares the card's uptime register with
//! the previous value and declares the link lost after `lost_max` ticks
//! without progress. A downed link reads all ones, which never changes, so
//! it is caught the same way.

use crate::alert::HostAlert;
use crate::device::VkDevice;
use crate::error::Result;
use crate::regs::bar0;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HeartbeatState {
    pub last_uptime: u32,
    pub lost_cnt: u32,
}

impl VkDevice {
    pub(crate) fn spawn_heartbeat(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<()>();
        let weak = Arc::downgrade(self);
        let interval = self.config.heartbeat.interval();

        let handle = std::thread::Builder::new()
            .name("vk-hb".into())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
                    let Some(dev) = weak.upgrade() else { break };
                    dev.poll_heartbeat();
                }
                debug!("Heartbeat monitor exiting");
            })?;

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.hb_tx = Some(tx);
        threads.handles.push(handle);
        Ok(())
    }

    /// One heartbeat tick; returns true when the link is declared lost
    pub fn poll_heartbeat(&self) -> bool {
        let lost_max = self.config.heartbeat.lost_max;
        let lost = {
            let mut hb = self.hb.lock();
            if self.drv_access_ok() {
                let uptime_s = self.hw.bar0.read32(bar0::OS_UPTIME);
                if uptime_s == hb.last_uptime {
                    hb.lost_cnt += 1;
                } else {
                    hb.lost_cnt = 0;
                }
                debug!(
                    "Last uptime {} current {}, lost {}",
                    hb.last_uptime, uptime_s, hb.lost_cnt
                );
                hb.last_uptime = uptime_s;
            } else {
                hb.lost_cnt = 0;
            }
            hb.lost_cnt > lost_max
        };

        if lost {
            error!(
                "Heartbeat Misses {} times, {} s!",
                lost_max,
                lost_max as u64 * self.config.heartbeat.interval_secs
            );
            self.blk_drv_access();
            self.set_host_alert(HostAlert::HB_FAIL);
        }
        lost
    }

    /// Ticks without uptime progress so far
    pub fn heartbeat_lost(&self) -> u32 {
        self.hb.lock().lost_cnt
    }
}

#[cfg(test)]
mod tests {
    use crate::alert::HostAlert;
    use crate::device::VkDevice;
    use crate::hw::{Bar, Hardware, MemBar};
    use crate::regs::bar0;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn device() -> (Arc<MemBar>, Arc<VkDevice>) {
        let bar0 = Arc::new(MemBar::new(0x1000));
        let bar1 = Arc::new(MemBar::new(0x1000));
        let dev = VkDevice::builder(Hardware::new(bar0.clone(), bar1)).build();
        dev.msgq_inited.store(true, Ordering::SeqCst);
        (bar0, dev)
    }

    #[test]
    fn test_progress_resets_count() {
        let (bar0, dev) = device();
        bar0.write32(bar0::OS_UPTIME, 10);
        dev.poll_heartbeat();
        dev.poll_heartbeat();
        assert_eq!(dev.heartbeat_lost(), 1);

        bar0.write32(bar0::OS_UPTIME, 13);
        dev.poll_heartbeat();
        assert_eq!(dev.heartbeat_lost(), 0);
    }

    #[test]
    fn test_link_lost_after_threshold() {
        let (bar0, dev) = device();
        bar0.write32(bar0::OS_UPTIME, 42);
        dev.poll_heartbeat();

        // lost_max = 9: the tenth stale tick declares the link dead
        for _ in 0..9 {
            assert!(!dev.poll_heartbeat());
        }
        assert!(dev.poll_heartbeat());
        assert!(!dev.drv_access_ok());
        assert!(dev.host_alerts().notfs.contains(HostAlert::HB_FAIL));

        // not ready: counter is held at zero
        assert!(!dev.poll_heartbeat());
        assert_eq!(dev.heartbeat_lost(), 0);
    }
}
