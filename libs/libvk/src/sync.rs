//! Queue descriptor sync
//!
//! Once the card OS is up it publishes a table of queue control records in
//! BAR1 and writes the ready marker. Sync reads that table once and caches
//! the geometry; the rings themselves are always accessed live.

use crate::device::VkDevice;
use crate::error::{Result, VkError};
use crate::hw::{QueueInfo, QUEUE_RECORD_SIZE};
use crate::regs::{bar1, MSGQ_MAX_NR};
use std::sync::atomic::{fence, Ordering};
use tracing::{debug, error, info};

impl VkDevice {
    /// Read queue geometry published by the card
    ///
    /// Returns `Ok(false)` when the card has not published its queues yet;
    /// the caller is expected to try again later. A second sync without
    /// `force` is refused, and so is any sync while a host alert is latched:
    /// only a reset clears those.
    pub fn sync_msgq(&self, force: bool) -> Result<bool> {
        if !self.msgq_marker_valid() {
            info!("BAR1 msgq marker not initialized");
            return Ok(false);
        }

        let latched = self.host_alert.state().notfs;
        if !latched.is_empty() {
            debug!("Host alert {:?} latched, sync refused until reset", latched);
            return Err(VkError::NotReady);
        }

        let bar = self.hw.bar1.as_ref();
        let msgq_off = bar.read32(bar1::MSGQ_CTRL_OFF) as usize;
        let num_q = bar.read32(bar1::MSGQ_NR) as usize / 2;

        if self.drv_access_ok() && !force {
            error!("Msgq info already in sync");
            return Err(VkError::AlreadySynced);
        }

        let parsed = self.parse_queues(msgq_off, num_q);
        let (h2vk, vk2h) = match parsed {
            Ok(queues) => queues,
            Err(e) => {
                self.blk_drv_access();
                return Err(e);
            }
        };

        self.h2vk.lock().queues = h2vk;
        self.vk2h.lock().queues = vk2h;
        self.msgq_inited.store(true, Ordering::Release);

        info!("Message queues synced, {} per direction", num_q);
        Ok(true)
    }

    fn parse_queues(
        &self,
        msgq_off: usize,
        num_q: usize,
    ) -> Result<(Vec<QueueInfo>, Vec<QueueInfo>)> {
        if num_q == 0 || num_q > MSGQ_MAX_NR {
            error!("Invalid number of queues per direction: {}", num_q);
            return Err(VkError::Protocol(format!("{} queues per direction", num_q)));
        }

        let bar = self.hw.bar1.as_ref();
        let mut off = msgq_off;
        let mut chans = [Vec::with_capacity(num_q), Vec::with_capacity(num_q)];

        for queues in chans.iter_mut() {
            for j in 0..num_q {
                if off.saturating_add(QUEUE_RECORD_SIZE) > bar.len() {
                    return Err(VkError::Protocol(format!(
                        "queue record at {:#x} outside BAR1",
                        off
                    )));
                }

                let (info, nxt, next) = QueueInfo::read_record(bar, off);
                info!(
                    "MsgQ[{}] type {} num {}, @ {:#x}, rd_idx {} wr_idx {}, size {}, nxt {:#x}",
                    j,
                    info.q_type,
                    info.num,
                    info.start,
                    bar.read32(off + 8),
                    bar.read32(off + 12),
                    info.size,
                    nxt
                );

                if info.size < 2 || !info.size.is_power_of_two() {
                    return Err(VkError::Protocol(format!(
                        "queue {} size {} not a power of two",
                        j, info.size
                    )));
                }
                if info.start.saturating_add(info.storage_len()) > bar.len() {
                    return Err(VkError::Protocol(format!(
                        "queue {} storage {:#x}+{:#x} outside BAR1",
                        j,
                        info.start,
                        info.storage_len()
                    )));
                }

                queues.push(info);
                off = next;
                fence(Ordering::Acquire);
            }
        }

        let [h2vk, vk2h] = chans;
        Ok((h2vk, vk2h))
    }
}
