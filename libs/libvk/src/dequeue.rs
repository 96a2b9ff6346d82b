//! Card to host dequeue engine

use crate::alert::HostAlert;
use crate::device::VkDevice;
use crate::error::{Result, VkError};
use crate::hw::RingView;
use crate::regs::fid;
use std::sync::atomic::{fence, Ordering};
use tracing::{debug, error};

impl VkDevice {
    /// Drain every card to host queue and match responses to requests
    ///
    /// Returns the number of messages consumed; 0 means the trigger was
    /// spurious. Out-of-range ring state blocks the transport and raises
    /// `PCIE_DOWN`.
    pub fn dequeue(&self) -> Result<usize> {
        let bar = self.hw.bar1.as_ref();
        let interval = self.config.msgq.qstats_interval;
        let mut total = 0;

        let mut chan = self.vk2h.lock();
        fence(Ordering::Acquire);

        for q_num in 0..chan.queues.len() {
            let info = chan.queues[q_num];
            let ring = RingView::new(bar, &info);

            while !ring.is_empty() {
                let mut rd_idx = ring.read_index();
                let wr_idx = ring.write_index();
                let hdr = ring.read_block(rd_idx);

                if rd_idx >= info.size || wr_idx >= info.size || hdr.size > info.size - 1 {
                    error!(
                        "Invalid rd_idx {:#x} wr_idx {:#x} or size {:#x} => max {:#x}!",
                        rd_idx, wr_idx, hdr.size, info.size
                    );
                    drop(chan);
                    self.blk_drv_access();
                    self.set_host_alert(HostAlert::PCIE_DOWN);
                    return Err(VkError::Protocol(format!(
                        "vk2h queue {} rd_idx {:#x} size {:#x}",
                        q_num, rd_idx, hdr.size
                    )));
                }

                chan.stats[q_num].update(self.vk2h.name, q_num, ring.occupied(), interval);

                let num_blks = hdr.total_blocks();
                let mut data = Vec::with_capacity(num_blks);
                for _ in 0..num_blks {
                    data.push(ring.read_block(rd_idx));
                    rd_idx = info.inc(rd_idx, 1);
                }
                total += 1;

                ring.publish_read_index(rd_idx);

                debug!(
                    "MsgQ[{}] [Rd Wr] = [{} {}] blks extracted {} - Q = [u-{} a-{}]/{}",
                    info.num,
                    ring.read_index(),
                    ring.write_index(),
                    num_blks,
                    ring.occupied(),
                    ring.avail(),
                    info.size
                );

                // One-way messages have no pending request
                if hdr.function_id == fid::SHUTDOWN {
                    continue;
                }

                let msg_id = hdr.msg_id();
                match self.h2vk.pending.find_and_remove(q_num, msg_id, &self.msg_ids) {
                    Some(mut entry) => {
                        entry.to_h = Some(data);
                        self.vk2h.pending.append(q_num, entry, &self.contexts);
                    }
                    None => {
                        error!(
                            "Could not find MsgId[{:#x}] for resp func {} bmap {}",
                            msg_id,
                            hdr.function_id,
                            self.msg_ids.is_allocated(msg_id) as u8
                        );
                    }
                }
            }
        }
        drop(chan);

        debug!("total {} drained from queues", total);
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use crate::alert::HostAlert;
    use crate::device::VkDevice;
    use crate::error::VkError;
    use crate::hw::{Bar, Hardware, MemBar};
    use crate::msg::MsgBlock;
    use crate::regs::{bar0, bar1, fid, fw_status};
    use std::sync::Arc;

    // One queue per direction; the card to host record is the second one
    const REC: usize = 0x100 + 24;
    const RING: usize = 0x2000;
    const SIZE: u32 = 8;

    fn device() -> (Arc<MemBar>, Arc<VkDevice>) {
        let bar0 = Arc::new(MemBar::new(0x1000));
        let bar1 = Arc::new(MemBar::new(0x8000));
        bar0.write32(bar0::FW_STATUS, fw_status::READY);
        bar1.write32(bar1::MSGQ_NR, 2);
        bar1.write32(bar1::MSGQ_CTRL_OFF, 0x100);
        for (i, start) in [0x1000usize, RING].iter().enumerate() {
            bar1.write32(0x100 + i * 24 + 4, *start as u32);
            bar1.write32(0x100 + i * 24 + 16, SIZE);
        }
        bar1.write32(bar1::MSGQ_DEF_RDY, bar1::MSGQ_RDY_MARKER);
        let dev = VkDevice::builder(Hardware::new(bar0, bar1.clone())).build();
        dev.sync_msgq(false).unwrap();
        (bar1, dev)
    }

    fn card_push(bar1: &MemBar, blocks: &[MsgBlock]) {
        let mut wr = bar1.read32(REC + 12);
        for blk in blocks {
            for (i, w) in blk.to_words().iter().enumerate() {
                bar1.write32(RING + (wr & (SIZE - 1)) as usize * 32 + i * 4, *w);
            }
            wr = (wr + 1) & (SIZE - 1);
        }
        bar1.write32(REC + 12, wr);
    }

    #[test]
    fn test_empty_is_spurious() {
        let (_bar1, dev) = device();
        assert_eq!(dev.dequeue().unwrap(), 0);
    }

    #[test]
    fn test_shutdown_and_orphan_are_discarded() {
        let (bar1, dev) = device();
        card_push(&bar1, &[MsgBlock::new(fid::SHUTDOWN)]);
        let mut orphan = MsgBlock::new(3);
        orphan.set_msg_id(99);
        card_push(&bar1, &[orphan]);

        assert_eq!(dev.dequeue().unwrap(), 2);
        assert_eq!(bar1.read32(REC + 8), 2);
        assert_eq!(dev.pending_counts(), (0, 0));
        assert!(dev.drv_access_ok());
    }

    #[test]
    fn test_rd_idx_out_of_range() {
        let (bar1, dev) = device();
        bar1.write32(REC + 8, SIZE);
        bar1.write32(REC + 12, 1);

        assert!(matches!(dev.dequeue(), Err(VkError::Protocol(_))));
        assert!(!dev.drv_access_ok());
        assert!(dev.host_alerts().notfs.contains(HostAlert::PCIE_DOWN));
    }

    #[test]
    fn test_oversized_header() {
        let (bar1, dev) = device();
        let mut blk = MsgBlock::new(1);
        blk.size = SIZE;
        card_push(&bar1, &[blk]);

        assert!(matches!(dev.dequeue(), Err(VkError::Protocol(_))));
        assert!(!dev.drv_access_ok());
    }
}
