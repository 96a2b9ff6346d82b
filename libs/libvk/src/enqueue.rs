//! Host to card enqueue engine

use crate::alert::HostAlert;
use crate::device::VkDevice;
use crate::error::{Result, VkError};
use crate::hw::RingView;
use crate::msg::{MsgBlock, SIMPLEX_MSG_ID};
use crate::regs::{bar1, fid};
use std::sync::atomic::{fence, Ordering};
use tracing::{debug, error, info};

impl VkDevice {
    /// Copy a message into its host to card ring and ring the doorbell
    ///
    /// Waits for space up to the configured retry budget, sleeping with the
    /// channel mutex released. The doorbell carries `wr_idx + 1` so the card
    /// can tell a fresh ring from index zero.
    pub fn enqueue(&self, blocks: &[MsgBlock]) -> Result<()> {
        let hdr = blocks.first().copied().unwrap_or_default();
        if blocks.len() != hdr.total_blocks() {
            error!(
                "number of blks {} not matching {} MsgId[{:#x}]: func {} ctx {:#x}",
                blocks.len(),
                hdr.total_blocks(),
                hdr.msg_id(),
                hdr.function_id,
                hdr.context_id
            );
            return Err(VkError::SizeMismatch {
                blocks: blocks.len(),
                declared: hdr.total_blocks(),
            });
        }

        let q_num = hdr.queue();
        let needed = blocks.len() as u32;
        let msgq = &self.config.msgq;
        let bar = self.hw.bar1.as_ref();

        fence(Ordering::Acquire);
        let mut chan = self.h2vk.lock();
        let mut retry = 0;
        let info = loop {
            let info = *chan
                .queues
                .get(q_num as usize)
                .ok_or(VkError::InvalidQueue(q_num))?;
            let avail = RingView::new(bar, &info).avail();
            if retry == 0 {
                chan.stats[q_num as usize].update(
                    self.h2vk.name,
                    q_num as usize,
                    info.size - avail,
                    msgq.qstats_interval,
                );
            }
            if avail >= needed {
                break info;
            }
            if retry >= msgq.enq_retry {
                debug!(q = q_num, needed, avail, "Queue full after {} retries", retry);
                return Err(VkError::Busy(q_num));
            }
            retry += 1;

            drop(chan);
            std::thread::sleep(msgq.enq_retry_delay());
            chan = self.h2vk.lock();
        };

        let ring = RingView::new(bar, &info);
        let mut wr_idx = ring.write_index();
        if wr_idx >= info.size {
            error!("Invalid wr_idx {:#x} => max {:#x}!", wr_idx, info.size);
            drop(chan);
            self.blk_drv_access();
            self.set_host_alert(HostAlert::PCIE_DOWN);
            return Err(VkError::Protocol(format!(
                "h2vk queue {} wr_idx {:#x} out of range",
                q_num, wr_idx
            )));
        }

        for blk in blocks {
            ring.write_block(wr_idx, blk);
            wr_idx = info.inc(wr_idx, 1);
        }
        ring.publish_write_index(wr_idx);

        debug!(
            "MsgQ[{}] [Rd Wr] = [{} {}] blks inserted {} - Q = [u-{} a-{}]/{}",
            info.num,
            ring.read_index(),
            ring.write_index(),
            blocks.len(),
            ring.occupied(),
            ring.avail(),
            info.size
        );

        self.doorbell(q_num, wr_idx + 1);
        Ok(())
    }

    /// Send a one-way shutdown notice on the highest priority queue
    pub fn send_shutdown(&self, shut_type: u32, pid: u32) -> Result<()> {
        if !self.msgq_marker_valid() {
            info!(
                "PCIe comm chan - invalid marker ({:#x})!",
                self.hw.bar1.read32(bar1::MSGQ_DEF_RDY)
            );
            return Err(VkError::NotReady);
        }

        let mut blk = MsgBlock::new(fid::SHUTDOWN);
        blk.set_queue(0);
        blk.set_msg_id(SIMPLEX_MSG_ID);
        blk.args[0] = shut_type;
        blk.args[1] = pid;

        self.enqueue(&[blk]).map_err(|e| {
            error!(
                "Sending shutdown message to q {} for pid {} fails: {}",
                blk.queue(),
                pid,
                e
            );
            e
        })
    }
}
