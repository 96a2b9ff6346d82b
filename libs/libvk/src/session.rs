//! Session I/O boundary
//!
//! A [`Session`] is what a file handle on the card maps to. Writes carry
//! whole messages to the card; reads return responses addressed to this
//! session only. Message ids are translated on the way through so the card
//! always sees ids from the device allocator.

use crate::context::Context;
use crate::device::VkDevice;
use crate::dma::{map_planes, DmaBuffer, DmaDirection, VkData, VK_DATA_SIZE};
use crate::error::{Result, VkError};
use crate::hw::RingView;
use crate::msg::{blocks_from_bytes, blocks_to_bytes, MsgBlock, BLK_SIZE, BLK_SZ_SHIFT};
use crate::pending::{Lookup, WorkEntry};
use crate::regs::{fid, shutdown, trans_buf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// An open session on the device
pub struct Session {
    dev: Arc<VkDevice>,
    ctx: Option<Context>,
}

impl VkDevice {
    /// Open a session for `pid`
    pub fn open(self: &Arc<Self>, pid: u32) -> Result<Session> {
        let ctx = self.contexts.acquire(pid).map_err(|e| {
            error!("Error allocating context: {}", e);
            e
        })?;
        debug!("ctx_returned with idx {}, pid {}", ctx.idx, ctx.pid);
        Ok(Session {
            dev: Arc::clone(self),
            ctx: Some(ctx),
        })
    }

    /// Tear down a session; returns the sessions its process still has
    fn release(&self, ctx: Context) -> Result<usize> {
        debug!("Draining with context idx {} pid {}", ctx.idx, ctx.pid);

        self.h2vk.pending.drain_all(Some(&ctx), &self.msg_ids, &self.contexts);
        self.vk2h.pending.drain_all(Some(&ctx), &self.msg_ids, &self.contexts);

        let remaining = self.contexts.release(ctx);
        if remaining == 0 {
            self.handle_last_sess(ctx.pid)?;
        }
        Ok(remaining)
    }

    /// Tell the card that `pid` has no sessions left
    ///
    /// The reset owner gets no notice; its last close ends the reset.
    pub fn handle_last_sess(&self, pid: u32) -> Result<()> {
        if !self.drv_access_ok() {
            self.end_reset(pid);
            return Err(VkError::NotReady);
        }

        debug!("No more sessions, shut down pid {}", pid);
        if self.end_reset(pid) {
            return Ok(());
        }
        self.send_shutdown(shutdown::PID, pid)
    }

    /// Map the planes of a buffer transfer and optionally append their SG
    /// lists inband
    fn prepare_transfer(
        &self,
        ctx: &Context,
        raw: &mut Vec<u8>,
        q_num: usize,
    ) -> Result<Vec<Option<DmaBuffer>>> {
        if self.contexts.reset_owner().is_some() {
            debug!("No Transfer allowed during reset, pid {}", ctx.pid);
            return Err(VkError::TransferDuringReset);
        }

        let hdr = MsgBlock::from_bytes(raw);
        let planes = (hdr.args[0] & trans_buf::PLANES_MASK) as usize;
        let direction = if hdr.args[0] & trans_buf::CMD_MASK == trans_buf::CMD_DOWNLOAD {
            DmaDirection::FromDevice
        } else {
            DmaDirection::ToDevice
        };

        let blocks = raw.len() / BLK_SIZE;
        if hdr.total_blocks() > blocks {
            return Err(VkError::SizeMismatch {
                blocks,
                declared: hdr.total_blocks(),
            });
        }
        let end = hdr.total_blocks() * BLK_SIZE;
        let start = end
            .checked_sub(planes * VK_DATA_SIZE)
            .ok_or_else(|| VkError::Dma(format!("{} planes do not fit the message", planes)))?;

        let mapper = self
            .dma
            .as_ref()
            .ok_or_else(|| VkError::Dma("no DMA mapper".into()))?;
        let dma = map_planes(mapper.as_ref(), direction, &mut raw[start..end], planes)?;

        if self.config.msgq.ib_sgl_size > 0 {
            let extra = self.append_ib_sgl(raw, &dma, start, q_num);
            if extra > 0 {
                let mut hdr = MsgBlock::from_bytes(raw);
                hdr.size += extra;
                hdr.write_bytes(raw);
            }
        }
        Ok(dma)
    }

    /// Append mapped SG lists after the message while the queue has at
    /// least its low watermark free; returns blocks added
    fn append_ib_sgl(
        &self,
        raw: &mut Vec<u8>,
        dma: &[Option<DmaBuffer>],
        descs: usize,
        q_num: usize,
    ) -> u32 {
        let avail = {
            let chan = self.h2vk.lock();
            match chan.queues.get(q_num) {
                Some(info) => {
                    let avail = RingView::new(self.hw.bar1.as_ref(), info).avail();
                    if avail < info.low {
                        debug!("Skip inserting inband SGL, [{:#x}/{:#x}]", avail, info.size);
                        return 0;
                    }
                    avail
                }
                None => return 0,
            }
        };

        let limit = self.config.msgq.ib_sgl_size;
        let mut ib_size = 0usize;
        let mut items = 0;
        for (i, buf) in dma.iter().enumerate() {
            let off = descs + i * VK_DATA_SIZE;
            let data = VkData::read(&raw[off..off + VK_DATA_SIZE]);
            let Some(buf) = buf else { continue };
            if data.address != 0 && ib_size + data.size as usize <= limit {
                raw.extend_from_slice(&buf.sglist);
                ib_size += buf.sglist.len();
                items += 1;
            }
        }

        debug!(
            "Num {} sgl items appended, size {:#x}, room {:#x}, avail {}",
            items, ib_size, limit, avail
        );

        let padded = raw.len().div_ceil(BLK_SIZE) * BLK_SIZE;
        raw.resize(padded, 0);
        (ib_size.div_ceil(BLK_SIZE)) as u32
    }
}

impl Session {
    pub fn context(&self) -> Option<Context> {
        self.ctx
    }

    /// Responses waiting to be read
    pub fn pending(&self) -> u32 {
        self.ctx.map_or(0, |c| self.dev.contexts.pending(c.idx))
    }

    /// Submit one message made of whole blocks; returns bytes consumed
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let dev = &self.dev;
        let ctx = self.ctx.ok_or(VkError::NotReady)?;
        if !dev.drv_access_ok() {
            return Err(VkError::NotReady);
        }

        debug!("Msg count {}", buf.len());
        if buf.len() % BLK_SIZE != 0 {
            error!("Failure with size {} not multiple of {}", buf.len(), BLK_SIZE);
            return Err(VkError::Misaligned(buf.len()));
        }
        if buf.is_empty() {
            return Err(VkError::SizeMismatch {
                blocks: 0,
                declared: 1,
            });
        }

        let mut raw = buf.to_vec();
        let mut hdr = MsgBlock::from_bytes(&raw);
        let blocks = raw.len() >> BLK_SZ_SHIFT;
        let q_num = hdr.queue();

        let q_size = dev
            .h2vk_queue(q_num as usize)
            .ok_or(VkError::InvalidQueue(q_num))?
            .size as usize;
        let ib_blks = dev.config.msgq.ib_sgl_size >> BLK_SZ_SHIFT;
        if blocks + ib_blks > q_size - 1 {
            error!(
                "Blk size {} exceed max queue size allowed {}",
                blocks,
                q_size - 1
            );
            return Err(VkError::QueueOverflow {
                blocks,
                max: q_size - 1,
            });
        }

        let usr_msg_id = hdr.msg_id();
        let msg_id = dev.msg_ids.allocate().map_err(|e| {
            error!("msg_id overflow");
            e
        })?;
        hdr.set_msg_id(msg_id);
        hdr.write_bytes(&mut raw);

        debug!(
            "Message ctx id {}, usr_msg_id {:#x} sent msg_id {:#x}",
            ctx.idx, usr_msg_id, msg_id
        );

        let mut dma = Vec::new();
        if hdr.function_id == fid::TRANS_BUF {
            match dev.prepare_transfer(&ctx, &mut raw, q_num as usize) {
                Ok(mapped) => dma = mapped,
                Err(e) => {
                    dev.msg_ids.release(msg_id);
                    return Err(e);
                }
            }
        }

        let to_v = blocks_from_bytes(&raw);
        let mut entry = WorkEntry::new(ctx, usr_msg_id, to_v.clone());
        entry.dma = dma;
        entry.seq = dev.seq.fetch_add(1, Ordering::Relaxed);

        // Must be findable before the card can answer
        dev.h2vk.pending.append(q_num as usize, entry, &dev.contexts);

        if let Err(e) = dev.enqueue(&to_v) {
            error!("Fail to enqueue msg to h2vk queue: {}", e);
            dev.h2vk
                .pending
                .find_and_remove(q_num as usize, msg_id, &dev.msg_ids);
            return Err(e);
        }

        Ok(buf.len())
    }

    /// Read the oldest response for this session
    ///
    /// When `buf` is too small the response stays queued; its first block
    /// (with `size` covering the whole response) is copied if it fits and
    /// `MessageTooLarge` reports the length needed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let dev = &self.dev;
        let ctx = self.ctx.ok_or(VkError::NotReady)?;
        if !dev.drv_access_ok() {
            return Err(VkError::NotReady);
        }

        debug!("Buf count {}", buf.len());
        match dev.vk2h.pending.take_response(&ctx, buf.len(), &dev.contexts) {
            Lookup::Ready(mut entry) => {
                let mut resp = entry.to_h.take().unwrap_or_default();
                if let Some(first) = resp.first_mut() {
                    first.set_msg_id(entry.usr_msg_id);
                }
                let bytes = blocks_to_bytes(&resp);
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Lookup::TooLarge { first, required } => {
                if buf.len() >= BLK_SIZE {
                    first.write_bytes(buf);
                }
                Err(VkError::MessageTooLarge { required })
            }
            Lookup::Empty => Err(VkError::NoMessage),
        }
    }

    /// Reset the card; this session's process becomes the reset owner
    /// until its last session closes
    pub fn reset(&self, grace: Duration) -> Result<()> {
        let ctx = self.ctx.ok_or(VkError::NotReady)?;
        self.dev.reset(ctx.pid, grace)
    }

    /// Close the session; returns the sessions its process still has open
    pub fn close(mut self) -> Result<usize> {
        match self.ctx.take() {
            Some(ctx) => self.dev.release(ctx),
            None => Ok(0),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            if let Err(e) = self.dev.release(ctx) {
                debug!("Session {} closed with {}", ctx.idx, e);
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("ctx", &self.ctx).finish()
    }
}
