//! Shared-memory ring view
//!
//! Each queue is described by a 24-byte control record in BAR1 followed
//! (somewhere in BAR1) by `size` blocks of storage. Indices in the record
//! are written by both sides and are untrusted: every index is masked
//! before it addresses memory, and callers validate the raw value.
//!
//! Memory ordering:
//! - index reads are followed by an acquire fence so block contents read
//!   afterwards are at least as new as the index
//! - the write index is published after a release fence so the card never
//!   sees the index ahead of the blocks
//! - the read index is published between full fences since the dequeue
//!   path both consumes card data and hands slots back

use super::Bar;
use crate::msg::{MsgBlock, BLK_SIZE, BLK_WORDS};
use std::sync::atomic::{fence, Ordering};

/// Size of one queue control record
pub const QUEUE_RECORD_SIZE: usize = 24;

// Control record layout
const REC_TYPE_NUM: usize = 0;
const REC_START: usize = 4;
const REC_RD_IDX: usize = 8;
const REC_WR_IDX: usize = 12;
const REC_SIZE: usize = 16;
const REC_NXT: usize = 20;

/// Cached geometry of one queue, captured at sync time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    /// Offset of the control record in BAR1
    pub ctrl_off: usize,
    pub q_type: u16,
    pub num: u16,
    /// Offset of block storage in BAR1
    pub start: usize,
    /// Size in blocks (power of two)
    pub size: u32,
    /// `size - 1`
    pub mask: u32,
    /// Low watermark, half the queue
    pub low: u32,
}

impl QueueInfo {
    /// Read the control record at `ctrl_off`, returning it along with the
    /// offset of the record that follows
    pub fn read_record(bar: &dyn Bar, ctrl_off: usize) -> (Self, u32, usize) {
        let type_num = bar.read32(ctrl_off + REC_TYPE_NUM);
        let size = bar.read32(ctrl_off + REC_SIZE);
        let nxt = bar.read32(ctrl_off + REC_NXT);
        let info = Self {
            ctrl_off,
            q_type: (type_num & 0xFFFF) as u16,
            num: (type_num >> 16) as u16,
            start: bar.read32(ctrl_off + REC_START) as usize,
            size,
            mask: size.wrapping_sub(1),
            low: size >> 1,
        };
        let next = ctrl_off
            .saturating_add(QUEUE_RECORD_SIZE)
            .saturating_add(nxt as usize);
        (info, nxt, next)
    }

    /// Bytes of block storage
    pub fn storage_len(&self) -> usize {
        self.size as usize * BLK_SIZE
    }

    /// Blocks in use between `rd` and `wr`
    pub fn occupied(&self, rd: u32, wr: u32) -> u32 {
        wr.wrapping_sub(rd) & self.mask
    }

    /// Free blocks between `rd` and `wr`; one slot always stays empty
    pub fn avail(&self, rd: u32, wr: u32) -> u32 {
        self.size - self.occupied(rd, wr) - 1
    }

    /// Advance an index by `n` with wrap
    pub fn inc(&self, idx: u32, n: u32) -> u32 {
        idx.wrapping_add(n) & self.mask
    }
}

/// Typed access to one queue in BAR1
pub struct RingView<'a> {
    bar: &'a dyn Bar,
    info: &'a QueueInfo,
}

impl<'a> RingView<'a> {
    pub fn new(bar: &'a dyn Bar, info: &'a QueueInfo) -> Self {
        Self { bar, info }
    }

    pub fn info(&self) -> &QueueInfo {
        self.info
    }

    /// Raw read index as published in shared memory
    pub fn read_index(&self) -> u32 {
        let idx = self.bar.read32(self.info.ctrl_off + REC_RD_IDX);
        fence(Ordering::Acquire);
        idx
    }

    /// Raw write index as published in shared memory
    pub fn write_index(&self) -> u32 {
        let idx = self.bar.read32(self.info.ctrl_off + REC_WR_IDX);
        fence(Ordering::Acquire);
        idx
    }

    /// Make blocks written so far visible, then publish the write index
    pub fn publish_write_index(&self, idx: u32) {
        fence(Ordering::Release);
        self.bar
            .write32(self.info.ctrl_off + REC_WR_IDX, idx & self.info.mask);
    }

    /// Publish the read index with full ordering on both sides
    pub fn publish_read_index(&self, idx: u32) {
        fence(Ordering::SeqCst);
        self.bar
            .write32(self.info.ctrl_off + REC_RD_IDX, idx & self.info.mask);
        fence(Ordering::SeqCst);
    }

    fn block_off(&self, idx: u32) -> usize {
        self.info.start + (idx & self.info.mask) as usize * BLK_SIZE
    }

    /// Read the block at `idx` (masked)
    pub fn read_block(&self, idx: u32) -> MsgBlock {
        let base = self.block_off(idx);
        let mut w = [0u32; BLK_WORDS];
        for (i, word) in w.iter_mut().enumerate() {
            *word = self.bar.read32(base + i * 4);
        }
        MsgBlock::from_words(w)
    }

    /// Write `blk` at `idx` (masked)
    pub fn write_block(&self, idx: u32, blk: &MsgBlock) {
        let base = self.block_off(idx);
        for (i, word) in blk.to_words().iter().enumerate() {
            self.bar.write32(base + i * 4, *word);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read_index() == self.write_index()
    }

    pub fn occupied(&self) -> u32 {
        self.info.occupied(self.read_index(), self.write_index())
    }

    pub fn avail(&self) -> u32 {
        self.info.avail(self.read_index(), self.write_index())
    }
}
