//! Pending request tables
//!
//! Each direction keeps one list per queue. An entry sits on the host to
//! card table from just before it is enqueued until its response is
//! dequeued; it then moves to the card to host table until the owning
//! session reads it.

use crate::context::{Context, ContextRegistry};
use crate::dma::DmaBuffer;
use crate::msg::{MsgBlock, BLK_SIZE};
use crate::msgid::MsgIdAllocator;
use crate::regs::MSGQ_MAX_NR;
use spin::Mutex;
use std::collections::VecDeque;
use tracing::info;

/// One in-flight message
#[derive(Debug)]
pub struct WorkEntry {
    /// Owning session
    pub ctx: Context,
    /// Message id the application used, restored on read
    pub usr_msg_id: u16,
    /// Debug sequence number, assigned at enqueue
    pub seq: u32,
    /// Outbound blocks, header first
    pub to_v: Vec<MsgBlock>,
    /// Response blocks once matched
    pub to_h: Option<Vec<MsgBlock>>,
    /// Buffers mapped for a transfer, one per plane
    pub dma: Vec<Option<DmaBuffer>>,
}

impl WorkEntry {
    pub fn new(ctx: Context, usr_msg_id: u16, to_v: Vec<MsgBlock>) -> Self {
        Self {
            ctx,
            usr_msg_id,
            seq: 0,
            to_v,
            to_h: None,
            dma: Vec::new(),
        }
    }

    /// Header of the outbound message
    pub fn header(&self) -> MsgBlock {
        self.to_v.first().copied().unwrap_or_default()
    }

    /// Message id the card sees
    pub fn msg_id(&self) -> u16 {
        self.header().msg_id()
    }

    pub fn responded(&self) -> bool {
        self.to_h.is_some()
    }

    /// Response length in bytes
    pub fn response_len(&self) -> usize {
        self.to_h.as_ref().map_or(0, |r| r.len() * BLK_SIZE)
    }
}

/// Result of looking up a response for a session
#[derive(Debug)]
pub enum Lookup {
    /// Removed from the table, ready to hand out
    Ready(WorkEntry),
    /// Left on the table; the caller's buffer is too small
    TooLarge {
        /// First response block with the application's message id
        first: MsgBlock,
        /// Bytes needed for the whole response
        required: usize,
    },
    Empty,
}

/// Per-queue pending lists for one direction
pub struct PendingTable {
    queues: Mutex<Vec<VecDeque<WorkEntry>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new((0..MSGQ_MAX_NR).map(|_| VecDeque::new()).collect()),
        }
    }

    /// Append to the tail of queue `q_num`'s list
    ///
    /// An answered entry counts towards its session's pending responses
    /// while the table lock is held, so a reader cannot take it uncounted.
    pub fn append(&self, q_num: usize, entry: WorkEntry, contexts: &ContextRegistry) {
        let mut queues = self.queues.lock();
        if let Some(list) = queues.get_mut(q_num) {
            if entry.responded() {
                contexts.pend_inc(entry.ctx.idx);
            }
            list.push_back(entry);
        }
    }

    /// Remove the entry carrying `msg_id` and release the id
    pub fn find_and_remove(
        &self,
        q_num: usize,
        msg_id: u16,
        ids: &MsgIdAllocator,
    ) -> Option<WorkEntry> {
        let mut queues = self.queues.lock();
        let list = queues.get_mut(q_num)?;
        let pos = list.iter().position(|e| e.msg_id() == msg_id)?;
        ids.release(msg_id);
        list.remove(pos)
    }

    /// Take the oldest response for `ctx`, scanning queues in priority
    /// order; only the first match is considered
    pub fn take_response(
        &self,
        ctx: &Context,
        max_len: usize,
        contexts: &ContextRegistry,
    ) -> Lookup {
        let mut queues = self.queues.lock();
        for list in queues.iter_mut() {
            let Some(pos) = list.iter().position(|e| e.ctx.idx == ctx.idx) else {
                continue;
            };

            let required = list[pos].response_len();
            if max_len >= required {
                return match list.remove(pos) {
                    Some(entry) => {
                        contexts.pend_dec(ctx.idx);
                        Lookup::Ready(entry)
                    }
                    None => Lookup::Empty,
                };
            }

            let entry = &list[pos];
            let blocks = entry.to_h.as_deref().unwrap_or_default();
            let mut first = blocks.first().copied().unwrap_or_default();
            first.set_msg_id(entry.usr_msg_id);
            first.size = blocks.len().saturating_sub(1) as u32;
            return Lookup::TooLarge { first, required };
        }
        Lookup::Empty
    }

    /// Empty the table, or only `ctx`'s entries when given
    ///
    /// Unanswered entries give their message id back and answered ones
    /// drop their session's pending count. A session drain logs every
    /// entry.
    pub fn drain_all(
        &self,
        ctx: Option<&Context>,
        ids: &MsgIdAllocator,
        contexts: &ContextRegistry,
    ) -> Vec<WorkEntry> {
        let mut drained = Vec::new();
        {
            let mut queues = self.queues.lock();
            for list in queues.iter_mut() {
                let (take, keep): (VecDeque<_>, VecDeque<_>) = list
                    .drain(..)
                    .partition(|e| ctx.map_or(true, |c| e.ctx.idx == c.idx));
                *list = keep;
                for entry in take.iter().filter(|e| e.responded()) {
                    contexts.pend_dec(entry.ctx.idx);
                }
                drained.extend(take);
            }
        }

        for entry in &drained {
            let msg = entry.header();
            let msg_id = msg.msg_id();
            let bit_set = ids.is_allocated(msg_id);
            if ctx.is_some() {
                info!(
                    "Drained: fid {} size {} msg {:#x}(seq-{:x}) ctx {:#x}[fd-{}] args:[{:#x} {:#x}] resp {}, bmap {}",
                    msg.function_id,
                    msg.size,
                    msg_id,
                    entry.seq,
                    msg.context_id,
                    entry.ctx.idx,
                    msg.args[0],
                    msg.args[1],
                    if entry.responded() { "T" } else { "F" },
                    bit_set as u8,
                );
            }
            if !entry.responded() && bit_set {
                ids.release(msg_id);
            }
        }

        if !drained.is_empty() {
            info!("Total drained items {}", drained.len());
        }
        drained
    }

    /// Entries across all queues
    pub fn len(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ctx: Context, ids: &MsgIdAllocator, blocks: usize) -> WorkEntry {
        let mut hdr = MsgBlock::new(1);
        hdr.size = blocks as u32 - 1;
        hdr.set_msg_id(ids.allocate().unwrap());
        let mut to_v = vec![MsgBlock::default(); blocks];
        to_v[0] = hdr;
        WorkEntry::new(ctx, 0x42, to_v)
    }

    #[test]
    fn test_find_and_remove_releases_id() {
        let ids = MsgIdAllocator::new(16);
        let table = PendingTable::new();
        let ctx = Context { idx: 0, pid: 1 };

        let e = entry(ctx, &ids, 1);
        let id = e.msg_id();
        table.append(1, e, &ContextRegistry::new());

        assert!(table.find_and_remove(0, id, &ids).is_none());
        assert!(ids.is_allocated(id));

        let found = table.find_and_remove(1, id, &ids).unwrap();
        assert_eq!(found.usr_msg_id, 0x42);
        assert!(!ids.is_allocated(id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_take_response_too_large() {
        let ids = MsgIdAllocator::new(16);
        let contexts = ContextRegistry::new();
        let table = PendingTable::new();
        let ctx = contexts.acquire(1).unwrap();

        let mut e = entry(ctx, &ids, 1);
        let mut resp = vec![MsgBlock::new(9); 3];
        resp[0].set_msg_id(e.msg_id());
        e.to_h = Some(resp);
        table.append(2, e, &contexts);
        assert_eq!(contexts.pending(ctx.idx), 1);

        match table.take_response(&ctx, BLK_SIZE, &contexts) {
            Lookup::TooLarge { first, required } => {
                assert_eq!(required, 3 * BLK_SIZE);
                assert_eq!(first.size, 2);
                assert_eq!(first.msg_id(), 0x42);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.len(), 1);
        assert_eq!(contexts.pending(ctx.idx), 1);

        assert!(matches!(
            table.take_response(&ctx, 3 * BLK_SIZE, &contexts),
            Lookup::Ready(_)
        ));
        assert_eq!(contexts.pending(ctx.idx), 0);
        assert!(matches!(
            table.take_response(&ctx, 1024, &contexts),
            Lookup::Empty
        ));
    }

    #[test]
    fn test_take_response_priority_order() {
        let ids = MsgIdAllocator::new(16);
        let contexts = ContextRegistry::new();
        let table = PendingTable::new();
        let ctx = contexts.acquire(1).unwrap();

        for q in [2usize, 0] {
            let mut e = entry(ctx, &ids, 1);
            e.seq = q as u32;
            e.to_h = Some(vec![MsgBlock::new(q as u32)]);
            table.append(q, e, &contexts);
        }

        match table.take_response(&ctx, 1024, &contexts) {
            Lookup::Ready(e) => assert_eq!(e.seq, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(contexts.pending(ctx.idx), 1);
    }

    #[test]
    fn test_unanswered_entry_not_counted() {
        let ids = MsgIdAllocator::new(16);
        let contexts = ContextRegistry::new();
        let table = PendingTable::new();
        let ctx = contexts.acquire(1).unwrap();

        table.append(0, entry(ctx, &ids, 1), &contexts);
        assert_eq!(contexts.pending(ctx.idx), 0);
    }

    #[test]
    fn test_pending_count_under_concurrent_read() {
        const ROUNDS: usize = 2000;

        let contexts = std::sync::Arc::new(ContextRegistry::new());
        let table = std::sync::Arc::new(PendingTable::new());
        let ctx = contexts.acquire(1).unwrap();

        let producer = {
            let contexts = contexts.clone();
            let table = table.clone();
            std::thread::spawn(move || {
                for i in 0..ROUNDS {
                    let mut e = WorkEntry::new(ctx, i as u16, vec![MsgBlock::new(1)]);
                    e.to_h = Some(vec![MsgBlock::new(1)]);
                    table.append(i % MSGQ_MAX_NR, e, &contexts);
                }
            })
        };

        let mut taken = 0;
        while taken < ROUNDS {
            match table.take_response(&ctx, 1024, &contexts) {
                Lookup::Ready(_) => taken += 1,
                _ => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();

        assert!(table.is_empty());
        assert_eq!(contexts.pending(ctx.idx), 0);
    }

    #[test]
    fn test_drain_by_context() {
        let ids = MsgIdAllocator::new(16);
        let contexts = ContextRegistry::new();
        let table = PendingTable::new();
        let mine = contexts.acquire(1).unwrap();
        let other = contexts.acquire(2).unwrap();

        table.append(0, entry(mine, &ids, 1), &contexts);
        table.append(1, entry(other, &ids, 2), &contexts);
        let mut answered = entry(mine, &ids, 1);
        ids.release(answered.msg_id());
        answered.to_h = Some(vec![MsgBlock::default()]);
        table.append(1, answered, &contexts);
        assert_eq!(contexts.pending(mine.idx), 1);

        let drained = table.drain_all(Some(&mine), &ids, &contexts);
        assert_eq!(drained.len(), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(ids.in_use(), 1);
        assert_eq!(contexts.pending(mine.idx), 0);

        assert!(table.drain_all(Some(&mine), &ids, &contexts).is_empty());
        assert_eq!(table.drain_all(None, &ids, &contexts).len(), 1);
        assert_eq!(ids.in_use(), 0);
    }
}
