//! Message id allocator
//!
//! Ids are handed out round-robin starting after the last issued id, so a
//! freshly released id is not reused immediately. Id 0 is reserved for
//! one-way messages and is never allocated.

use crate::error::{Result, VkError};
use spin::Mutex;

/// Ids tracked by the device bitmap
pub const MSG_ID_BITMAP_SIZE: usize = 4096;

struct Bitmap {
    words: Vec<u64>,
    last: usize,
}

impl Bitmap {
    fn test(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1 << (bit % 64));
    }
}

/// Bitmap-backed transaction id allocator
pub struct MsgIdAllocator {
    size: usize,
    inner: Mutex<Bitmap>,
}

impl MsgIdAllocator {
    /// Create an allocator for ids `1..size`
    pub fn new(size: usize) -> Self {
        let size = size.clamp(2, MSG_ID_BITMAP_SIZE);
        Self {
            size,
            inner: Mutex::new(Bitmap {
                words: vec![0; size.div_ceil(64)],
                last: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.size - 1
    }

    /// Claim the next free id after the last one issued
    pub fn allocate(&self) -> Result<u16> {
        let mut bmap = self.inner.lock();
        for _ in 0..self.size - 1 {
            bmap.last += 1;
            if bmap.last == self.size {
                bmap.last = 1;
            }
            let id = bmap.last;
            if !bmap.test(id) {
                bmap.set(id);
                return Ok(id as u16);
            }
        }
        Err(VkError::MsgIdOverflow)
    }

    /// Return an id to the pool
    pub fn release(&self, id: u16) {
        let id = id as usize;
        if id < self.size {
            self.inner.lock().clear(id);
        }
    }

    pub fn is_allocated(&self, id: u16) -> bool {
        let id = id as usize;
        id < self.size && self.inner.lock().test(id)
    }

    /// Number of ids currently claimed
    pub fn in_use(&self) -> usize {
        self.inner
            .lock()
            .words
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    /// Clear every id; the round-robin position is kept
    pub fn clear_all(&self) {
        self.inner.lock().words.iter_mut().for_each(|w| *w = 0);
    }
}

impl Default for MsgIdAllocator {
    fn default() -> Self {
        Self::new(MSG_ID_BITMAP_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_robin() {
        let ids = MsgIdAllocator::new(8);
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 2);
        assert_eq!(ids.allocate().unwrap(), 3);
        ids.release(2);
        assert_eq!(ids.allocate().unwrap(), 4);
    }

    #[test]
    fn test_overflow_and_wrap() {
        let ids = MsgIdAllocator::new(8);
        for expected in 1..8 {
            assert_eq!(ids.allocate().unwrap(), expected);
        }
        assert!(matches!(ids.allocate(), Err(VkError::MsgIdOverflow)));

        ids.release(3);
        assert_eq!(ids.allocate().unwrap(), 3);
        assert_eq!(ids.in_use(), 7);
    }

    #[test]
    fn test_clear_all() {
        let ids = MsgIdAllocator::new(16);
        for _ in 0..5 {
            ids.allocate().unwrap();
        }
        ids.clear_all();
        assert_eq!(ids.in_use(), 0);
        assert_eq!(ids.allocate().unwrap(), 6);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc,
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Alloc), (0usize..64).prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn test_live_ids_unique(ops in proptest::collection::vec(op(), 1..400)) {
            let ids = MsgIdAllocator::new(32);
            let mut live: Vec<u16> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc => match ids.allocate() {
                        Ok(id) => {
                            prop_assert_ne!(id, 0);
                            prop_assert!(!live.contains(&id));
                            live.push(id);
                        }
                        Err(_) => prop_assert_eq!(live.len(), ids.capacity()),
                    },
                    Op::Release(i) if !live.is_empty() => {
                        let id = live.swap_remove(i % live.len());
                        ids.release(id);
                    }
                    Op::Release(_) => {}
                }
            }

            let unique: HashSet<_> = live.iter().collect();
            prop_assert_eq!(unique.len(), ids.in_use());
        }
    }
}
