//! In-memory register window

use super::{word_in_range, Bar, BAR_DEAD};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Atomics-backed window standing in for card memory
pub struct MemBar {
    words: Box<[AtomicU32]>,
}

impl MemBar {
    /// Create a zeroed window of `len` bytes (rounded down to whole words)
    pub fn new(len: usize) -> Self {
        let words = (0..len / 4).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    /// Fill the whole window with `value`
    pub fn fill(&self, value: u32) {
        for word in self.words.iter() {
            word.store(value, Ordering::Relaxed);
        }
    }
}

impl Bar for MemBar {
    fn len(&self) -> usize {
        self.words.len() * 4
    }

    fn read32(&self, offset: usize) -> u32 {
        if !word_in_range(offset, self.len()) {
            return BAR_DEAD;
        }
        self.words[offset / 4].load(Ordering::Relaxed)
    }

    fn write32(&self, offset: usize, value: u32) {
        if !word_in_range(offset, self.len()) {
            warn!("Dropping write of {:#x} to offset {:#x}", value, offset);
            return;
        }
        self.words[offset / 4].store(value, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MemBar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBar").field("len", &self.len()).finish()
    }
}
