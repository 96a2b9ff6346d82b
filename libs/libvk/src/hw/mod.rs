//! Hardware access layer
//!
//! Everything the transport knows about the card goes through a [`Bar`]:
//! a 32-bit register window. Real hardware is an mmap of the PCI resource
//! file ([`MmioBar`]); tests and simulation use [`MemBar`].

mod mem;
mod mmio;
mod ring;

pub use mem::MemBar;
pub use mmio::MmioBar;
pub use ring::{QueueInfo, RingView, QUEUE_RECORD_SIZE};

use std::sync::Arc;

/// Value read back from a window when the link is down or the offset is bad
pub const BAR_DEAD: u32 = 0xFFFF_FFFF;

/// A 32-bit register window into card memory
pub trait Bar: Send + Sync {
    /// Window size in bytes
    fn len(&self) -> usize;

    /// Read a 32-bit word; out-of-range reads return [`BAR_DEAD`]
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit word; out-of-range writes are dropped
    fn write32(&self, offset: usize, value: u32);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check that a 32-bit access at `offset` fits in a window of `len` bytes
pub(crate) fn word_in_range(offset: usize, len: usize) -> bool {
    offset % 4 == 0 && offset.checked_add(4).map_or(false, |end| end <= len)
}

/// The two windows the transport uses
#[derive(Clone)]
pub struct Hardware {
    /// Register segment: status, doorbells, uptime
    pub bar0: Arc<dyn Bar>,
    /// Shared memory: queue definitions and ring storage
    pub bar1: Arc<dyn Bar>,
}

impl Hardware {
    pub fn new(bar0: Arc<dyn Bar>, bar1: Arc<dyn Bar>) -> Self {
        Self { bar0, bar1 }
    }
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("bar0_len", &self.bar0.len())
            .field("bar1_len", &self.bar1.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_in_range() {
        assert!(word_in_range(0, 4));
        assert!(word_in_range(4, 8));
        assert!(!word_in_range(6, 16));
        assert!(!word_in_range(8, 8));
        assert!(!word_in_range(usize::MAX - 1, usize::MAX));
    }
}
