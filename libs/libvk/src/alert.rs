//! Host and peer alert latching
//!
//! `notfs` collects raised bits as they are reported; `flags` is the last
//! state that was handled and logged. Both only clear on reset.

use bitflags::bitflags;
use spin::Mutex;
use tracing::{info, warn};

bitflags! {
    /// Alerts detected by the host side
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HostAlert: u32 {
        /// PCIe link down or ring corruption
        const PCIE_DOWN = 1 << 15;
        /// Card uptime stopped advancing
        const HB_FAIL = 1 << 14;
    }
}

bitflags! {
    /// Alerts reported by the card in its error-log register
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PeerAlert: u32 {
        const ECC = 1 << 0;
        const SSIM_BUSY = 1 << 1;
        const AFBC_BUSY = 1 << 2;
        const HIGH_TEMP = 1 << 3;
        const WDOG_TIMEOUT = 1 << 4;
        const SYS_FAULT = 1 << 5;
        const MEM_ALLOC_FAIL = 1 << 8;
        const LOW_TEMP = 1 << 9;
    }
}

/// Error-log register value when the interface is down
pub const ERR_LOG_INTF_DOWN: u32 = 0xFFFF_FFFF;

const ALERT_BITS: usize = 32;

#[derive(Debug, Default, Clone, Copy)]
struct Latch {
    flags: u32,
    notfs: u32,
    counts: [u32; ALERT_BITS],
}

/// Snapshot handed to the telemetry layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertState<T> {
    /// Bits raised and handled
    pub flags: T,
    /// Bits raised, handled or not
    pub notfs: T,
}

/// Latched alert bits with per-bit raise counters
pub struct Alerts<T> {
    name: &'static str,
    inner: Mutex<Latch>,
    _kind: std::marker::PhantomData<T>,
}

impl<T> Alerts<T>
where
    T: bitflags::Flags<Bits = u32> + Copy + std::fmt::Debug,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Latch::default()),
            _kind: std::marker::PhantomData,
        }
    }

    /// OR `bits` into the pending set; returns the bits that were new
    pub fn raise(&self, bits: T) -> T {
        let mut latch = self.inner.lock();
        let new = bits.bits() & !latch.notfs;
        latch.notfs |= bits.bits();
        T::from_bits_retain(new)
    }

    /// Replace the pending set with a fresh register snapshot
    pub fn report(&self, value: u32) {
        self.inner.lock().notfs = value;
    }

    /// Log and count every change since the last call, then latch
    pub fn handle(&self) -> T {
        let mut latch = self.inner.lock();
        let raised = latch.notfs & !latch.flags;
        let cleared = latch.flags & !latch.notfs;

        for bit in 0..ALERT_BITS {
            let mask = 1u32 << bit;
            if raised & mask != 0 {
                latch.counts[bit] = latch.counts[bit].saturating_add(1);
                warn!(
                    "ALERT! {}.{} {:?} raised (count {})",
                    self.name,
                    bit,
                    T::from_bits_retain(mask),
                    latch.counts[bit]
                );
            } else if cleared & mask != 0 {
                info!("ALERT! {}.{} {:?} cleared", self.name, bit, T::from_bits_retain(mask));
            }
        }

        latch.flags = latch.notfs;
        T::from_bits_retain(raised)
    }

    pub fn state(&self) -> AlertState<T> {
        let latch = self.inner.lock();
        AlertState {
            flags: T::from_bits_retain(latch.flags),
            notfs: T::from_bits_retain(latch.notfs),
        }
    }

    /// Times `alert` has been raised since the last reset
    pub fn count(&self, alert: T) -> u32 {
        let latch = self.inner.lock();
        let bits = alert.bits();
        (0..ALERT_BITS)
            .filter(|b| bits & (1 << b) != 0)
            .map(|b| latch.counts[b])
            .sum()
    }

    /// Forget every bit and counter
    pub fn clear(&self) {
        *self.inner.lock() = Latch::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_reports_new_bits() {
        let alerts = Alerts::<HostAlert>::new("host");
        assert_eq!(alerts.raise(HostAlert::HB_FAIL), HostAlert::HB_FAIL);
        assert_eq!(alerts.raise(HostAlert::HB_FAIL), HostAlert::empty());
        assert_eq!(
            alerts.raise(HostAlert::HB_FAIL | HostAlert::PCIE_DOWN),
            HostAlert::PCIE_DOWN
        );
    }

    #[test]
    fn test_handle_counts_once() {
        let alerts = Alerts::<PeerAlert>::new("peer");
        alerts.report((PeerAlert::HIGH_TEMP | PeerAlert::ECC).bits());
        assert_eq!(alerts.handle(), PeerAlert::HIGH_TEMP | PeerAlert::ECC);
        assert_eq!(alerts.handle(), PeerAlert::empty());
        assert_eq!(alerts.count(PeerAlert::HIGH_TEMP), 1);

        alerts.report(0);
        alerts.handle();
        alerts.report(PeerAlert::HIGH_TEMP.bits());
        alerts.handle();
        assert_eq!(alerts.count(PeerAlert::HIGH_TEMP), 2);
        assert_eq!(alerts.state().flags, PeerAlert::HIGH_TEMP);
    }

    #[test]
    fn test_clear() {
        let alerts = Alerts::<HostAlert>::new("host");
        alerts.raise(HostAlert::PCIE_DOWN);
        alerts.handle();
        alerts.clear();
        assert_eq!(alerts.state().notfs, HostAlert::empty());
        assert_eq!(alerts.count(HostAlert::PCIE_DOWN), 0);
    }
}
