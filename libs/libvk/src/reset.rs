//! Reset orchestration
//!
//! Sequence:
//! - claim ownership (first caller wins, others are refused untouched)
//! - send a card-level graceful shutdown
//! - wait for the card to stop its DMA and wrap up
//! - kill every other process holding a session
//! - drain, clear card-facing registers and press the reset doorbell
//!
//! The owner stays registered, and new sessions stay refused, until the
//! owner's last session closes. A close that lands mid-sequence leaves the
//! reset running; the sequence itself ends it once the card is reset.

use crate::device::VkDevice;
use crate::error::{Result, VkError};
use crate::regs::{bar0, bar1, codepush, fb_open, fw_status, shutdown};
use crate::qstats::QueueStats;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a reset currently stands
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ResetPhase {
    #[default]
    Normal,
    ShutdownRequested,
    GracePeriod,
    ForceKillSessions,
    HardwareReset,
    /// Reset done; waiting for the owner's last session to close
    Cleared,
}

/// Terminates processes that still hold sessions during a reset
pub trait SessionSignaller: Send + Sync {
    fn kill(&self, pid: u32) -> Result<()>;
}

/// Sends SIGKILL
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl SessionSignaller for NixSignaller {
    fn kill(&self, pid: u32) -> Result<()> {
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| VkError::Io(e.into()))
    }
}

impl VkDevice {
    pub fn reset_phase(&self) -> ResetPhase {
        *self.reset_phase.lock()
    }

    fn set_phase(&self, phase: ResetPhase) {
        debug!("Reset phase {:?}", phase);
        *self.reset_phase.lock() = phase;
    }

    /// Reset the card on behalf of `pid`, which must hold an open session
    pub(crate) fn reset(&self, pid: u32, grace: Duration) -> Result<()> {
        let grace = self.config.reset.grace(grace);
        info!("Issue Reset by pid {}, grace {:?}", pid, grace);

        self.contexts.claim_reset(pid)?;
        self.set_phase(ResetPhase::ShutdownRequested);

        if let Err(e) = self.send_shutdown(shutdown::GRACEFUL, 0) {
            warn!("Graceful shutdown not delivered: {}", e);
        }

        self.set_phase(ResetPhase::GracePeriod);
        std::thread::sleep(grace);

        self.set_phase(ResetPhase::ForceKillSessions);
        for victim in self.contexts.foreign_pids() {
            debug!("Send kill signal to pid {}", victim);
            if let Err(e) = self.signaller.kill(victim) {
                warn!("Failed to kill pid {}: {}", victim, e);
            }
        }

        self.set_phase(ResetPhase::HardwareReset);
        self.trigger_reset();
        std::thread::sleep(self.config.reset.settle());

        let ram_open = self.hw.bar0.read32(bar0::FB_OPEN);
        info!(
            "Reset completed - RB_OPEN = {:#x} SRAM_OPEN {} DDR_OPEN {}",
            ram_open,
            ram_open & fb_open::SRAM_OPEN != 0,
            ram_open & fb_open::DDR_OPEN != 0
        );

        let mut phase = self.reset_phase.lock();
        if self.contexts.has_sessions(pid) {
            *phase = ResetPhase::Cleared;
        } else {
            // The owner closed its last session while the reset ran
            self.contexts.clear_reset_owner(pid);
            *phase = ResetPhase::Normal;
        }
        debug!("Reset phase {:?}", *phase);
        Ok(())
    }

    /// Handle the last close of `pid`; returns whether `pid` owns the reset
    ///
    /// Once the card has been reset this ends the reset. Before that the
    /// owner stays registered and `reset` ends it on completion.
    pub(crate) fn end_reset(&self, pid: u32) -> bool {
        let mut phase = self.reset_phase.lock();
        if self.contexts.reset_owner() != Some(pid) {
            return false;
        }
        if *phase == ResetPhase::Cleared {
            self.contexts.clear_reset_owner(pid);
            *phase = ResetPhase::Normal;
            debug!("Reset phase {:?}", *phase);
        } else {
            debug!("Owner pid {} left during {:?}", pid, *phase);
        }
        true
    }

    /// Drop all transport state and ask the card to reset
    pub fn trigger_reset(&self) {
        self.blk_drv_access();

        self.h2vk.pending.drain_all(None, &self.msg_ids, &self.contexts);
        self.vk2h.pending.drain_all(None, &self.msg_ids, &self.contexts);

        let bar1 = self.hw.bar1.as_ref();
        bar1.write32(bar1::MSGQ_DEF_RDY, 0);
        bar1.write32(bar1::BOOT1_VER_TAG, 0);
        for i in 0..bar1::DAUTH_MAX {
            bar1.write32(bar1::dauth_store(i), 0);
            bar1.write32(bar1::dauth_valid(i), 0);
        }
        for i in 0..bar1::SOTP_REVID_MAX {
            bar1.write32(bar1::sotp_revid(i), 0);
        }

        // A failed boot leaves the codepush entry set; clear it so the ROM
        // waits for a fresh codepush instead of retrying
        let bar0 = self.hw.bar0.as_ref();
        let value = bar0.read32(bar0::CODEPUSH_SBL) & !codepush::MASK;
        bar0.write32(bar0::CODEPUSH_SBL, value);

        bar0.write32(bar0::FW_STATUS, fw_status::RESET_MBOX_DB);
        self.doorbell(bar0::RESET_DB_NUM, bar0::RESET_DB_SOFT);

        bar0.write32(bar0::OS_UPTIME, 0);
        self.host_alert.clear();
        self.peer_alert.clear();
        for chan in [&self.h2vk, &self.vk2h] {
            chan.lock().stats = [QueueStats::default(); crate::regs::MSGQ_MAX_NR];
        }
        *self.hb.lock() = Default::default();
        self.msg_ids.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::HostAlert;
    use crate::config::VkConfig;
    use crate::hw::{Bar, Hardware, MemBar};
    use std::sync::Arc;

    fn device() -> (Arc<MemBar>, Arc<MemBar>, Arc<VkDevice>) {
        let bar0 = Arc::new(MemBar::new(0x1000));
        let bar1 = Arc::new(MemBar::new(0x8000));
        let mut config = VkConfig::default();
        config.reset.min_grace_secs = 0;
        config.reset.settle_ms = 0;
        let dev = VkDevice::builder(Hardware::new(bar0.clone(), bar1.clone()))
            .config(config)
            .build();
        (bar0, bar1, dev)
    }

    #[test]
    fn test_trigger_reset_registers() {
        let (bar0, bar1, dev) = device();
        bar0.write32(bar0::CODEPUSH_SBL, 0x1234_5678);
        bar0.write32(bar0::OS_UPTIME, 99);
        bar1.write32(bar1::MSGQ_DEF_RDY, bar1::MSGQ_RDY_MARKER);
        bar1.write32(bar1::dauth_valid(3), 1);
        dev.set_host_alert(HostAlert::HB_FAIL);
        dev.msg_ids.allocate().unwrap();

        dev.trigger_reset();

        assert_eq!(bar0.read32(bar0::CODEPUSH_SBL), 0x678);
        assert_eq!(bar0.read32(bar0::FW_STATUS), fw_status::RESET_MBOX_DB);
        assert_eq!(bar0.read32(bar0::doorbell(3)), 0xFFFF_FFFF);
        assert_eq!(bar0.read32(bar0::OS_UPTIME), 0);
        assert_eq!(bar1.read32(bar1::MSGQ_DEF_RDY), 0);
        assert_eq!(bar1.read32(bar1::dauth_valid(3)), 0);
        assert_eq!(dev.host_alerts().notfs, HostAlert::empty());
        assert_eq!(dev.msg_ids_in_use(), 0);
        assert!(!dev.drv_access_ok());
    }

    #[test]
    fn test_reset_phases() {
        let (_bar0, _bar1, dev) = device();
        let session = dev.open(77).unwrap();
        assert_eq!(dev.reset_phase(), ResetPhase::Normal);

        dev.reset(77, Duration::ZERO).unwrap();
        assert_eq!(dev.reset_phase(), ResetPhase::Cleared);
        assert_eq!(dev.reset_owner(), Some(77));
        assert!(matches!(dev.open(78), Err(VkError::InReset(77))));

        // Access is blocked after reset, so the close reports it, but the
        // reset still ends
        assert!(matches!(session.close(), Err(VkError::NotReady)));
        assert_eq!(dev.reset_owner(), None);
        assert_eq!(dev.reset_phase(), ResetPhase::Normal);
        assert!(dev.open(78).is_ok());
    }

    #[test]
    fn test_reset_needs_session() {
        let (_bar0, _bar1, dev) = device();
        assert!(matches!(
            dev.reset(999, Duration::ZERO),
            Err(VkError::NoSession(999))
        ));
        assert_eq!(dev.reset_owner(), None);
        assert_eq!(dev.reset_phase(), ResetPhase::Normal);
        assert!(dev.open(1).is_ok());
    }

    #[test]
    fn test_owner_close_during_grace() {
        let (_bar0, _bar1, dev) = device();
        let session = dev.open(77).unwrap();

        let resetter = {
            let dev = dev.clone();
            std::thread::spawn(move || dev.reset(77, Duration::from_millis(300)))
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while dev.reset_phase() != ResetPhase::GracePeriod
            && std::time::Instant::now() < deadline
        {
            std::thread::yield_now();
        }
        assert_eq!(dev.reset_phase(), ResetPhase::GracePeriod);

        // The owner leaves mid-reset: the reset keeps running and owning
        // the registry
        assert!(matches!(session.close(), Err(VkError::NotReady)));
        assert_eq!(dev.reset_owner(), Some(77));
        assert_ne!(dev.reset_phase(), ResetPhase::Normal);
        assert!(matches!(dev.open(78), Err(VkError::InReset(77))));

        resetter.join().unwrap().unwrap();
        assert_eq!(dev.reset_owner(), None);
        assert_eq!(dev.reset_phase(), ResetPhase::Normal);
        assert!(dev.open(78).is_ok());
    }
}
