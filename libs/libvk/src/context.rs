//! Session context registry
//!
//! One slot per open session, indexed by a small pid hash so the last
//! session of a process can be detected on close. The same lock guards the
//! reset owner: a registry with an owner refuses new sessions.

use crate::error::{Result, VkError};
use crate::regs::{CTX_MAX, PID_HT_SHIFT, PID_HT_SZ};
use spin::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error};

/// Handle for one open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    /// Slot index, used to match pending entries
    pub idx: usize,
    /// Owning process
    pub pid: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    in_use: bool,
    pid: u32,
}

struct Registry {
    slots: Vec<Slot>,
    buckets: Vec<Vec<usize>>,
    reset_pid: Option<u32>,
}

/// Golden-ratio multiplicative hash over `PID_HT_SHIFT` bits
pub fn pid_hash(pid: u32) -> usize {
    (pid.wrapping_mul(0x61C8_8647) >> (32 - PID_HT_SHIFT)) as usize
}

/// Fixed pool of session contexts
pub struct ContextRegistry {
    inner: Mutex<Registry>,
    pend_cnt: Vec<AtomicU32>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::with_capacity(CTX_MAX)
    }

    pub fn with_capacity(slots: usize) -> Self {
        Self {
            inner: Mutex::new(Registry {
                slots: vec![Slot::default(); slots],
                buckets: vec![Vec::new(); PID_HT_SZ],
                reset_pid: None,
            }),
            pend_cnt: (0..slots).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Claim a free slot for `pid`
    pub fn acquire(&self, pid: u32) -> Result<Context> {
        let mut reg = self.inner.lock();

        if let Some(owner) = reg.reset_pid {
            error!("No context allowed during reset by pid {}", owner);
            return Err(VkError::InReset(owner));
        }

        let idx = match reg.slots.iter().position(|s| !s.in_use) {
            Some(idx) => idx,
            None => {
                error!("All contexts in use");
                return Err(VkError::ContextsInUse);
            }
        };

        reg.slots[idx] = Slot { in_use: true, pid };
        reg.buckets[pid_hash(pid)].push(idx);
        self.pend_cnt[idx].store(0, Ordering::Relaxed);

        debug!(ctx = idx, pid, "Context acquired");
        Ok(Context { idx, pid })
    }

    /// Free a slot; returns the sessions `pid` still has open
    pub fn release(&self, ctx: Context) -> usize {
        let mut reg = self.inner.lock();

        if !reg.slots.get(ctx.idx).map_or(false, |s| s.in_use) {
            error!("Context[{}] not in use", ctx.idx);
            return 0;
        }
        reg.slots[ctx.idx].in_use = false;

        let bucket = pid_hash(ctx.pid);
        reg.buckets[bucket].retain(|&i| i != ctx.idx);

        let Registry { slots, buckets, .. } = &*reg;
        buckets[bucket]
            .iter()
            .filter(|&&i| slots[i].pid == ctx.pid)
            .count()
    }

    /// Record `pid` as the reset owner unless another reset is in flight
    ///
    /// The owner must hold a session: its last close is what ends the reset.
    pub fn claim_reset(&self, pid: u32) -> Result<()> {
        let mut reg = self.inner.lock();
        if let Some(owner) = reg.reset_pid {
            error!("Reset already launched by process pid {}", owner);
            return Err(VkError::ResetInProgress(owner));
        }
        if !Self::holds_session(&reg, pid) {
            error!("Reset requested by pid {} without an open session", pid);
            return Err(VkError::NoSession(pid));
        }
        reg.reset_pid = Some(pid);
        Ok(())
    }

    /// Check if `pid` has at least one open session
    pub fn has_sessions(&self, pid: u32) -> bool {
        Self::holds_session(&self.inner.lock(), pid)
    }

    fn holds_session(reg: &Registry, pid: u32) -> bool {
        reg.buckets[pid_hash(pid)]
            .iter()
            .any(|&i| reg.slots[i].pid == pid)
    }

    pub fn reset_owner(&self) -> Option<u32> {
        self.inner.lock().reset_pid
    }

    /// Drop the reset owner if it is `pid`; returns whether it was
    pub fn clear_reset_owner(&self, pid: u32) -> bool {
        let mut reg = self.inner.lock();
        if reg.reset_pid == Some(pid) {
            reg.reset_pid = None;
            true
        } else {
            false
        }
    }

    /// Distinct pids with open sessions, excluding the reset owner
    pub fn foreign_pids(&self) -> Vec<u32> {
        let reg = self.inner.lock();
        let mut pids = Vec::new();
        for bucket in &reg.buckets {
            for &idx in bucket {
                let pid = reg.slots[idx].pid;
                if Some(pid) != reg.reset_pid && !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
        pids
    }

    /// Open sessions
    pub fn in_use(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.in_use).count()
    }

    pub fn pend_inc(&self, idx: usize) {
        if let Some(cnt) = self.pend_cnt.get(idx) {
            cnt.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pend_dec(&self, idx: usize) {
        if let Some(cnt) = self.pend_cnt.get(idx) {
            let _ = cnt.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    /// Responses waiting to be read by the session in slot `idx`
    pub fn pending(&self, idx: usize) -> u32 {
        self.pend_cnt
            .get(idx)
            .map_or(0, |cnt| cnt.load(Ordering::Relaxed))
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}
