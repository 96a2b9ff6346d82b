//! Device state shared by every transport path
//!
//! A `VkDevice` is created once per card and shared through an `Arc`.
//! Sessions, the interrupt path, the dispatcher worker and the heartbeat
//! thread all reach the card through it; nothing is global.

use crate::alert::{AlertState, Alerts, HostAlert, PeerAlert};
use crate::config::VkConfig;
use crate::context::ContextRegistry;
use crate::dispatch::{FirmwareLoader, WorkerMsg};
use crate::dma::DmaMapper;
use crate::error::Result;
use crate::heartbeat::HeartbeatState;
use crate::hw::{Hardware, QueueInfo};
use crate::msgid::MsgIdAllocator;
use crate::pending::PendingTable;
use crate::qstats::QueueStats;
use crate::regs::{bar0, bar1, fw_status, MSGQ_MAX_NR};
use crate::reset::{NixSignaller, ResetPhase, SessionSignaller};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Ring geometry and statistics of one direction, guarded by the channel
/// mutex
#[derive(Debug, Default)]
pub(crate) struct ChanState {
    pub queues: Vec<QueueInfo>,
    pub stats: [QueueStats; MSGQ_MAX_NR],
}

/// One direction of the transport
pub(crate) struct MsgChan {
    pub name: &'static str,
    state: Mutex<ChanState>,
    pub pending: PendingTable,
}

impl MsgChan {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ChanState::default()),
            pending: PendingTable::new(),
        }
    }

    /// Take the channel mutex; a panicked holder leaves geometry intact
    pub fn lock(&self) -> MutexGuard<'_, ChanState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn q_nr(&self) -> usize {
        self.lock().queues.len()
    }
}

/// Background threads owned by the device
#[derive(Default)]
pub(crate) struct Threads {
    pub work_tx: Option<Sender<WorkerMsg>>,
    pub hb_tx: Option<Sender<()>>,
    pub handles: Vec<JoinHandle<()>>,
}

/// Host-side state for one VK card
pub struct VkDevice {
    pub(crate) hw: Hardware,
    pub(crate) config: VkConfig,
    pub(crate) msgq_inited: AtomicBool,
    pub(crate) msg_ids: MsgIdAllocator,
    pub(crate) contexts: ContextRegistry,
    pub(crate) h2vk: MsgChan,
    pub(crate) vk2h: MsgChan,
    pub(crate) host_alert: Alerts<HostAlert>,
    pub(crate) peer_alert: Alerts<PeerAlert>,
    pub(crate) offload: AtomicU32,
    pub(crate) work_scheduled: AtomicBool,
    pub(crate) hb: spin::Mutex<HeartbeatState>,
    pub(crate) threads: Mutex<Threads>,
    pub(crate) dma: Option<Arc<dyn DmaMapper>>,
    pub(crate) loader: Option<Arc<dyn FirmwareLoader>>,
    pub(crate) signaller: Arc<dyn SessionSignaller>,
    pub(crate) reset_phase: spin::Mutex<ResetPhase>,
    pub(crate) seq: AtomicU32,
}

/// Builder for [`VkDevice`]
pub struct VkDeviceBuilder {
    hw: Hardware,
    config: VkConfig,
    msg_ids: usize,
    dma: Option<Arc<dyn DmaMapper>>,
    loader: Option<Arc<dyn FirmwareLoader>>,
    signaller: Arc<dyn SessionSignaller>,
}

impl VkDeviceBuilder {
    pub fn new(hw: Hardware) -> Self {
        Self {
            hw,
            config: VkConfig::default(),
            msg_ids: crate::msgid::MSG_ID_BITMAP_SIZE,
            dma: None,
            loader: None,
            signaller: Arc::new(NixSignaller),
        }
    }

    pub fn config(mut self, config: VkConfig) -> Self {
        self.config = config;
        self
    }

    /// Size of the message id bitmap (power of two, at most 4096)
    pub fn msg_ids(mut self, size: usize) -> Self {
        self.msg_ids = size;
        self
    }

    pub fn dma_mapper(mut self, mapper: Arc<dyn DmaMapper>) -> Self {
        self.dma = Some(mapper);
        self
    }

    pub fn firmware_loader(mut self, loader: Arc<dyn FirmwareLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn signaller(mut self, signaller: Arc<dyn SessionSignaller>) -> Self {
        self.signaller = signaller;
        self
    }

    pub fn build(self) -> Arc<VkDevice> {
        Arc::new(VkDevice {
            hw: self.hw,
            config: self.config,
            msgq_inited: AtomicBool::new(false),
            msg_ids: MsgIdAllocator::new(self.msg_ids),
            contexts: ContextRegistry::new(),
            h2vk: MsgChan::new("h2vk"),
            vk2h: MsgChan::new("vk2h"),
            host_alert: Alerts::new("host"),
            peer_alert: Alerts::new("peer"),
            offload: AtomicU32::new(0),
            work_scheduled: AtomicBool::new(false),
            hb: spin::Mutex::new(HeartbeatState::default()),
            threads: Mutex::new(Threads::default()),
            dma: self.dma,
            loader: self.loader,
            signaller: self.signaller,
            reset_phase: spin::Mutex::new(ResetPhase::Normal),
            seq: AtomicU32::new(0),
        })
    }
}

impl VkDevice {
    pub fn builder(hw: Hardware) -> VkDeviceBuilder {
        VkDeviceBuilder::new(hw)
    }

    pub fn config(&self) -> &VkConfig {
        &self.config
    }

    /// Check if queues are synced and transport access is allowed
    pub fn drv_access_ok(&self) -> bool {
        self.msgq_inited.load(Ordering::Acquire)
    }

    /// Refuse all further transport access until the next sync
    pub fn blk_drv_access(&self) {
        if self.msgq_inited.swap(false, Ordering::AcqRel) {
            warn!("Blocking driver access to message queues");
        }
    }

    /// The card's firmware is up and its queue definitions are published
    pub fn msgq_marker_valid(&self) -> bool {
        let fw = self.hw.bar0.read32(bar0::FW_STATUS);
        let marker = if fw & fw_status::READY == fw_status::READY {
            self.hw.bar1.read32(bar1::MSGQ_DEF_RDY)
        } else {
            0
        };
        marker == bar1::MSGQ_RDY_MARKER
    }

    /// Ring doorbell `q_num`
    pub fn doorbell(&self, q_num: u32, value: u32) {
        self.hw.bar0.write32(bar0::doorbell(q_num), value);
    }

    /// Queues per direction established by the last sync
    pub fn queue_count(&self) -> usize {
        self.h2vk.q_nr()
    }

    /// Cached geometry of host to card queue `q_num`
    pub fn h2vk_queue(&self, q_num: usize) -> Option<QueueInfo> {
        self.h2vk.lock().queues.get(q_num).copied()
    }

    /// Cached geometry of card to host queue `q_num`
    pub fn vk2h_queue(&self, q_num: usize) -> Option<QueueInfo> {
        self.vk2h.lock().queues.get(q_num).copied()
    }

    pub fn host_alerts(&self) -> AlertState<HostAlert> {
        self.host_alert.state()
    }

    pub fn peer_alerts(&self) -> AlertState<PeerAlert> {
        self.peer_alert.state()
    }

    /// Occupancy statistics of queue `q_num`, host to card then card to host
    pub fn qstats(&self, q_num: usize) -> Option<(QueueStats, QueueStats)> {
        let h2vk = *self.h2vk.lock().stats.get(q_num)?;
        let vk2h = *self.vk2h.lock().stats.get(q_num)?;
        Some((h2vk, vk2h))
    }

    /// Requests awaiting a response / responses awaiting a read
    pub fn pending_counts(&self) -> (usize, usize) {
        (self.h2vk.pending.len(), self.vk2h.pending.len())
    }

    /// Message ids currently claimed
    pub fn msg_ids_in_use(&self) -> usize {
        self.msg_ids.in_use()
    }

    /// Open sessions
    pub fn sessions(&self) -> usize {
        self.contexts.in_use()
    }

    /// Process that owns an in-flight reset
    pub fn reset_owner(&self) -> Option<u32> {
        self.contexts.reset_owner()
    }

    /// Start the dispatcher worker and the heartbeat monitor
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_worker()?;
        self.spawn_heartbeat()?;
        info!("VK transport started");
        Ok(())
    }

    /// Block access, stop background threads and drop every pending entry
    pub fn shutdown(&self) {
        self.blk_drv_access();
        self.stop_threads(true);

        let drained = self
            .h2vk
            .pending
            .drain_all(None, &self.msg_ids, &self.contexts)
            .len()
            + self
                .vk2h
                .pending
                .drain_all(None, &self.msg_ids, &self.contexts)
                .len();
        info!("VK transport shut down, {} pending entries dropped", drained);
    }

    fn stop_threads(&self, join: bool) {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = threads.work_tx.take() {
            let _ = tx.send(WorkerMsg::Stop);
        }
        if let Some(tx) = threads.hb_tx.take() {
            let _ = tx.send(());
        }
        let handles = std::mem::take(&mut threads.handles);
        drop(threads);

        if !join {
            return;
        }
        let me = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("Background thread panicked");
            }
        }
    }
}

impl Drop for VkDevice {
    fn drop(&mut self) {
        // May run on one of our own threads; only signal them.
        self.stop_threads(false);
        debug!("VK device released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{Bar, MemBar};

    fn device() -> (Arc<MemBar>, Arc<MemBar>, Arc<VkDevice>) {
        let bar0 = Arc::new(MemBar::new(0x1000));
        let bar1 = Arc::new(MemBar::new(0x8000));
        let dev = VkDevice::builder(Hardware::new(bar0.clone(), bar1.clone())).build();
        (bar0, bar1, dev)
    }

    #[test]
    fn test_marker_needs_fw_ready() {
        let (bar0, bar1, dev) = device();
        bar1.write32(bar1::MSGQ_DEF_RDY, bar1::MSGQ_RDY_MARKER);
        assert!(!dev.msgq_marker_valid());

        bar0.write32(bar0::FW_STATUS, fw_status::READY);
        assert!(dev.msgq_marker_valid());

        bar1.write32(bar1::MSGQ_DEF_RDY, 0);
        assert!(!dev.msgq_marker_valid());
    }

    #[test]
    fn test_doorbell_offset() {
        let (bar0, _bar1, dev) = device();
        dev.doorbell(2, 7);
        assert_eq!(bar0.read32(0x484 + 16), 7);
    }

    #[test]
    fn test_blk_drv_access() {
        let (_bar0, _bar1, dev) = device();
        dev.msgq_inited.store(true, Ordering::Release);
        assert!(dev.drv_access_ok());
        dev.blk_drv_access();
        assert!(!dev.drv_access_ok());
    }

    #[test]
    fn test_start_and_shutdown() {
        let (_bar0, _bar1, dev) = device();
        dev.start().unwrap();
        dev.shutdown();
        assert!(dev.threads.lock().unwrap().handles.is_empty());
    }
}
