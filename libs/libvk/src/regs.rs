//! VK register map and protocol constants

/// BAR0 register offsets
pub mod bar0 {
    /// Boot-loader codepush request
    pub const CODEPUSH_SBL: usize = 0x400;
    /// Fastboot progress (SRAM/DDR open)
    pub const FB_OPEN: usize = 0x404;
    /// Firmware status
    pub const FW_STATUS: usize = 0x41C;
    /// Card error log (peer alerts)
    pub const CARD_ERR_LOG: usize = 0x464;
    /// First doorbell register
    pub const DB_BASE: usize = 0x484;
    /// Distance between doorbell registers
    pub const DB_GAP: usize = 8;
    /// Card OS uptime in seconds
    pub const OS_UPTIME: usize = 0x4C4;

    /// Doorbell number used for reset requests
    pub const RESET_DB_NUM: u32 = 3;
    /// Soft reset doorbell value
    pub const RESET_DB_SOFT: u32 = 0xFFFF_FFFF;

    /// Doorbell register for a queue
    pub const fn doorbell(q_num: u32) -> usize {
        DB_BASE + q_num as usize * DB_GAP
    }
}

/// BAR1 register offsets
pub mod bar1 {
    /// Message queue definition ready marker
    pub const MSGQ_DEF_RDY: usize = 0x60C0;
    /// Number of queues, both directions
    pub const MSGQ_NR: usize = 0x60C4;
    /// Offset of the first queue control record
    pub const MSGQ_CTRL_OFF: usize = 0x60C8;
    /// Boot1 version tag
    pub const BOOT1_VER_TAG: usize = 0x6180;

    /// Value published once the queue definitions are valid
    pub const MSGQ_RDY_MARKER: u32 = 0xBEEF_CAFE;

    const DAUTH_BASE: usize = 0x6200;
    const DAUTH_STORE_SIZE: usize = 0x48;
    const DAUTH_VALID_SIZE: usize = 0x8;
    pub const DAUTH_MAX: usize = 4;

    const SOTP_REVID_BASE: usize = 0x6340;
    const SOTP_REVID_SIZE: usize = 0x10;
    pub const SOTP_REVID_MAX: usize = 2;

    pub const fn dauth_store(i: usize) -> usize {
        DAUTH_BASE + i * (DAUTH_STORE_SIZE + DAUTH_VALID_SIZE)
    }

    pub const fn dauth_valid(i: usize) -> usize {
        dauth_store(i) + DAUTH_STORE_SIZE
    }

    pub const fn sotp_revid(i: usize) -> usize {
        SOTP_REVID_BASE + i * SOTP_REVID_SIZE
    }
}

/// Firmware status bits
pub mod fw_status {
    pub const INIT_START: u32 = 1 << 2;
    pub const ARCH_INIT_DONE: u32 = 1 << 3;
    pub const PRE_KNL1_INIT_DONE: u32 = 1 << 4;
    pub const PRE_KNL2_INIT_DONE: u32 = 1 << 5;
    pub const POST_KNL_INIT_DONE: u32 = 1 << 6;
    pub const INIT_DONE: u32 = 1 << 7;
    pub const APP_INIT_START: u32 = 1 << 8;
    pub const APP_INIT_DONE: u32 = 1 << 9;

    /// All bits the card sets once its OS is up
    pub const READY: u32 = INIT_START
        | ARCH_INIT_DONE
        | PRE_KNL1_INIT_DONE
        | PRE_KNL2_INIT_DONE
        | POST_KNL_INIT_DONE
        | INIT_DONE
        | APP_INIT_START
        | APP_INIT_DONE;

    const RESET_REASON_SHIFT: u32 = 28;
    /// Reset requested through the mailbox doorbell
    pub const RESET_MBOX_DB: u32 = 0x1 << RESET_REASON_SHIFT;
}

/// Codepush register layout
pub mod codepush {
    /// Entry-point bits that make the ROM retry a boot
    pub const MASK: u32 = 0xFFFF_F000;
}

/// Fastboot progress bits
pub mod fb_open {
    pub const SRAM_OPEN: u32 = 1 << 16;
    pub const DDR_OPEN: u32 = 1 << 17;
}

/// Function ids understood by the transport itself
pub mod fid {
    /// Buffer transfer with scatter-gather descriptors
    pub const TRANS_BUF: u32 = 5;
    /// One-way shutdown notice
    pub const SHUTDOWN: u32 = 8;
}

/// Shutdown message types (args[0])
pub mod shutdown {
    /// A process closed its last session
    pub const PID: u32 = 1;
    /// Card-level graceful shutdown before reset
    pub const GRACEFUL: u32 = 2;
}

/// Buffer transfer command word (args[0] of a TRANS_BUF message)
pub mod trans_buf {
    pub const PLANES_MASK: u32 = 0x000F;
    pub const CMD_MASK: u32 = 0x0F00;
    pub const CMD_UPLOAD: u32 = 0x0400;
    pub const CMD_DOWNLOAD: u32 = 0x0500;
}

/// Number of queues per direction the driver can track
pub const MSGQ_MAX_NR: usize = 4;

/// Maximum scatter-gather planes per transfer
pub const DMA_MAX_ADDRS: usize = 4;

/// Concurrent session contexts
pub const CTX_MAX: usize = 32 * 5;

/// Bits of the pid hash
pub const PID_HT_SHIFT: u32 = 7;

/// Buckets in the pid hash
pub const PID_HT_SZ: usize = 1 << PID_HT_SHIFT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doorbell_layout() {
        assert_eq!(bar0::doorbell(0), 0x484);
        assert_eq!(bar0::doorbell(3), 0x484 + 24);
    }

    #[test]
    fn test_dauth_slots_do_not_overlap() {
        for i in 0..bar1::DAUTH_MAX - 1 {
            assert!(bar1::dauth_valid(i) < bar1::dauth_store(i + 1));
        }
        assert!(bar1::dauth_valid(bar1::DAUTH_MAX - 1) < bar1::sotp_revid(0));
    }
}
