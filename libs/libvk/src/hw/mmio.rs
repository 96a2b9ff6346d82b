//! Memory-mapped PCI BAR
//!
//! Maps a sysfs `resourceN` file and performs volatile 32-bit accesses on
//! it. This is the only place in the crate that touches raw pointers.

use super::{word_in_range, Bar, BAR_DEAD};
use crate::error::{Result, VkError};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// A BAR mapped from a PCI resource file
pub struct MmioBar {
    base: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is shared device memory that is only accessed through
// volatile word reads and writes; it is never handed out as a reference.
unsafe impl Send for MmioBar {}
unsafe impl Sync for MmioBar {}

impl MmioBar {
    /// Map the whole resource file, e.g.
    /// `/sys/bus/pci/devices/0000:01:00.0/resource2`
    pub fn map_resource(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| VkError::Config(format!("{} is empty", path.display())))?;

        // SAFETY: fresh shared mapping of a device resource, no address hint.
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| VkError::Io(std::io::Error::from(e)))?;

        debug!("Mapped {} ({} bytes)", path.display(), len);
        Ok(Self { base, len })
    }
}

impl Bar for MmioBar {
    fn len(&self) -> usize {
        self.len
    }

    fn read32(&self, offset: usize) -> u32 {
        if !word_in_range(offset, self.len) {
            return BAR_DEAD;
        }
        // SAFETY: offset is word aligned and inside the mapping.
        unsafe {
            let reg = self.base.as_ptr().cast::<u8>().add(offset).cast::<u32>();
            u32::from_le(reg.read_volatile())
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        if !word_in_range(offset, self.len) {
            warn!("Dropping write of {:#x} to offset {:#x}", value, offset);
            return;
        }
        // SAFETY: offset is word aligned and inside the mapping.
        unsafe {
            let reg = self.base.as_ptr().cast::<u8>().add(offset).cast::<u32>();
            reg.write_volatile(value.to_le());
        }
    }
}

impl Drop for MmioBar {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in map_resource.
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            warn!("munmap failed: {}", e);
        }
    }
}

impl std::fmt::Debug for MmioBar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioBar")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}
