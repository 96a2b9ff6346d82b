//! Scatter-gather DMA boundary
//!
//! Pinning user pages and building SG lists belongs to the platform; the
//! transport only consumes the result through [`DmaMapper`].

use crate::error::{Result, VkError};
use crate::regs::DMA_MAX_ADDRS;
use std::fmt;

/// Size of one packed `{size:u32, address:u64}` descriptor
pub const VK_DATA_SIZE: usize = 12;

/// Transfer direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Host memory is read by the card
    ToDevice,
    /// Host memory is written by the card
    FromDevice,
}

/// Packed buffer descriptor carried at the end of a transfer message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VkData {
    /// Size in bytes
    pub size: u32,
    /// Buffer address
    pub address: u64,
}

impl VkData {
    pub fn read(bytes: &[u8]) -> Self {
        let mut size = [0u8; 4];
        let mut addr = [0u8; 8];
        size.copy_from_slice(&bytes[0..4]);
        addr.copy_from_slice(&bytes[4..12]);
        Self {
            size: u32::from_le_bytes(size),
            address: u64::from_le_bytes(addr),
        }
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..12].copy_from_slice(&self.address.to_le_bytes());
    }
}

/// A mapped buffer and its scatter-gather list
///
/// `sglist` is little-endian `[num_sg, {size, addr_lo, addr_hi} * num_sg]`.
/// The mapping is torn down when the buffer is dropped.
pub struct DmaBuffer {
    /// Device address of the SG list
    pub handle: u64,
    pub sglist: Vec<u8>,
    pub direction: DmaDirection,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DmaBuffer {
    pub fn new(handle: u64, sglist: Vec<u8>, direction: DmaDirection) -> Self {
        Self {
            handle,
            sglist,
            direction,
            release: None,
        }
    }

    /// Run `release` when the buffer is dropped
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Descriptor that replaces the user's in the outgoing message
    pub fn descriptor(&self) -> VkData {
        VkData {
            size: self.sglist.len() as u32,
            address: self.handle,
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("handle", &format_args!("{:#x}", self.handle))
            .field("sglen", &self.sglist.len())
            .field("direction", &self.direction)
            .finish()
    }
}

/// Maps user buffers for the card
pub trait DmaMapper: Send + Sync {
    fn map(&self, direction: DmaDirection, data: &VkData) -> Result<DmaBuffer>;
}

/// Map every plane of a transfer
///
/// `descs` holds `planes` packed descriptors; each one with a non-zero
/// address is mapped and rewritten in place to point at its SG list.
/// On failure the buffers mapped so far are dropped (and unmapped).
pub fn map_planes(
    mapper: &dyn DmaMapper,
    direction: DmaDirection,
    descs: &mut [u8],
    planes: usize,
) -> Result<Vec<Option<DmaBuffer>>> {
    if planes > DMA_MAX_ADDRS || descs.len() < planes * VK_DATA_SIZE {
        return Err(VkError::Dma(format!("{} planes not supported", planes)));
    }

    let mut mapped = Vec::with_capacity(planes);
    for chunk in descs.chunks_exact_mut(VK_DATA_SIZE).take(planes) {
        let data = VkData::read(chunk);
        if data.address == 0 {
            mapped.push(None);
            continue;
        }
        let buf = mapper.map(direction, &data)?;
        buf.descriptor().write(chunk);
        mapped.push(Some(buf));
    }
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingMapper {
        released: Arc<AtomicUsize>,
    }

    impl DmaMapper for CountingMapper {
        fn map(&self, direction: DmaDirection, data: &VkData) -> Result<DmaBuffer> {
            if data.size == 0 {
                return Err(VkError::Dma("empty buffer".into()));
            }
            let released = self.released.clone();
            Ok(DmaBuffer::new(data.address | 0xF000_0000_0000, vec![0; 16], direction)
                .on_release(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }))
        }
    }

    fn descs(items: &[VkData]) -> Vec<u8> {
        let mut out = vec![0u8; items.len() * VK_DATA_SIZE];
        for (d, chunk) in items.iter().zip(out.chunks_exact_mut(VK_DATA_SIZE)) {
            d.write(chunk);
        }
        out
    }

    #[test]
    fn test_map_rewrites_descriptors() {
        let released = Arc::new(AtomicUsize::new(0));
        let mapper = CountingMapper {
            released: released.clone(),
        };
        let mut raw = descs(&[
            VkData { size: 64, address: 0x1000 },
            VkData { size: 0, address: 0 },
        ]);

        let bufs = map_planes(&mapper, DmaDirection::ToDevice, &mut raw, 2).unwrap();
        assert!(bufs[0].is_some());
        assert!(bufs[1].is_none());
        assert_eq!(
            VkData::read(&raw[..VK_DATA_SIZE]),
            VkData { size: 16, address: 0xF000_0000_1000 }
        );

        drop(bufs);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_map_failure_releases_earlier_planes() {
        let released = Arc::new(AtomicUsize::new(0));
        let mapper = CountingMapper {
            released: released.clone(),
        };
        let mut raw = descs(&[
            VkData { size: 64, address: 0x1000 },
            VkData { size: 0, address: 0x2000 },
        ]);

        assert!(matches!(
            map_planes(&mapper, DmaDirection::FromDevice, &mut raw, 2),
            Err(VkError::Dma(_))
        ));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_too_many_planes() {
        let mapper = CountingMapper {
            released: Arc::new(AtomicUsize::new(0)),
        };
        let mut raw = vec![0u8; VK_DATA_SIZE * 8];
        assert!(map_planes(&mapper, DmaDirection::ToDevice, &mut raw, 5).is_err());
    }
}
