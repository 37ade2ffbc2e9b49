use core::fmt;

use crate::dirty::DirtyPageTracker;

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestMemoryError {
    /// The requested address range is outside the guest physical memory size.
    OutOfRange { paddr: u64, len: usize, size: u64 },
    /// The requested size cannot be represented by the current platform's `usize`.
    SizeTooLarge { size: u64 },
    /// The dirty-tracking page size is zero or not a power of two.
    InvalidPageSize { page_size: u64 },
}

impl fmt::Display for GuestMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestMemoryError::OutOfRange { paddr, len, size } => write!(
                f,
                "guest memory access out of range: paddr=0x{paddr:x} len={len} size=0x{size:x}"
            ),
            GuestMemoryError::SizeTooLarge { size } => {
                write!(f, "guest memory size {size} does not fit in usize")
            }
            GuestMemoryError::InvalidPageSize { page_size } => {
                write!(f, "invalid dirty page size {page_size}")
            }
        }
    }
}

impl std::error::Error for GuestMemoryError {}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// A host-backed block of guest RAM.
///
/// Guest physical addresses `[phys_start, phys_end)` live contiguously in the host backing store
/// starting at `host_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBlock {
    pub index: usize,
    pub phys_start: u64,
    pub phys_end: u64,
    pub host_offset: u64,
}

impl HostBlock {
    /// Whether `[paddr, paddr + len)` lies entirely inside this block.
    pub fn contains(&self, paddr: u64, len: usize) -> bool {
        match paddr.checked_add(len as u64) {
            Some(end) => paddr >= self.phys_start && end <= self.phys_end,
            None => false,
        }
    }

    /// Host backing offset of `paddr`. The caller must have checked [`HostBlock::contains`].
    pub fn host_addr(&self, paddr: u64) -> u64 {
        self.host_offset + (paddr - self.phys_start)
    }
}

/// Guest *physical* memory storage.
///
/// All externally-visible addresses are `u64` so that guests with RAM above 4GiB work on 32-bit
/// hosts too.
pub trait GuestMemory {
    fn size(&self) -> u64;

    /// Reads bytes from guest physical memory into `dst`.
    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    /// Writes bytes from `src` into guest physical memory.
    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    /// Resolves `[paddr, paddr + len)` to the single host-backed block that contains it.
    ///
    /// Returns `None` for ranges that touch holes, MMIO, or straddle two blocks.
    fn resolve(&self, paddr: u64, len: usize) -> Option<HostBlock> {
        check_range(self.size(), paddr, len).ok()?;
        Some(HostBlock {
            index: 0,
            phys_start: 0,
            phys_end: self.size(),
            host_offset: 0,
        })
    }

    /// Records that a device wrote `[paddr, paddr + len)` through a mapping.
    fn mark_dirty(&mut self, _paddr: u64, _len: usize) {}

    fn read_u8_le(&self, paddr: u64) -> GuestMemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(paddr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&self, paddr: u64) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&self, paddr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&self, paddr: u64) -> GuestMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8_le(&mut self, paddr: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(paddr, &[value])
    }

    fn write_u16_le(&mut self, paddr: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u32_le(&mut self, paddr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u64_le(&mut self, paddr: u64, value: u64) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }
}

pub(crate) fn check_range(size: u64, paddr: u64, len: usize) -> GuestMemoryResult<()> {
    let len_u64 = len as u64;
    let end = paddr
        .checked_add(len_u64)
        .ok_or(GuestMemoryError::OutOfRange { paddr, len, size })?;
    if end > size {
        return Err(GuestMemoryError::OutOfRange { paddr, len, size });
    }
    Ok(())
}

/// Dense (contiguous) guest memory with optional dirty-page tracking.
#[derive(Debug, Clone)]
pub struct DenseMemory {
    data: Box<[u8]>,
    dirty: Option<DirtyPageTracker>,
}

impl DenseMemory {
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        let size_usize =
            usize::try_from(size).map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
        Ok(Self {
            data: vec![0u8; size_usize].into_boxed_slice(),
            dirty: None,
        })
    }

    /// Starts recording written pages at `page_size` granularity.
    pub fn enable_dirty_tracking(&mut self, page_size: u64) -> GuestMemoryResult<()> {
        self.dirty = Some(DirtyPageTracker::new(page_size)?);
        Ok(())
    }

    /// Returns and clears the dirty page indices, or `None` when tracking is disabled.
    pub fn take_dirty_pages(&mut self) -> Option<Vec<u64>> {
        self.dirty.as_mut().map(DirtyPageTracker::take)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn range_to_usize(&self, paddr: u64, len: usize) -> GuestMemoryResult<(usize, usize)> {
        check_range(self.size(), paddr, len)?;
        let start = usize::try_from(paddr).map_err(|_| GuestMemoryError::OutOfRange {
            paddr,
            len,
            size: self.size(),
        })?;
        let end = start.checked_add(len).ok_or(GuestMemoryError::OutOfRange {
            paddr,
            len,
            size: self.size(),
        })?;
        Ok((start, end))
    }
}

impl GuestMemory for DenseMemory {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let (start, end) = self.range_to_usize(paddr, dst.len())?;
        dst.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let (start, end) = self.range_to_usize(paddr, src.len())?;
        self.data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn mark_dirty(&mut self, paddr: u64, len: usize) {
        if let Some(dirty) = self.dirty.as_mut() {
            dirty.mark(paddr, len);
        }
    }
}
