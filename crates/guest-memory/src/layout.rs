use core::fmt;

use crate::phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult, HostBlock};

/// A guest-physical → host-backing RAM region.
///
/// The guest-physical address range `[phys_start, phys_end)` is stored in the backing memory at
/// `[host_offset, host_offset + (phys_end - phys_start))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamRegion {
    pub phys_start: u64,
    pub phys_end: u64,
    pub host_offset: u64,
}

impl RamRegion {
    #[inline]
    fn len(&self) -> u64 {
        self.phys_end.saturating_sub(self.phys_start)
    }

    #[inline]
    fn host_addr(&self, paddr: u64) -> u64 {
        // Validated at construction time.
        self.host_offset + (paddr - self.phys_start)
    }
}

/// Errors constructing a [`RamLayout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RamLayoutError {
    /// A region has `phys_end <= phys_start`.
    EmptyRegion {
        index: usize,
        phys_start: u64,
        phys_end: u64,
    },
    /// A region lies (partially or fully) outside the declared guest-physical address space.
    RegionOutOfPhysRange {
        index: usize,
        phys_end: u64,
        phys_size: u64,
    },
    /// Regions overlap after sorting by `phys_start`.
    Overlap { prev_end: u64, index: usize, phys_start: u64 },
    /// The region's host range lies outside the backing memory.
    HostOutOfRange {
        index: usize,
        host_offset: u64,
        len: u64,
        host_size: u64,
    },
}

impl fmt::Display for RamLayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RamLayoutError::EmptyRegion {
                index,
                phys_start,
                phys_end,
            } => write!(
                f,
                "ram region {index} is empty: phys_start=0x{phys_start:x} phys_end=0x{phys_end:x}"
            ),
            RamLayoutError::RegionOutOfPhysRange {
                index,
                phys_end,
                phys_size,
            } => write!(
                f,
                "ram region {index} ends at 0x{phys_end:x}, beyond phys_size=0x{phys_size:x}"
            ),
            RamLayoutError::Overlap {
                prev_end,
                index,
                phys_start,
            } => write!(
                f,
                "ram region {index} at 0x{phys_start:x} overlaps previous region ending at 0x{prev_end:x}"
            ),
            RamLayoutError::HostOutOfRange {
                index,
                host_offset,
                len,
                host_size,
            } => write!(
                f,
                "ram region {index} out of backing range: host_offset=0x{host_offset:x} len=0x{len:x} host_size=0x{host_size:x}"
            ),
        }
    }
}

impl std::error::Error for RamLayoutError {}

/// Guest-physical address space made of RAM regions separated by holes.
///
/// Reads from holes return `0xFF` (open bus) and writes to holes are dropped, but holes never
/// [`resolve`](GuestMemory::resolve) to a host block, so devices cannot map them.
#[derive(Debug, Clone)]
pub struct RamLayout<M: GuestMemory = DenseMemory> {
    backing: M,
    phys_size: u64,
    regions: Vec<RamRegion>,
}

impl<M: GuestMemory> RamLayout<M> {
    pub fn new(
        backing: M,
        phys_size: u64,
        mut regions: Vec<RamRegion>,
    ) -> Result<Self, RamLayoutError> {
        regions.sort_by_key(|r| r.phys_start);

        let host_size = backing.size();
        let mut prev_end = 0u64;
        for (index, r) in regions.iter().enumerate() {
            if r.phys_end <= r.phys_start {
                return Err(RamLayoutError::EmptyRegion {
                    index,
                    phys_start: r.phys_start,
                    phys_end: r.phys_end,
                });
            }
            if r.phys_end > phys_size {
                return Err(RamLayoutError::RegionOutOfPhysRange {
                    index,
                    phys_end: r.phys_end,
                    phys_size,
                });
            }
            if index > 0 && r.phys_start < prev_end {
                return Err(RamLayoutError::Overlap {
                    prev_end,
                    index,
                    phys_start: r.phys_start,
                });
            }
            let len = r.len();
            let fits = r
                .host_offset
                .checked_add(len)
                .is_some_and(|end| end <= host_size);
            if !fits {
                return Err(RamLayoutError::HostOutOfRange {
                    index,
                    host_offset: r.host_offset,
                    len,
                    host_size,
                });
            }
            prev_end = r.phys_end;
        }

        Ok(Self {
            backing,
            phys_size,
            regions,
        })
    }

    /// Places the first `low_limit` bytes of `backing` at guest address 0 and the remainder at
    /// `high_base`, leaving `[low_limit, high_base)` as a hole.
    pub fn with_high_split(
        backing: M,
        low_limit: u64,
        high_base: u64,
    ) -> Result<Self, RamLayoutError> {
        let total = backing.size();
        let low = total.min(low_limit);
        let mut regions = vec![RamRegion {
            phys_start: 0,
            phys_end: low,
            host_offset: 0,
        }];
        let high_len = total - low;
        let phys_size = if high_len > 0 {
            regions.push(RamRegion {
                phys_start: high_base,
                phys_end: high_base.saturating_add(high_len),
                host_offset: low,
            });
            high_base.saturating_add(high_len)
        } else {
            low_limit.max(low)
        };
        Self::new(backing, phys_size, regions)
    }

    pub fn regions(&self) -> &[RamRegion] {
        &self.regions
    }

    pub fn backing(&self) -> &M {
        &self.backing
    }

    pub fn backing_mut(&mut self) -> &mut M {
        &mut self.backing
    }

    #[inline]
    fn check_range(&self, paddr: u64, len: usize) -> GuestMemoryResult<u64> {
        let end = paddr
            .checked_add(len as u64)
            .ok_or(GuestMemoryError::OutOfRange {
                paddr,
                len,
                size: self.phys_size,
            })?;
        if end > self.phys_size {
            return Err(GuestMemoryError::OutOfRange {
                paddr,
                len,
                size: self.phys_size,
            });
        }
        Ok(end)
    }

    #[inline]
    fn first_region_index_for_addr(&self, paddr: u64) -> usize {
        // Regions are sorted and disjoint, so `phys_end` is strictly increasing.
        self.regions.partition_point(|r| r.phys_end <= paddr)
    }

    /// Calls `f(region, start, end)` for every mapped piece of `[paddr, end)`.
    fn for_each_piece(
        &self,
        paddr: u64,
        end: u64,
        mut f: impl FnMut(&RamRegion, u64, u64) -> GuestMemoryResult<()>,
    ) -> GuestMemoryResult<()> {
        let mut idx = self.first_region_index_for_addr(paddr);
        while let Some(region) = self.regions.get(idx) {
            if region.phys_start >= end {
                break;
            }
            let inter_start = paddr.max(region.phys_start);
            let inter_end = end.min(region.phys_end);
            if inter_start < inter_end {
                f(region, inter_start, inter_end)?;
            }
            idx += 1;
        }
        Ok(())
    }
}

impl<M: GuestMemory> GuestMemory for RamLayout<M> {
    fn size(&self) -> u64 {
        self.phys_size
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let end = self.check_range(paddr, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }
        dst.fill(0xFF);
        let backing = &self.backing;
        self.for_each_piece(paddr, end, |region, start, stop| {
            let off = (start - paddr) as usize;
            let len = (stop - start) as usize;
            backing.read_into(region.host_addr(start), &mut dst[off..off + len])
        })
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let end = self.check_range(paddr, src.len())?;
        if src.is_empty() {
            return Ok(());
        }
        let mut pieces = Vec::new();
        self.for_each_piece(paddr, end, |region, start, stop| {
            pieces.push((region.host_addr(start), start, stop));
            Ok(())
        })?;
        for (host, start, stop) in pieces {
            let off = (start - paddr) as usize;
            let len = (stop - start) as usize;
            self.backing.write_from(host, &src[off..off + len])?;
        }
        Ok(())
    }

    fn resolve(&self, paddr: u64, len: usize) -> Option<HostBlock> {
        let end = self.check_range(paddr, len).ok()?;
        let index = self
            .regions
            .partition_point(|r| r.phys_start <= paddr)
            .checked_sub(1)?;
        let region = self.regions.get(index)?;
        if paddr >= region.phys_end || end > region.phys_end {
            return None;
        }
        Some(HostBlock {
            index,
            phys_start: region.phys_start,
            phys_end: region.phys_end,
            host_offset: region.host_offset,
        })
    }

    fn mark_dirty(&mut self, paddr: u64, len: usize) {
        let Ok(end) = self.check_range(paddr, len) else {
            return;
        };
        let mut pieces = Vec::new();
        let _ = self.for_each_piece(paddr, end, |region, start, stop| {
            pieces.push((region.host_addr(start), (stop - start) as usize));
            Ok(())
        });
        for (host, len) in pieces {
            self.backing.mark_dirty(host, len);
        }
    }
}
