use crate::phys::{GuestMemory, HostBlock};

/// Scoped access to guest buffers for the duration of one device operation.
///
/// Mapping resolves every buffer against the host-backed RAM blocks of a [`GuestMemory`]. A range
/// that touches a hole or straddles two blocks fails the whole batch, and nothing is left mapped.
///
/// Buffers of one batch that sit on the same side of `split` are assumed to share a RAM block:
/// the block found for the first of them is reused (checked against each buffer's bounds) rather
/// than resolved again. Buffers that cross `split`, or fall outside the cached block, always take
/// the full lookup.
///
/// At most `batch_limit` bytes of a batch are copied in. Every range is still resolved in full,
/// but buffers past the limit are mapped shortened (possibly to nothing), so a batch naming far
/// more memory than the limit turns into a short transfer.
#[derive(Debug, Clone, Copy)]
pub struct GuestBufferMapper {
    split: Option<u64>,
    batch_limit: usize,
}

/// Default cap on the bytes mapped by one batch.
pub const DEFAULT_BATCH_LIMIT: usize = 4 * 1024 * 1024;

impl Default for GuestBufferMapper {
    fn default() -> Self {
        Self::new(None)
    }
}

impl GuestBufferMapper {
    pub fn new(split: Option<u64>) -> Self {
        Self {
            split,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn split(&self) -> Option<u64> {
        self.split
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Maps a single buffer.
    pub fn map<'m, M: GuestMemory + ?Sized>(
        &self,
        mem: &'m mut M,
        paddr: u64,
        len: usize,
        writable: bool,
    ) -> Option<MappedBuffers<'m, M>> {
        let first_writable = if writable { 0 } else { 1 };
        self.map_batch(mem, &[(paddr, len)], first_writable)
    }

    /// Maps `buffers` as `(paddr, len)` pairs. Buffers at index `first_writable` and above are
    /// mapped for writing and are written back when the returned guard is dropped.
    pub fn map_batch<'m, M: GuestMemory + ?Sized>(
        &self,
        mem: &'m mut M,
        buffers: &[(u64, usize)],
        first_writable: usize,
    ) -> Option<MappedBuffers<'m, M>> {
        let mut cache: [Option<HostBlock>; 2] = [None, None];
        let mut mapped = Vec::with_capacity(buffers.len());
        let mut interpolated = 0;
        let mut budget = self.batch_limit;

        for (i, &(paddr, len)) in buffers.iter().enumerate() {
            if len > 0 {
                let end = paddr.checked_add(len as u64)?;
                let side = self.side_of(paddr, end);
                let cached = side.and_then(|s| cache[s]).filter(|b| b.contains(paddr, len));
                if cached.is_some() {
                    interpolated += 1;
                } else {
                    let block = mem.resolve(paddr, len)?;
                    if let Some(s) = side {
                        cache[s].get_or_insert(block);
                    }
                }
            }

            let take = len.min(budget);
            budget -= take;
            let mut data = Vec::new();
            data.try_reserve_exact(take).ok()?;
            data.resize(take, 0);
            if take > 0 {
                mem.read_into(paddr, &mut data).ok()?;
            }
            mapped.push(MappedBuffer {
                paddr,
                writable: i >= first_writable,
                data,
            });
        }

        Some(MappedBuffers {
            mem,
            buffers: mapped,
            interpolated,
        })
    }

    /// Which side of the split `[paddr, end)` lies on, or `None` if it crosses it.
    fn side_of(&self, paddr: u64, end: u64) -> Option<usize> {
        let split = self.split?;
        let last = end - 1;
        match (paddr <= split, last <= split) {
            (true, true) => Some(0),
            (false, false) => Some(1),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct MappedBuffer {
    paddr: u64,
    writable: bool,
    data: Vec<u8>,
}

/// Guard over a batch of mapped guest buffers.
///
/// Dropping the guard writes every writable buffer back to guest memory in full and marks it
/// dirty, whether or not the operation filled all of it.
pub struct MappedBuffers<'m, M: GuestMemory + ?Sized> {
    mem: &'m mut M,
    buffers: Vec<MappedBuffer>,
    interpolated: usize,
}

impl<M: GuestMemory + ?Sized> MappedBuffers<'_, M> {
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(|b| b.data.len()).sum()
    }

    /// Number of buffers that reused a previously resolved RAM block.
    pub fn interpolated(&self) -> usize {
        self.interpolated
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.buffers.get(index).map(|b| b.data.as_slice())
    }

    /// Mutable access to a writable buffer. Read-only buffers return `None`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.buffers
            .get_mut(index)
            .filter(|b| b.writable)
            .map(|b| b.data.as_mut_slice())
    }

    /// Splits the batch into the buffers before `at` (read-only) and the writable buffers from
    /// `at` onwards.
    pub fn split_at(&mut self, at: usize) -> (Vec<&[u8]>, Vec<&mut [u8]>) {
        let at = at.min(self.buffers.len());
        let (head, tail) = self.buffers.split_at_mut(at);
        let send = head.iter().map(|b| b.data.as_slice()).collect();
        let recv = tail
            .iter_mut()
            .filter(|b| b.writable)
            .map(|b| b.data.as_mut_slice())
            .collect();
        (send, recv)
    }
}

impl<M: GuestMemory + ?Sized> Drop for MappedBuffers<'_, M> {
    fn drop(&mut self) {
        for buffer in self.buffers.iter().filter(|b| b.writable && !b.data.is_empty()) {
            // The range was resolved to RAM when it was mapped.
            let written = self.mem.write_from(buffer.paddr, &buffer.data);
            debug_assert!(written.is_ok());
            self.mem.mark_dirty(buffer.paddr, buffer.data.len());
        }
    }
}
