use std::collections::BTreeMap;
use std::io::{Read, Write};

use goldfish_pipe::ChannelKey;
use guest_memory::{GuestMemory, HostBlock};
use pipe_snapshot::io::{ReadBeExt, WriteBeExt};
use pipe_snapshot::{Result, SnapshotError};

/// Most registrations accepted from a snapshot.
const MAX_SAVED_ENTRIES: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaEntry {
    pub size: u64,
    /// Channel that registered the buffer. Not part of the saved state.
    pub key: Option<ChannelKey>,
    host: Option<HostBlock>,
}

impl DmaEntry {
    pub fn has_host_mapping(&self) -> bool {
        self.host.is_some()
    }
}

/// Guest buffers registered for direct host access, keyed by guest physical address.
#[derive(Debug, Default, Clone)]
pub struct DmaMap {
    entries: BTreeMap<u64, DmaEntry>,
}

impl DmaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, paddr: u64) -> Option<&DmaEntry> {
        self.entries.get(&paddr)
    }

    /// Registers `[paddr, paddr + size)`, replacing any registration at `paddr`.
    pub fn add(&mut self, key: ChannelKey, paddr: u64, size: u64) {
        self.entries.insert(
            paddr,
            DmaEntry {
                size,
                key: Some(key),
                host: None,
            },
        );
    }

    pub fn remove(&mut self, paddr: u64) -> Option<DmaEntry> {
        self.entries.remove(&paddr)
    }

    /// Forgets resolved host blocks. Registrations stay and are resolved again on next use.
    pub fn invalidate(&mut self) {
        for entry in self.entries.values_mut() {
            entry.host = None;
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Host block behind the registration at `paddr`, resolving it against `mem` if needed.
    pub fn resolve(&mut self, mem: &dyn GuestMemory, paddr: u64) -> Option<HostBlock> {
        let entry = self.entries.get_mut(&paddr)?;
        if entry.host.is_none() {
            let len = usize::try_from(entry.size).ok()?;
            entry.host = mem.resolve(paddr, len);
        }
        entry.host
    }

    /// Writes `u32 count` then `(u64 paddr, u64 size)` pairs in address order, big-endian.
    pub fn save(&self, out: &mut dyn Write) -> Result<()> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| SnapshotError::Corrupt("too many dma buffers"))?;
        out.write_u32_be(count)?;
        for (paddr, entry) in &self.entries {
            out.write_u64_be(*paddr)?;
            out.write_u64_be(entry.size)?;
        }
        Ok(())
    }

    /// Replaces the registrations with saved ones. Restored entries have no owning channel.
    pub fn load(&mut self, input: &mut dyn Read) -> Result<()> {
        let count = input.read_u32_be()?;
        if count > MAX_SAVED_ENTRIES {
            return Err(SnapshotError::Corrupt("dma buffer count too large"));
        }

        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let paddr = input.read_u64_be()?;
            let size = input.read_u64_be()?;
            entries.insert(
                paddr,
                DmaEntry {
                    size,
                    key: None,
                    host: None,
                },
            );
        }
        self.entries = entries;
        Ok(())
    }
}
