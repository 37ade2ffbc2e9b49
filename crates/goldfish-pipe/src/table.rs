use crate::channel::Channel;
use crate::error::{PipeError, PipeResult};

/// Dense channel table of the v2 protocol, indexed by channel id.
#[derive(Debug)]
pub(crate) struct SlotTable<P> {
    slots: Vec<Option<Channel<P>>>,
    initial_capacity: usize,
    max_capacity: usize,
}

impl<P> SlotTable<P> {
    pub(crate) fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        let initial_capacity = initial_capacity.min(max_capacity);
        let mut slots = Vec::new();
        slots.resize_with(initial_capacity, || None);
        Self {
            slots,
            initial_capacity,
            max_capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub(crate) fn get(&self, id: u32) -> Option<&Channel<P>> {
        self.slots.get(id as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut Channel<P>> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Makes `id` addressable, growing to `max(id + 1, 2 * capacity)` capped at the maximum.
    pub(crate) fn ensure_slot(&mut self, id: u32) -> PipeResult<()> {
        let id = id as usize;
        if id < self.slots.len() {
            return Ok(());
        }
        if id >= self.max_capacity {
            return Err(PipeError::NoMemory);
        }
        let new_len = (id + 1)
            .max(self.slots.len().saturating_mul(2))
            .min(self.max_capacity);
        self.resize(new_len)
    }

    /// Sets the capacity for a restored table. Only valid while empty.
    pub(crate) fn set_capacity(&mut self, capacity: usize) -> PipeResult<()> {
        debug_assert!(self.slots.iter().all(Option::is_none));
        if capacity > self.max_capacity {
            return Err(PipeError::NoMemory);
        }
        self.slots.clear();
        self.resize(capacity)
    }

    fn resize(&mut self, new_len: usize) -> PipeResult<()> {
        let additional = new_len.saturating_sub(self.slots.len());
        self.slots
            .try_reserve_exact(additional)
            .map_err(|_| PipeError::NoMemory)?;
        self.slots.resize_with(new_len, || None);
        Ok(())
    }

    /// Stores `channel` at `id`. The slot must exist and be free.
    pub(crate) fn insert(&mut self, id: u32, channel: Channel<P>) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            debug_assert!(slot.is_none());
            *slot = Some(channel);
        }
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<Channel<P>> {
        self.slots.get_mut(id as usize)?.take()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Live channels in id order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &Channel<P>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| Some((id as u32, slot.as_ref()?)))
    }

    /// Removes every channel and shrinks back to the initial capacity.
    pub(crate) fn drain(&mut self) -> Vec<Channel<P>> {
        let channels = self.slots.drain(..).flatten().collect();
        self.slots.resize_with(self.initial_capacity, || None);
        channels
    }
}
