use std::collections::{HashSet, VecDeque};

use crate::service::ChannelKey;

/// FIFO of channels with events pending for the guest, at most one entry per channel.
///
/// The legacy protocol reads a 64-bit channel in two halves. After the high half is read the
/// popped key is parked here until the low half read completes; it still counts as queued.
#[derive(Debug, Default)]
pub(crate) struct WantedList {
    queue: VecDeque<ChannelKey>,
    members: HashSet<ChannelKey>,
    parked: Option<ChannelKey>,
}

impl WantedList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues `key`. Returns false if it was already queued or parked.
    pub(crate) fn push(&mut self, key: ChannelKey) -> bool {
        if self.parked == Some(key) || !self.members.insert(key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Takes the parked key if there is one, else the oldest queued key.
    pub(crate) fn pop_front(&mut self) -> Option<ChannelKey> {
        if let Some(key) = self.parked.take() {
            return Some(key);
        }
        let key = self.queue.pop_front()?;
        self.members.remove(&key);
        Some(key)
    }

    pub(crate) fn park(&mut self, key: ChannelKey) {
        debug_assert!(self.parked.is_none());
        self.members.remove(&key);
        self.queue.retain(|k| *k != key);
        self.parked = Some(key);
    }

    pub(crate) fn parked(&self) -> Option<ChannelKey> {
        self.parked
    }

    pub(crate) fn remove(&mut self, key: ChannelKey) {
        if self.parked == Some(key) {
            self.parked = None;
        }
        if self.members.remove(&key) {
            self.queue.retain(|k| *k != key);
        }
    }

    pub(crate) fn contains(&self, key: ChannelKey) -> bool {
        self.parked == Some(key) || self.members.contains(&key)
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
        self.parked = None;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.parked.is_none() && self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len() + usize::from(self.parked.is_some())
    }

    /// Queued keys in delivery order, excluding the parked key.
    pub(crate) fn queued(&self) -> impl Iterator<Item = ChannelKey> + '_ {
        self.queue.iter().copied()
    }

    /// Every key, parked first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = ChannelKey> + '_ {
        self.parked.into_iter().chain(self.queue.iter().copied())
    }
}
