use std::collections::BTreeSet;

use crate::phys::{GuestMemoryError, GuestMemoryResult};

/// Page-granular record of guest RAM written by devices since the last snapshot.
#[derive(Debug, Clone)]
pub struct DirtyPageTracker {
    page_shift: u32,
    pages: BTreeSet<u64>,
}

impl DirtyPageTracker {
    pub fn new(page_size: u64) -> GuestMemoryResult<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(GuestMemoryError::InvalidPageSize { page_size });
        }
        Ok(Self {
            page_shift: page_size.trailing_zeros(),
            pages: BTreeSet::new(),
        })
    }

    pub fn page_size(&self) -> u64 {
        1 << self.page_shift
    }

    pub fn mark(&mut self, paddr: u64, len: usize) {
        if len == 0 {
            return;
        }
        let last = paddr.saturating_add(len as u64 - 1);
        let first_page = paddr >> self.page_shift;
        let last_page = last >> self.page_shift;
        self.pages.extend(first_page..=last_page);
    }

    pub fn is_dirty(&self, page: u64) -> bool {
        self.pages.contains(&page)
    }

    /// Returns the dirty page indices in ascending order and clears the record.
    pub fn take(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pages).into_iter().collect()
    }
}
