//! Guest physical memory as seen by paravirtual devices.
//!
//! Devices never hold host references into guest RAM across operations. Instead they resolve a
//! guest physical range to a host-backed block, copy it into a [`MappedBuffers`] guard for the
//! duration of one command, and let the guard write the data back on drop.

mod dirty;
mod layout;
mod mapper;
mod phys;

pub use crate::dirty::DirtyPageTracker;
pub use crate::layout::{RamLayout, RamLayoutError, RamRegion};
pub use crate::mapper::{GuestBufferMapper, MappedBuffers, DEFAULT_BATCH_LIMIT};
pub use crate::phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult, HostBlock};
