//! The seam between the pipe device and the host side of each channel.

use std::fmt;
use std::io::{self, Read, Write};

use crate::error::PipeResult;
use crate::flags::{PollFlags, WakeFlags};

/// Guest-visible identity of a channel.
///
/// The legacy protocol names channels by a 64-bit driver handle, the current protocol by a dense
/// 32-bit id that is also the slot index in the device's channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelKey {
    Handle(u64),
    Id(u32),
}

impl ChannelKey {
    /// The key as the raw 64-bit value written to guest-visible registers and snapshots.
    pub fn raw(self) -> u64 {
        match self {
            ChannelKey::Handle(handle) => handle,
            ChannelKey::Id(id) => u64::from(id),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Handle(handle) => write!(f, "handle {handle:#x}"),
            ChannelKey::Id(id) => write!(f, "id {id}"),
        }
    }
}

/// Why the device is dropping a host pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The guest issued CLOSE.
    Graceful,
    /// The guest driver re-probed the device.
    Reboot,
    /// Device state is being replaced by a snapshot.
    LoadSnapshot,
    Error,
}

/// Result of restoring one host pipe from a snapshot.
#[derive(Debug)]
pub struct LoadedPipe<P> {
    pub pipe: Option<P>,
    /// Host state could not be restored; the channel comes back closed.
    pub force_close: bool,
}

impl<P> LoadedPipe<P> {
    pub fn restored(pipe: P) -> Self {
        Self {
            pipe: Some(pipe),
            force_close: false,
        }
    }

    pub fn force_closed() -> Self {
        Self {
            pipe: None,
            force_close: true,
        }
    }
}

/// Something that happened on the host side of a channel without a guest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Wake { key: ChannelKey, flags: WakeFlags },
    Close { key: ChannelKey },
}

/// Host implementation of pipe channels.
///
/// The device owns one `Pipe` per open channel and hands it back on every call. Host-initiated
/// wakes and closes are queued by the service and collected through [`take_host_events`].
///
/// [`take_host_events`]: HostPipeService::take_host_events
pub trait HostPipeService {
    type Pipe;

    /// Creates the host end of a new channel. `None` refuses the open.
    fn open(&mut self, key: ChannelKey) -> Option<Self::Pipe>;

    fn close(&mut self, pipe: Self::Pipe, reason: CloseReason);

    /// Consumes bytes from the guest, in buffer order. Returns how many were taken.
    fn send(&mut self, pipe: &mut Self::Pipe, buffers: &[&[u8]]) -> PipeResult<usize>;

    /// Fills guest buffers in order. Returns how many bytes were produced.
    fn recv(&mut self, pipe: &mut Self::Pipe, buffers: &mut [&mut [u8]]) -> PipeResult<usize>;

    fn poll(&mut self, pipe: &mut Self::Pipe) -> PollFlags;

    /// Arms wake conditions. Called once per condition until it fires.
    fn wake_on(&mut self, pipe: &mut Self::Pipe, flags: WakeFlags);

    fn save(&mut self, pipe: &Self::Pipe, out: &mut dyn Write) -> io::Result<()>;

    fn load(&mut self, input: &mut dyn Read, key: ChannelKey) -> LoadedPipe<Self::Pipe>;

    fn pre_save(&mut self) {}
    fn post_save(&mut self) {}
    fn pre_load(&mut self) {}
    fn post_load(&mut self) {}

    /// Registers a guest buffer the host may access directly on behalf of `key`.
    fn dma_add_buffer(&mut self, _key: ChannelKey, _paddr: u64, _size: u64) {}
    fn dma_remove_buffer(&mut self, _paddr: u64) {}
    /// Drops cached host views of DMA buffers, keeping the registrations.
    fn dma_invalidate_host_mappings(&mut self) {}
    /// Forgets every DMA registration.
    fn dma_reset_host_mappings(&mut self) {}
    fn dma_save_mappings(&mut self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }
    fn dma_load_mappings(&mut self, _input: &mut dyn Read) -> io::Result<()> {
        Ok(())
    }

    fn take_host_events(&mut self) -> Vec<HostEvent> {
        Vec::new()
    }
}
