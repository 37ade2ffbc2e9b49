//! Register offsets, command codes and guest-memory structure layouts.
//!
//! All registers are 32 bits wide. The two protocol generations share the `CMD` and `VERSION`
//! offsets and reuse the rest of the block differently.

/// Size of the MMIO window claimed by the device.
pub const PIPE_IO_REGION_SIZE: u64 = 0x2000;

pub const REG_CMD: u64 = 0x00;
pub const REG_VERSION: u64 = 0x24;

/// Legacy (v1) register block.
pub mod v1 {
    pub const REG_STATUS: u64 = 0x04;
    pub const REG_CHANNEL: u64 = 0x08;
    pub const REG_SIZE: u64 = 0x0c;
    pub const REG_ADDRESS: u64 = 0x10;
    pub const REG_WAKES: u64 = 0x14;
    pub const REG_PARAMS_ADDR_LOW: u64 = 0x18;
    pub const REG_PARAMS_ADDR_HIGH: u64 = 0x1c;
    pub const REG_ACCESS_PARAMS: u64 = 0x20;
    pub const REG_CHANNEL_HIGH: u64 = 0x30;
    pub const REG_ADDRESS_HIGH: u64 = 0x34;

    /// `access_params` block written by 32-bit guests.
    pub mod access32 {
        pub const CHANNEL: u64 = 0x00;
        pub const SIZE: u64 = 0x04;
        pub const ADDRESS: u64 = 0x08;
        pub const CMD: u64 = 0x0c;
        pub const RESULT: u64 = 0x10;
        pub const FLAGS: u64 = 0x14;
    }

    /// `access_params` block written by 64-bit guests.
    pub mod access64 {
        pub const CHANNEL: u64 = 0x00;
        pub const SIZE: u64 = 0x08;
        pub const ADDRESS: u64 = 0x0c;
        pub const CMD: u64 = 0x14;
        pub const RESULT: u64 = 0x18;
    }
}

/// Command-buffer (v2) register block.
pub mod v2 {
    pub const REG_SIGNAL_BUFFER_HIGH: u64 = 0x04;
    pub const REG_SIGNAL_BUFFER: u64 = 0x08;
    pub const REG_SIGNAL_BUFFER_COUNT: u64 = 0x0c;
    pub const REG_OPEN_BUFFER_HIGH: u64 = 0x14;
    pub const REG_OPEN_BUFFER: u64 = 0x18;
    pub const REG_GET_SIGNALLED: u64 = 0x30;
}

pub const DEVICE_VERSION_V1: u32 = 1;
pub const DEVICE_VERSION_V2: u32 = 2;

/// Drivers reporting a lower version than this only speak the legacy protocol.
pub const MIN_V2_DRIVER_VERSION: u32 = 4;
/// Newest driver version this device understands.
pub const MAX_DRIVER_VERSION: u32 = 4;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeCmd {
    Open = 1,
    Close = 2,
    Poll = 3,
    Write = 4,
    WakeOnWrite = 5,
    Read = 6,
    WakeOnRead = 7,
    WakeOnDoneIo = 8,
    DmaMapHost = 9,
    DmaUnmapHost = 10,
    Call = 11,
}

impl PipeCmd {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => PipeCmd::Open,
            2 => PipeCmd::Close,
            3 => PipeCmd::Poll,
            4 => PipeCmd::Write,
            5 => PipeCmd::WakeOnWrite,
            6 => PipeCmd::Read,
            7 => PipeCmd::WakeOnRead,
            8 => PipeCmd::WakeOnDoneIo,
            9 => PipeCmd::DmaMapHost,
            10 => PipeCmd::DmaUnmapHost,
            11 => PipeCmd::Call,
            _ => return None,
        })
    }
}

/// Layout of the per-channel v2 command buffer.
pub mod cmdbuf {
    pub const SIZE: usize = 4096;

    pub const CMD: u64 = 0;
    pub const ID: u64 = 4;
    pub const STATUS: u64 = 8;

    pub const RW_BUFFERS_COUNT: u64 = 16;
    pub const RW_CONSUMED_SIZE: u64 = 20;
    pub const RW_PTRS: u64 = 24;

    pub const DMA_PADDR: u64 = 16;
    pub const DMA_SIZE: u64 = 24;

    /// Largest descriptor count whose pointer, size and read-index arrays fit in the buffer.
    pub const MAX_RW_PARAMS: u32 = ((SIZE as u64 - RW_PTRS - 4) / 12) as u32;

    pub const fn rw_sizes(max_count: u32) -> u64 {
        RW_PTRS + 8 * max_count as u64
    }

    pub const fn rw_read_index(max_count: u32) -> u64 {
        RW_PTRS + 12 * max_count as u64
    }
}

/// Layout of the v2 open-command buffer.
pub mod open_params {
    pub const COMMAND_BUFFER_PTR: u64 = 0;
    pub const RW_PARAMS_MAX_COUNT: u64 = 8;
    pub const SIZE: usize = 16;
}

/// Size of one `{ id: u32, flags: u32 }` entry in the v2 signalled-pipes buffer.
pub const SIGNALLED_ENTRY_SIZE: u64 = 8;
