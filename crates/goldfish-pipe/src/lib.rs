//! Emulation of the goldfish pipe device: a paravirtual transport between a guest kernel driver
//! and host-side pipe services.
//!
//! The guest opens *channels* against a single MMIO register block. Two wire-incompatible
//! protocols exist: the legacy one passes every parameter through device registers, the current
//! one gives each channel a command buffer in guest memory and reports wake events in batches.
//! The protocol is picked by the driver version handshake on each `VERSION` probe.
//!
//! The host end of every channel is provided by a [`HostPipeService`].

mod channel;
mod config;
mod device;
mod engine;
mod error;
mod flags;
mod irq;
pub mod regs;
mod service;
mod snapshot;
mod table;
mod v1;
mod v2;
mod wanted;

pub use channel::{Channel, CommandBuffer};
pub use config::{
    PipeDeviceConfig, RamSplit, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY, TRACE_LATENCY_ENV,
};
pub use device::PipeDevice;
pub use error::{
    PipeError, PipeResult, PIPE_ERROR_AGAIN, PIPE_ERROR_INVAL, PIPE_ERROR_IO, PIPE_ERROR_NOMEM,
};
pub use flags::{PollFlags, WakeFlags};
pub use irq::{IrqLine, NoIrq};
pub use service::{ChannelKey, CloseReason, HostEvent, HostPipeService, LoadedPipe};
pub use snapshot::PipeDeviceRestore;
