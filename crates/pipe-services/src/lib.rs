//! Host side of goldfish pipe channels: a registry of named services the guest connects to by
//! writing `pipe:<name>[:<args>]`, the `zero` and `pingpong` debug services, and bookkeeping for
//! guest buffers shared with the host.
//!
//! [`ServiceRegistry`] implements [`goldfish_pipe::HostPipeService`], so it plugs straight into a
//! [`goldfish_pipe::PipeDevice`].

mod connector;
mod debug;
mod dma;
mod registry;
mod service;
mod waker;

pub use crate::connector::{ConnectError, CONNECTOR_BUFFER_SIZE};
pub use crate::debug::{PingPongService, ZeroService, PINGPONG_CAPACITY};
pub use crate::dma::{DmaEntry, DmaMap};
pub use crate::registry::{HostPipe, ServiceRegistry};
pub use crate::service::{PipeService, ServicePipe};
pub use crate::waker::HostWaker;
