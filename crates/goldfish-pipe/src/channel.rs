use crate::flags::WakeFlags;
use crate::service::ChannelKey;

/// Guest location of a v2 channel's command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    pub paddr: u64,
    pub rw_params_max_count: u32,
}

/// One open guest <-> host pipe connection.
#[derive(Debug)]
pub struct Channel<P> {
    key: ChannelKey,
    pub(crate) host_pipe: Option<P>,
    pub(crate) wanted: WakeFlags,
    pub(crate) armed: WakeFlags,
    pub(crate) closed: bool,
    pub(crate) command_buffer: Option<CommandBuffer>,
}

impl<P> Channel<P> {
    pub(crate) fn new(key: ChannelKey, host_pipe: P) -> Self {
        Self {
            key,
            host_pipe: Some(host_pipe),
            wanted: WakeFlags::empty(),
            armed: WakeFlags::empty(),
            closed: false,
            command_buffer: None,
        }
    }

    /// A channel whose host end could not be restored. It only accepts CLOSE.
    pub(crate) fn force_closed(key: ChannelKey) -> Self {
        Self {
            key,
            host_pipe: None,
            wanted: WakeFlags::empty(),
            armed: WakeFlags::empty(),
            closed: true,
            command_buffer: None,
        }
    }

    pub(crate) fn with_command_buffer(mut self, command_buffer: CommandBuffer) -> Self {
        self.command_buffer = Some(command_buffer);
        self
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn host_pipe(&self) -> Option<&P> {
        self.host_pipe.as_ref()
    }

    /// Events queued for the guest and not yet delivered.
    pub fn wanted(&self) -> WakeFlags {
        self.wanted
    }

    /// Wake conditions the guest asked for that have not fired yet.
    pub fn armed(&self) -> WakeFlags {
        self.armed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn command_buffer(&self) -> Option<CommandBuffer> {
        self.command_buffer
    }

    /// Hands the pending events to the guest. Delivered conditions are disarmed.
    pub(crate) fn take_wanted(&mut self) -> WakeFlags {
        let delivered = std::mem::take(&mut self.wanted);
        self.armed.remove(delivered);
        delivered
    }
}
