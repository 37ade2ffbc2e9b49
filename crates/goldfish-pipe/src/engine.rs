//! State and helpers shared by both protocol generations.

use guest_memory::{GuestBufferMapper, GuestMemory};

use crate::channel::Channel;
use crate::flags::WakeFlags;
use crate::irq::InterruptPin;
use crate::regs::{DEVICE_VERSION_V1, DEVICE_VERSION_V2};
use crate::service::{ChannelKey, CloseReason, HostPipeService};
use crate::v1::V1Engine;
use crate::v2::V2Engine;
use crate::wanted::WantedList;

/// Everything a register access may touch besides the engine's own channel table.
pub(crate) struct Ctx<'a, S: HostPipeService> {
    pub(crate) service: &'a mut S,
    pub(crate) wanted: &'a mut WantedList,
    pub(crate) irq: &'a mut InterruptPin,
    pub(crate) mapper: GuestBufferMapper,
    pub(crate) mem: &'a mut dyn GuestMemory,
}

/// The active register protocol. Switched only by a version probe, which first closes every
/// channel.
pub(crate) enum ProtocolEngine<P> {
    V1(V1Engine<P>),
    V2(V2Engine<P>),
}

impl<P> ProtocolEngine<P> {
    pub(crate) fn device_version(&self) -> u32 {
        match self {
            ProtocolEngine::V1(_) => DEVICE_VERSION_V1,
            ProtocolEngine::V2(_) => DEVICE_VERSION_V2,
        }
    }

    pub(crate) fn channel(&self, key: ChannelKey) -> Option<&Channel<P>> {
        match (self, key) {
            (ProtocolEngine::V1(engine), ChannelKey::Handle(handle)) => engine.channel(handle),
            (ProtocolEngine::V2(engine), ChannelKey::Id(id)) => engine.channel(id),
            _ => None,
        }
    }

    pub(crate) fn channel_mut(&mut self, key: ChannelKey) -> Option<&mut Channel<P>> {
        match (self, key) {
            (ProtocolEngine::V1(engine), ChannelKey::Handle(handle)) => engine.channel_mut(handle),
            (ProtocolEngine::V2(engine), ChannelKey::Id(id)) => engine.channel_mut(id),
            _ => None,
        }
    }

    pub(crate) fn channel_count(&self) -> usize {
        match self {
            ProtocolEngine::V1(engine) => engine.channel_count(),
            ProtocolEngine::V2(engine) => engine.channel_count(),
        }
    }

    pub(crate) fn keys(&self) -> Vec<ChannelKey> {
        match self {
            ProtocolEngine::V1(engine) => engine.keys(),
            ProtocolEngine::V2(engine) => engine.keys(),
        }
    }

    /// Removes every channel, leaving an empty table.
    pub(crate) fn drain_channels(&mut self) -> Vec<Channel<P>> {
        match self {
            ProtocolEngine::V1(engine) => engine.drain_channels(),
            ProtocolEngine::V2(engine) => engine.drain_channels(),
        }
    }
}

/// Queues `channel` for the guest with `flags` and raises the interrupt.
pub(crate) fn signal<P>(
    channel: &mut Channel<P>,
    flags: WakeFlags,
    wanted: &mut WantedList,
    irq: &mut InterruptPin,
) {
    if flags.is_empty() {
        return;
    }
    channel.wanted |= flags;
    wanted.push(channel.key());
    irq.raise();
}

/// Arms `flag` on the host pipe unless it is already armed.
///
/// Arming queues nothing by itself. The channel reaches the wanted list, and the interrupt goes
/// up, only once the service reports the condition through `take_host_events`, which may happen
/// within the same register write when the pipe is already ready.
pub(crate) fn arm_wake<S: HostPipeService>(
    service: &mut S,
    channel: &mut Channel<S::Pipe>,
    flag: WakeFlags,
) {
    if channel.armed.contains(flag) {
        return;
    }
    channel.armed |= flag;
    let armed = channel.armed;
    if let Some(pipe) = channel.host_pipe.as_mut() {
        service.wake_on(pipe, armed);
    }
}

/// Releases the host end of a channel that is leaving the table.
pub(crate) fn release<S: HostPipeService>(
    service: &mut S,
    channel: Channel<S::Pipe>,
    reason: CloseReason,
) {
    if let Some(pipe) = channel.host_pipe {
        service.close(pipe, reason);
    }
}

/// Drops `key` from the wanted list, lowering the interrupt if nothing else is pending.
pub(crate) fn unqueue(key: ChannelKey, wanted: &mut WantedList, irq: &mut InterruptPin) {
    wanted.remove(key);
    if wanted.is_empty() {
        irq.lower();
    }
}
