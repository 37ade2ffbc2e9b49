//! Legacy register protocol: one command in flight, parameters in device registers.

use std::collections::HashMap;

use guest_memory::{GuestMemory, GuestMemoryResult};
use tracing::debug;

use crate::channel::Channel;
use crate::engine::{arm_wake, release, unqueue, Ctx};
use crate::error::{transfer_status, PIPE_ERROR_INVAL, PIPE_ERROR_IO};
use crate::flags::{PollFlags, WakeFlags};
use crate::irq::InterruptPin;
use crate::regs::v1::*;
use crate::regs::{PipeCmd, REG_CMD};
use crate::service::{ChannelKey, CloseReason, HostPipeService};
use crate::wanted::WantedList;

/// Device registers of the legacy protocol.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct V1Registers {
    pub(crate) address: u64,
    pub(crate) size: u32,
    pub(crate) status: i32,
    pub(crate) channel: u64,
    pub(crate) wakes: u32,
    pub(crate) params_addr: u64,
}

/// Parameters of a READ/WRITE passed through an `access_params` block.
struct AccessParams {
    channel: u64,
    size: u32,
    address: u64,
    cmd: u32,
    result_offset: u64,
}

impl AccessParams {
    /// Decodes the block at `base`. A zero 32-bit `flags` field identifies the 32-bit layout; in
    /// the 64-bit layout the same bytes hold the (never zero) command.
    fn read(mem: &dyn GuestMemory, base: u64) -> GuestMemoryResult<Self> {
        if mem.read_u32_le(base + access32::FLAGS)? == 0 {
            Ok(Self {
                channel: u64::from(mem.read_u32_le(base + access32::CHANNEL)?),
                size: mem.read_u32_le(base + access32::SIZE)?,
                address: u64::from(mem.read_u32_le(base + access32::ADDRESS)?),
                cmd: mem.read_u32_le(base + access32::CMD)?,
                result_offset: access32::RESULT,
            })
        } else {
            Ok(Self {
                channel: mem.read_u64_le(base + access64::CHANNEL)?,
                size: mem.read_u32_le(base + access64::SIZE)?,
                address: mem.read_u64_le(base + access64::ADDRESS)?,
                cmd: mem.read_u32_le(base + access64::CMD)?,
                result_offset: access64::RESULT,
            })
        }
    }
}

pub(crate) struct V1Engine<P> {
    channels: HashMap<u64, Channel<P>>,
    pub(crate) regs: V1Registers,
}

impl<P> V1Engine<P> {
    pub(crate) fn new() -> Self {
        Self {
            channels: HashMap::new(),
            regs: V1Registers::default(),
        }
    }

    pub(crate) fn channel(&self, handle: u64) -> Option<&Channel<P>> {
        self.channels.get(&handle)
    }

    pub(crate) fn channel_mut(&mut self, handle: u64) -> Option<&mut Channel<P>> {
        self.channels.get_mut(&handle)
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Live channels ordered by handle.
    pub(crate) fn channels(&self) -> Vec<&Channel<P>> {
        let mut channels: Vec<_> = self.channels.values().collect();
        channels.sort_by_key(|ch| ch.key());
        channels
    }

    pub(crate) fn keys(&self) -> Vec<ChannelKey> {
        self.channels().into_iter().map(Channel::key).collect()
    }

    /// Adds a channel restored from a snapshot. Returns false if the handle is taken.
    /// Adds a channel restored from a snapshot, handing it back if the handle is taken.
    pub(crate) fn insert_restored(
        &mut self,
        handle: u64,
        channel: Channel<P>,
    ) -> Result<(), Channel<P>> {
        if self.channels.contains_key(&handle) {
            return Err(channel);
        }
        self.channels.insert(handle, channel);
        Ok(())
    }

    pub(crate) fn drain_channels(&mut self) -> Vec<Channel<P>> {
        self.channels.drain().map(|(_, ch)| ch).collect()
    }

    pub(crate) fn read(
        &mut self,
        offset: u64,
        wanted: &mut WantedList,
        irq: &mut InterruptPin,
    ) -> u32 {
        match offset {
            REG_STATUS => self.regs.status as u32,
            REG_CHANNEL => match wanted.pop_front() {
                Some(key) => {
                    let handle = key.raw();
                    self.regs.wakes = self
                        .channels
                        .get_mut(&handle)
                        .map_or(WakeFlags::empty(), Channel::take_wanted)
                        .bits()
                        .into();
                    if wanted.is_empty() {
                        irq.lower();
                    }
                    handle as u32
                }
                None => {
                    irq.lower();
                    0
                }
            },
            REG_CHANNEL_HIGH => match wanted.pop_front() {
                Some(key) => {
                    wanted.park(key);
                    (key.raw() >> 32) as u32
                }
                None => {
                    irq.lower();
                    0
                }
            },
            REG_WAKES => self.regs.wakes,
            REG_PARAMS_ADDR_HIGH => (self.regs.params_addr >> 32) as u32,
            REG_PARAMS_ADDR_LOW => self.regs.params_addr as u32,
            _ => {
                debug!(offset, "read of unknown legacy pipe register");
                0
            }
        }
    }

    pub(crate) fn write<S>(&mut self, offset: u64, value: u32, ctx: &mut Ctx<'_, S>)
    where
        S: HostPipeService<Pipe = P>,
    {
        match offset {
            REG_CMD => self.regs.status = self.run_command(value, ctx),
            REG_ACCESS_PARAMS => self.access_params(ctx),
            _ => self.write_register(offset, value),
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        let regs = &mut self.regs;
        match offset {
            REG_SIZE => regs.size = value,
            REG_ADDRESS => regs.address = set_low(regs.address, value),
            REG_ADDRESS_HIGH => regs.address = set_high(regs.address, value),
            REG_CHANNEL => regs.channel = set_low(regs.channel, value),
            REG_CHANNEL_HIGH => regs.channel = set_high(regs.channel, value),
            REG_PARAMS_ADDR_LOW => regs.params_addr = set_low(regs.params_addr, value),
            REG_PARAMS_ADDR_HIGH => regs.params_addr = set_high(regs.params_addr, value),
            _ => debug!(offset, value, "write to unknown legacy pipe register"),
        }
    }

    fn access_params<S>(&mut self, ctx: &mut Ctx<'_, S>)
    where
        S: HostPipeService<Pipe = P>,
    {
        let base = self.regs.params_addr;
        if base == 0 {
            return;
        }
        let params = match AccessParams::read(&*ctx.mem, base) {
            Ok(params) => params,
            Err(err) => {
                debug!(base, %err, "unreadable access_params block");
                return;
            }
        };

        self.regs.channel = params.channel;
        self.regs.size = params.size;
        self.regs.address = params.address;
        if params.cmd != PipeCmd::Read as u32 && params.cmd != PipeCmd::Write as u32 {
            return;
        }

        self.regs.status = self.run_command(params.cmd, ctx);
        let result = ctx
            .mem
            .write_u32_le(base + params.result_offset, self.regs.status as u32);
        if let Err(err) = result {
            debug!(base, %err, "cannot write access_params result");
        }
    }

    /// Runs `raw` against the channel named by the CHANNEL registers and returns the status.
    fn run_command<S>(&mut self, raw: u32, ctx: &mut Ctx<'_, S>) -> i32
    where
        S: HostPipeService<Pipe = P>,
    {
        let handle = self.regs.channel;
        let cmd = PipeCmd::from_raw(raw);
        if cmd == Some(PipeCmd::Open) {
            return self.open(handle, ctx);
        }

        let Some(channel) = self.channels.get_mut(&handle) else {
            debug!(channel = handle, cmd = raw, "command for unknown channel");
            return PIPE_ERROR_INVAL;
        };
        if channel.closed && cmd != Some(PipeCmd::Close) {
            return PIPE_ERROR_IO;
        }

        match cmd {
            Some(PipeCmd::Close) => {
                if let Some(channel) = self.channels.remove(&handle) {
                    unqueue(channel.key(), ctx.wanted, ctx.irq);
                    release(ctx.service, channel, CloseReason::Graceful);
                }
                0
            }
            Some(PipeCmd::Poll) => {
                let flags = match channel.host_pipe.as_mut() {
                    Some(pipe) => ctx.service.poll(pipe),
                    None => PollFlags::HUP,
                };
                flags.bits() as i32
            }
            Some(PipeCmd::Read) => transfer(channel, &self.regs, true, ctx),
            Some(PipeCmd::Write) => transfer(channel, &self.regs, false, ctx),
            Some(PipeCmd::WakeOnRead) => {
                arm_wake(ctx.service, channel, WakeFlags::READ);
                0
            }
            Some(PipeCmd::WakeOnWrite) => {
                arm_wake(ctx.service, channel, WakeFlags::WRITE);
                0
            }
            _ => {
                debug!(channel = handle, cmd = raw, "unsupported legacy pipe command");
                PIPE_ERROR_INVAL
            }
        }
    }

    fn open<S>(&mut self, handle: u64, ctx: &mut Ctx<'_, S>) -> i32
    where
        S: HostPipeService<Pipe = P>,
    {
        if self.channels.contains_key(&handle) {
            debug!(channel = handle, "open of an existing channel");
            return PIPE_ERROR_INVAL;
        }
        let key = ChannelKey::Handle(handle);
        let Some(pipe) = ctx.service.open(key) else {
            debug!(channel = handle, "host refused to open channel");
            return PIPE_ERROR_INVAL;
        };
        self.channels.insert(handle, Channel::new(key, pipe));
        0
    }
}

/// Moves the single `address`/`size` buffer to or from the host pipe.
fn transfer<S: HostPipeService>(
    channel: &mut Channel<S::Pipe>,
    regs: &V1Registers,
    to_guest: bool,
    ctx: &mut Ctx<'_, S>,
) -> i32 {
    let Some(pipe) = channel.host_pipe.as_mut() else {
        return PIPE_ERROR_IO;
    };
    let Some(mut mapped) = ctx
        .mapper
        .map(&mut *ctx.mem, regs.address, regs.size as usize, to_guest)
    else {
        debug!(address = regs.address, size = regs.size, "unmappable transfer buffer");
        return PIPE_ERROR_INVAL;
    };

    let result = if to_guest {
        let (_, mut recv) = mapped.split_at(0);
        ctx.service.recv(pipe, &mut recv)
    } else {
        let (send, _) = mapped.split_at(1);
        ctx.service.send(pipe, &send)
    };
    transfer_status(result)
}

fn set_low(reg: u64, value: u32) -> u64 {
    (reg & !0xffff_ffff) | u64::from(value)
}

fn set_high(reg: u64, value: u32) -> u64 {
    (reg & 0xffff_ffff) | (u64::from(value) << 32)
}
