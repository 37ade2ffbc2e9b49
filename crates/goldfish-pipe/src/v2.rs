//! Command-buffer protocol: each channel owns a page of guest memory describing its current
//! command, and wake events are reported in batches through a signalled-pipes buffer.

use guest_memory::GuestMemory;
use tracing::{debug, warn};

use crate::channel::{Channel, CommandBuffer};
use crate::engine::{arm_wake, release, unqueue, Ctx};
use crate::error::{transfer_status, PIPE_ERROR_INVAL, PIPE_ERROR_IO, PIPE_ERROR_NOMEM};
use crate::flags::{PollFlags, WakeFlags};
use crate::regs::v2::*;
use crate::regs::{cmdbuf, open_params, PipeCmd, REG_CMD, SIGNALLED_ENTRY_SIZE};
use crate::service::{ChannelKey, CloseReason, HostPipeService};
use crate::table::SlotTable;

/// Device registers of the command-buffer protocol.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct V2Registers {
    pub(crate) signal_addr: u64,
    pub(crate) signal_count: u32,
    pub(crate) open_addr: u64,
}

pub(crate) struct V2Engine<P> {
    table: SlotTable<P>,
    pub(crate) regs: V2Registers,
}

impl<P> V2Engine<P> {
    pub(crate) fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        Self {
            table: SlotTable::new(initial_capacity, max_capacity),
            regs: V2Registers::default(),
        }
    }

    pub(crate) fn channel(&self, id: u32) -> Option<&Channel<P>> {
        self.table.get(id)
    }

    pub(crate) fn channel_mut(&mut self, id: u32) -> Option<&mut Channel<P>> {
        self.table.get_mut(id)
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub(crate) fn channels(&self) -> impl Iterator<Item = &Channel<P>> {
        self.table.iter().map(|(_, ch)| ch)
    }

    pub(crate) fn keys(&self) -> Vec<ChannelKey> {
        self.table.iter().map(|(_, ch)| ch.key()).collect()
    }

    /// Sizes an empty table to a snapshot's capacity.
    pub(crate) fn restore_capacity(&mut self, capacity: usize) -> bool {
        capacity <= self.table.max_capacity() && self.table.set_capacity(capacity).is_ok()
    }

    /// Adds a channel restored from a snapshot, handing it back if the id is out of range or
    /// taken.
    pub(crate) fn insert_restored(
        &mut self,
        id: u32,
        channel: Channel<P>,
    ) -> Result<(), Channel<P>> {
        if id as usize >= self.table.capacity() || self.table.contains(id) {
            return Err(channel);
        }
        self.table.insert(id, channel);
        Ok(())
    }

    pub(crate) fn drain_channels(&mut self) -> Vec<Channel<P>> {
        self.table.drain()
    }

    pub(crate) fn read<S>(&mut self, offset: u64, ctx: &mut Ctx<'_, S>) -> u32
    where
        S: HostPipeService<Pipe = P>,
    {
        match offset {
            REG_GET_SIGNALLED => self.get_signalled(ctx),
            _ => {
                debug!(offset, "read of unknown pipe register");
                0
            }
        }
    }

    pub(crate) fn write<S>(&mut self, offset: u64, value: u32, ctx: &mut Ctx<'_, S>)
    where
        S: HostPipeService<Pipe = P>,
    {
        let regs = &mut self.regs;
        match offset {
            REG_SIGNAL_BUFFER_HIGH => regs.signal_addr = u64::from(value) << 32,
            REG_SIGNAL_BUFFER => regs.signal_addr |= u64::from(value),
            REG_SIGNAL_BUFFER_COUNT => {
                regs.signal_count = value;
                let len = SIGNALLED_ENTRY_SIZE as usize * value as usize;
                if ctx.mem.resolve(regs.signal_addr, len).is_none() {
                    warn!(addr = regs.signal_addr, count = value, "signalled pipe buffer is not in RAM");
                }
            }
            REG_OPEN_BUFFER_HIGH => regs.open_addr = u64::from(value) << 32,
            REG_OPEN_BUFFER => {
                regs.open_addr |= u64::from(value);
                if ctx.mem.resolve(regs.open_addr, open_params::SIZE).is_none() {
                    warn!(addr = regs.open_addr, "open command buffer is not in RAM");
                }
            }
            REG_CMD => {
                if self.table.contains(value) {
                    self.run_command(value, ctx);
                } else {
                    self.open_or_close(value, ctx);
                }
            }
            _ => debug!(offset, value, "write to unknown pipe register"),
        }
    }

    /// Moves up to `signal_count` wanted channels into the guest's signalled buffer.
    fn get_signalled<S>(&mut self, ctx: &mut Ctx<'_, S>) -> u32
    where
        S: HostPipeService<Pipe = P>,
    {
        let base = self.regs.signal_addr;
        let capacity = self.regs.signal_count;
        let len = SIGNALLED_ENTRY_SIZE as usize * capacity as usize;
        if ctx.mem.resolve(base, len).is_none() {
            warn!(addr = base, count = capacity, "cannot report signalled pipes");
            return 0;
        }

        let mut count = 0u32;
        while count < capacity {
            let Some(key) = ctx.wanted.pop_front() else {
                break;
            };
            let ChannelKey::Id(id) = key else {
                continue;
            };
            let flags = self
                .table
                .get_mut(id)
                .map_or(WakeFlags::empty(), Channel::take_wanted);
            let entry = base + SIGNALLED_ENTRY_SIZE * u64::from(count);
            let written = ctx
                .mem
                .write_u32_le(entry, id)
                .and_then(|()| ctx.mem.write_u32_le(entry + 4, u32::from(flags.bits())));
            if let Err(err) = written {
                warn!(channel = id, %err, "lost signalled pipe entry");
            }
            count += 1;
        }

        if ctx.wanted.is_empty() {
            ctx.irq.lower();
        }
        count
    }

    /// Handles a CMD write for an id with no live channel, using the open-command buffer.
    fn open_or_close<S>(&mut self, id: u32, ctx: &mut Ctx<'_, S>)
    where
        S: HostPipeService<Pipe = P>,
    {
        let open_addr = self.regs.open_addr;
        let params = ctx
            .mem
            .resolve(open_addr, open_params::SIZE)
            .and_then(|_| {
                let ptr = ctx.mem.read_u64_le(open_addr + open_params::COMMAND_BUFFER_PTR).ok()?;
                let max = ctx.mem.read_u32_le(open_addr + open_params::RW_PARAMS_MAX_COUNT).ok()?;
                Some(CommandBuffer {
                    paddr: ptr,
                    rw_params_max_count: max,
                })
            });
        let Some(command_buffer) = params else {
            warn!(channel = id, addr = open_addr, "open command buffer is not mapped");
            return;
        };
        if ctx.mem.resolve(command_buffer.paddr, cmdbuf::SIZE).is_none() {
            warn!(channel = id, addr = command_buffer.paddr, "command buffer is not mapped");
            return;
        }

        let status = self.open(id, command_buffer, ctx);
        write_status(ctx.mem, command_buffer.paddr, status);
    }

    fn open<S>(&mut self, id: u32, command_buffer: CommandBuffer, ctx: &mut Ctx<'_, S>) -> i32
    where
        S: HostPipeService<Pipe = P>,
    {
        let max = command_buffer.rw_params_max_count;
        if max < 1 || max > cmdbuf::MAX_RW_PARAMS {
            debug!(channel = id, max, "bad rw_params_max_count");
            return PIPE_ERROR_INVAL;
        }
        let mem = &*ctx.mem;
        let (Ok(buffer_id), Ok(raw)) = (
            mem.read_u32_le(command_buffer.paddr + cmdbuf::ID),
            mem.read_u32_le(command_buffer.paddr + cmdbuf::CMD),
        ) else {
            return PIPE_ERROR_INVAL;
        };
        if buffer_id != id {
            debug!(channel = id, buffer_id, "command buffer names another channel");
            return PIPE_ERROR_INVAL;
        }
        match PipeCmd::from_raw(raw) {
            // Closing an already closed channel is fine.
            Some(PipeCmd::Close) => return 0,
            Some(PipeCmd::Open) => {}
            _ => {
                debug!(channel = id, cmd = raw, "command for unknown channel");
                return PIPE_ERROR_INVAL;
            }
        }

        if let Err(err) = self.table.ensure_slot(id) {
            warn!(channel = id, capacity = self.table.capacity(), "cannot grow channel table");
            return err.status();
        }
        let key = ChannelKey::Id(id);
        let Some(pipe) = ctx.service.open(key) else {
            debug!(channel = id, "host refused to open channel");
            return PIPE_ERROR_NOMEM;
        };
        self.table
            .insert(id, Channel::new(key, pipe).with_command_buffer(command_buffer));
        0
    }

    fn run_command<S>(&mut self, id: u32, ctx: &mut Ctx<'_, S>)
    where
        S: HostPipeService<Pipe = P>,
    {
        let Some(command_buffer) = self.table.get(id).and_then(Channel::command_buffer) else {
            return;
        };
        let raw = match ctx.mem.read_u32_le(command_buffer.paddr + cmdbuf::CMD) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(channel = id, %err, "command buffer is no longer readable");
                return;
            }
        };
        let cmd = PipeCmd::from_raw(raw);

        let status = if cmd == Some(PipeCmd::Close) {
            self.close(id, ctx)
        } else {
            match self.table.get_mut(id) {
                Some(channel) => command(channel, cmd, raw, command_buffer, ctx),
                None => PIPE_ERROR_INVAL,
            }
        };
        write_status(ctx.mem, command_buffer.paddr, status);
    }

    fn close<S>(&mut self, id: u32, ctx: &mut Ctx<'_, S>) -> i32
    where
        S: HostPipeService<Pipe = P>,
    {
        let Some(channel) = self.table.remove(id) else {
            return PIPE_ERROR_INVAL;
        };
        unqueue(channel.key(), ctx.wanted, ctx.irq);
        release(ctx.service, channel, CloseReason::Graceful);
        0
    }
}

/// Executes every command except OPEN and CLOSE against a live channel.
fn command<S: HostPipeService>(
    channel: &mut Channel<S::Pipe>,
    cmd: Option<PipeCmd>,
    raw: u32,
    command_buffer: CommandBuffer,
    ctx: &mut Ctx<'_, S>,
) -> i32 {
    if channel.closed {
        return PIPE_ERROR_IO;
    }
    let paddr = command_buffer.paddr;
    match cmd {
        Some(PipeCmd::Poll) => {
            let flags = match channel.host_pipe.as_mut() {
                Some(pipe) => ctx.service.poll(pipe),
                None => PollFlags::HUP,
            };
            flags.bits() as i32
        }
        Some(op @ (PipeCmd::Read | PipeCmd::Write | PipeCmd::Call)) => {
            transfer(channel, op, command_buffer, ctx)
        }
        Some(PipeCmd::WakeOnRead) => {
            arm_wake(ctx.service, channel, WakeFlags::READ);
            0
        }
        Some(PipeCmd::WakeOnWrite) => {
            arm_wake(ctx.service, channel, WakeFlags::WRITE);
            0
        }
        Some(PipeCmd::DmaMapHost) => {
            let mem = &*ctx.mem;
            let (Ok(dma_paddr), Ok(size)) = (
                mem.read_u64_le(paddr + cmdbuf::DMA_PADDR),
                mem.read_u64_le(paddr + cmdbuf::DMA_SIZE),
            ) else {
                return PIPE_ERROR_INVAL;
            };
            ctx.service.dma_add_buffer(channel.key(), dma_paddr, size);
            0
        }
        Some(PipeCmd::DmaUnmapHost) => {
            let Ok(dma_paddr) = ctx.mem.read_u64_le(paddr + cmdbuf::DMA_PADDR) else {
                return PIPE_ERROR_INVAL;
            };
            ctx.service.dma_remove_buffer(dma_paddr);
            0
        }
        _ => {
            debug!(channel = %channel.key(), cmd = raw, "unsupported pipe command");
            PIPE_ERROR_INVAL
        }
    }
}

/// Runs a READ, WRITE or CALL over the buffer descriptors in the command buffer.
///
/// WRITE sends every buffer and READ receives into every buffer. CALL sends the buffers before
/// `read_index` and, unless that fails, receives into the rest.
fn transfer<S: HostPipeService>(
    channel: &mut Channel<S::Pipe>,
    op: PipeCmd,
    command_buffer: CommandBuffer,
    ctx: &mut Ctx<'_, S>,
) -> i32 {
    let paddr = command_buffer.paddr;
    let max = command_buffer.rw_params_max_count;
    write_consumed(ctx.mem, paddr, 0);

    let Some((buffers, read_index)) = read_descriptors(&*ctx.mem, command_buffer, op) else {
        return PIPE_ERROR_INVAL;
    };
    if buffers.is_empty() {
        debug!(channel = %channel.key(), max, "transfer without buffers");
        return PIPE_ERROR_INVAL;
    }
    let Some(pipe) = channel.host_pipe.as_mut() else {
        return PIPE_ERROR_IO;
    };

    let mut status = 0;
    let mut consumed: u64 = 0;
    {
        let Some(mut mapped) = ctx.mapper.map_batch(&mut *ctx.mem, &buffers, read_index) else {
            debug!(channel = %channel.key(), "transfer buffers are not in RAM");
            return PIPE_ERROR_INVAL;
        };
        let (send, mut recv) = mapped.split_at(read_index);
        if !send.is_empty() {
            status = transfer_status(ctx.service.send(pipe, &send));
            consumed += u64::try_from(status).unwrap_or(0);
        }
        if status >= 0 && !recv.is_empty() {
            status = transfer_status(ctx.service.recv(pipe, &mut recv));
            consumed += u64::try_from(status).unwrap_or(0);
        }
    }

    let consumed = u32::try_from(consumed).unwrap_or(i32::MAX as u32).min(i32::MAX as u32);
    let status = if op == PipeCmd::Call {
        if consumed > 0 {
            0
        } else {
            status
        }
    } else if status < 0 {
        status
    } else {
        0
    };
    if status >= 0 {
        write_consumed(ctx.mem, paddr, consumed);
    }
    debug!(channel = %channel.key(), ?op, buffers = buffers.len(), status, consumed, "pipe transfer");
    status
}

/// Reads the `(paddr, len)` descriptors of a transfer and the index of the first receive buffer.
fn read_descriptors(
    mem: &dyn GuestMemory,
    command_buffer: CommandBuffer,
    op: PipeCmd,
) -> Option<(Vec<(u64, usize)>, usize)> {
    let paddr = command_buffer.paddr;
    let max = command_buffer.rw_params_max_count;
    let count = mem
        .read_u32_le(paddr + cmdbuf::RW_BUFFERS_COUNT)
        .ok()?
        .min(max);

    let mut buffers = Vec::with_capacity(count as usize);
    for i in 0..u64::from(count) {
        let ptr = mem.read_u64_le(paddr + cmdbuf::RW_PTRS + 8 * i).ok()?;
        let len = mem.read_u32_le(paddr + cmdbuf::rw_sizes(max) + 4 * i).ok()?;
        buffers.push((ptr, len as usize));
    }

    let read_index = match op {
        PipeCmd::Write => buffers.len(),
        PipeCmd::Call => {
            let index = mem.read_u32_le(paddr + cmdbuf::rw_read_index(max)).ok()?;
            (index as usize).min(buffers.len())
        }
        _ => 0,
    };
    Some((buffers, read_index))
}

fn write_status(mem: &mut dyn GuestMemory, paddr: u64, status: i32) {
    if let Err(err) = mem.write_u32_le(paddr + cmdbuf::STATUS, status as u32) {
        warn!(addr = paddr, %err, "cannot write pipe command status");
    }
}

fn write_consumed(mem: &mut dyn GuestMemory, paddr: u64, consumed: u32) {
    if let Err(err) = mem.write_u32_le(paddr + cmdbuf::RW_CONSUMED_SIZE, consumed) {
        warn!(addr = paddr, %err, "cannot write pipe consumed size");
    }
}
