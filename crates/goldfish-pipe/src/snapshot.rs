//! Save and restore of the device, its channels and the host pipes behind them.
//!
//! Fields are big-endian. Host pipe state is stored as a length-prefixed blob so a pipe that
//! cannot be restored is skipped without losing the position in the stream; such channels come
//! back closed with a pending CLOSED event.

use std::io::{Read, Write};

use guest_memory::GuestMemory;
use pipe_snapshot::io::{ReadBeExt, WriteBeExt};
use pipe_snapshot::{Result, SnapshotError, SnapshotSource, SnapshotTarget};
use tracing::{debug, warn};

use crate::channel::{Channel, CommandBuffer};
use crate::config::PipeDeviceConfig;
use crate::device::PipeDevice;
use crate::engine::{release, ProtocolEngine};
use crate::flags::WakeFlags;
use crate::regs::{
    cmdbuf, open_params, DEVICE_VERSION_V1, DEVICE_VERSION_V2, MAX_DRIVER_VERSION,
    SIGNALLED_ENTRY_SIZE,
};
use crate::service::{ChannelKey, CloseReason, HostPipeService};
use crate::v1::{V1Engine, V1Registers};
use crate::v2::{V2Engine, V2Registers};
use crate::wanted::WantedList;

const MAX_HOST_PIPE_BLOB: usize = 64 * 1024 * 1024;
const MAX_DMA_BLOB: usize = 16 * 1024 * 1024;

/// Device state decoded from a stream but not yet installed.
struct Staged<P> {
    engine: ProtocolEngine<P>,
    wanted: WantedList,
    driver_version: u32,
    force_closed: Vec<ChannelKey>,
}

impl<S: HostPipeService> PipeDevice<S> {
    /// Writes the device section: registers, channels with their host pipe state, the wanted list
    /// and the service's DMA registrations.
    pub fn save_state(&mut self, w: &mut dyn Write) -> Result<()> {
        self.service.pre_save();
        let result = self.write_state(w);
        self.service.post_save();
        result
    }

    fn write_state(&mut self, w: &mut dyn Write) -> Result<()> {
        match &self.engine {
            ProtocolEngine::V1(engine) => {
                let regs = &engine.regs;
                w.write_u32_be(DEVICE_VERSION_V1)?;
                w.write_u64_be(regs.address)?;
                w.write_u32_be(regs.size)?;
                w.write_i32_be(regs.status)?;
                w.write_u64_be(regs.channel)?;
                w.write_u32_be(regs.wakes)?;
                w.write_u64_be(regs.params_addr)?;

                let channels = engine.channels();
                w.write_u32_be(len_u32(channels.len())?)?;
                for channel in channels {
                    w.write_u64_be(channel.key().raw())?;
                    write_channel_state(&mut self.service, channel, w)?;
                }

                let queued: Vec<ChannelKey> = self.wanted.queued().collect();
                w.write_u32_be(len_u32(queued.len())?)?;
                for key in queued {
                    w.write_u64_be(key.raw())?;
                }
                match self.wanted.parked() {
                    Some(key) => {
                        w.write_bool(true)?;
                        w.write_u64_be(key.raw())?;
                    }
                    None => w.write_bool(false)?,
                }
            }
            ProtocolEngine::V2(engine) => {
                let regs = &engine.regs;
                w.write_u32_be(DEVICE_VERSION_V2)?;
                w.write_u32_be(self.driver_version)?;
                w.write_u32_be(regs.signal_count)?;
                w.write_u64_be(regs.signal_addr)?;
                w.write_u64_be(regs.open_addr)?;
                w.write_u32_be(len_u32(engine.capacity())?)?;

                w.write_u32_be(len_u32(engine.channel_count())?)?;
                for channel in engine.channels() {
                    let command_buffer = channel.command_buffer().unwrap_or(CommandBuffer {
                        paddr: 0,
                        rw_params_max_count: 0,
                    });
                    w.write_u32_be(channel.key().raw() as u32)?;
                    w.write_u64_be(command_buffer.paddr)?;
                    w.write_u32_be(command_buffer.rw_params_max_count)?;
                    write_channel_state(&mut self.service, channel, w)?;
                }

                w.write_u32_be(len_u32(self.wanted.len())?)?;
                for key in self.wanted.iter() {
                    w.write_u32_be(key.raw() as u32)?;
                }
            }
        }

        self.service.dma_invalidate_host_mappings();
        let mut dma = Vec::new();
        self.service.dma_save_mappings(&mut dma)?;
        w.write_len_prefixed_bytes_u32(&dma)?;
        Ok(())
    }

    /// Replaces the device state with the one in `r`.
    ///
    /// Existing channels are closed first. On error the device is left reset, with no channels,
    /// no DMA registrations and the interrupt low. The interrupt is not raised here even if events are pending; call
    /// [`post_load`](Self::post_load) once the rest of the machine is restored.
    pub fn load_state(&mut self, r: &mut dyn Read, mem: &dyn GuestMemory) -> Result<()> {
        self.close_all(CloseReason::LoadSnapshot);
        self.service.pre_load();

        let mut staged = Staged {
            engine: self.engine_for(MAX_DRIVER_VERSION),
            wanted: WantedList::new(),
            driver_version: self.driver_version,
            force_closed: Vec::new(),
        };
        let result = read_state(&mut self.service, &self.config, &mut staged, r, mem);
        match result {
            Ok(()) => {
                for key in &staged.force_closed {
                    if let Some(channel) = staged.engine.channel_mut(*key) {
                        channel.wanted |= WakeFlags::CLOSED;
                        staged.wanted.push(*key);
                    }
                    warn!(channel = %key, "host pipe not restored, channel force-closed");
                }
                self.engine = staged.engine;
                self.wanted = staged.wanted;
                self.driver_version = staged.driver_version;
                debug!(
                    device_version = self.engine.device_version(),
                    channels = self.engine.channel_count(),
                    wanted = self.wanted.len(),
                    "pipe device restored"
                );
            }
            Err(ref err) => {
                warn!(%err, "pipe device snapshot rejected");
                for channel in staged.engine.drain_channels() {
                    release(&mut self.service, channel, CloseReason::LoadSnapshot);
                }
                self.service.dma_reset_host_mappings();
                self.engine = self.engine_for(self.driver_version);
            }
        }

        self.service.post_load();
        result
    }

    /// Raises the interrupt if the restored state has events pending.
    pub fn post_load(&mut self) {
        self.irq.set(!self.wanted.is_empty());
    }
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| SnapshotError::Corrupt("count does not fit in u32"))
}

fn write_channel_state<S: HostPipeService>(
    service: &mut S,
    channel: &Channel<S::Pipe>,
    w: &mut dyn Write,
) -> Result<()> {
    w.write_bool(channel.is_closed())?;
    w.write_u8(channel.wanted().bits())?;
    w.write_u8(channel.armed().bits())?;

    let Some(pipe) = channel.host_pipe() else {
        return w.write_bool(false);
    };
    let mut blob = Vec::new();
    match service.save(pipe, &mut blob) {
        Ok(()) => {
            w.write_bool(true)?;
            w.write_len_prefixed_bytes_u32(&blob)
        }
        Err(err) => {
            warn!(channel = %channel.key(), %err, "cannot save host pipe; it will be closed on load");
            w.write_bool(false)
        }
    }
}

/// Reads the per-channel fields shared by both versions and restores the host pipe.
fn read_channel<S: HostPipeService>(
    service: &mut S,
    key: ChannelKey,
    r: &mut dyn Read,
    force_closed: &mut Vec<ChannelKey>,
) -> Result<Channel<S::Pipe>> {
    let closed = r.read_bool()?;
    let wanted = WakeFlags::from_bits_truncate(r.read_u8()?);
    let armed = WakeFlags::from_bits_truncate(r.read_u8()?);

    let pipe = if r.read_bool()? {
        let blob = r.read_len_prefixed_bytes_u32(MAX_HOST_PIPE_BLOB)?;
        let loaded = service.load(&mut blob.as_slice(), key);
        match loaded.pipe {
            Some(pipe) if !loaded.force_close => Some(pipe),
            Some(pipe) => {
                service.close(pipe, CloseReason::LoadSnapshot);
                None
            }
            None => None,
        }
    } else {
        None
    };

    let mut channel = match pipe {
        Some(pipe) => Channel::new(key, pipe),
        None => {
            force_closed.push(key);
            Channel::force_closed(key)
        }
    };
    channel.closed |= closed;
    channel.wanted = wanted;
    channel.armed = armed;
    Ok(channel)
}

fn read_state<S: HostPipeService>(
    service: &mut S,
    config: &PipeDeviceConfig,
    staged: &mut Staged<S::Pipe>,
    r: &mut dyn Read,
    mem: &dyn GuestMemory,
) -> Result<()> {
    match r.read_u32_be()? {
        DEVICE_VERSION_V1 => read_v1(service, staged, r)?,
        DEVICE_VERSION_V2 => read_v2(service, config, staged, r, mem)?,
        other => return Err(SnapshotError::UnsupportedDeviceVersion(other)),
    }

    let dma = r.read_len_prefixed_bytes_u32(MAX_DMA_BLOB)?;
    service.dma_load_mappings(&mut dma.as_slice())?;
    service.dma_invalidate_host_mappings();

    // Keep the wanted list and the per-channel flags in agreement.
    for key in staged.engine.keys() {
        let pending = staged
            .engine
            .channel(key)
            .is_some_and(|ch| !ch.wanted().is_empty());
        if pending {
            staged.wanted.push(key);
        } else if staged.wanted.contains(key) && staged.wanted.parked() != Some(key) {
            staged.wanted.remove(key);
        }
    }
    Ok(())
}

fn read_v1<S: HostPipeService>(
    service: &mut S,
    staged: &mut Staged<S::Pipe>,
    r: &mut dyn Read,
) -> Result<()> {
    let mut engine = V1Engine::new();
    let result = read_v1_channels(service, &mut engine, staged, r);
    staged.engine = ProtocolEngine::V1(engine);
    result
}

fn read_v1_channels<S: HostPipeService>(
    service: &mut S,
    engine: &mut V1Engine<S::Pipe>,
    staged: &mut Staged<S::Pipe>,
    r: &mut dyn Read,
) -> Result<()> {
    engine.regs = V1Registers {
        address: r.read_u64_be()?,
        size: r.read_u32_be()?,
        status: r.read_i32_be()?,
        channel: r.read_u64_be()?,
        wakes: r.read_u32_be()?,
        params_addr: r.read_u64_be()?,
    };

    let count = r.read_u32_be()?;
    for _ in 0..count {
        let handle = r.read_u64_be()?;
        let key = ChannelKey::Handle(handle);
        let channel = read_channel(service, key, r, &mut staged.force_closed)?;
        if let Err(channel) = engine.insert_restored(handle, channel) {
            release(service, channel, CloseReason::LoadSnapshot);
            return Err(SnapshotError::Corrupt("duplicate channel handle"));
        }
    }

    let wanted_count = r.read_u32_be()?;
    for _ in 0..wanted_count {
        let handle = r.read_u64_be()?;
        if engine.channel(handle).is_none() {
            return Err(SnapshotError::Corrupt("wanted list names a missing channel"));
        }
        staged.wanted.push(ChannelKey::Handle(handle));
    }
    if r.read_bool()? {
        let handle = r.read_u64_be()?;
        if engine.channel(handle).is_none() {
            return Err(SnapshotError::Corrupt("wanted list names a missing channel"));
        }
        staged.wanted.park(ChannelKey::Handle(handle));
    }
    Ok(())
}

fn read_v2<S: HostPipeService>(
    service: &mut S,
    config: &PipeDeviceConfig,
    staged: &mut Staged<S::Pipe>,
    r: &mut dyn Read,
    mem: &dyn GuestMemory,
) -> Result<()> {
    let mut engine = V2Engine::new(
        config.initial_capacity as usize,
        config.max_capacity as usize,
    );
    let result = read_v2_channels(service, &mut engine, staged, r, mem);
    staged.engine = ProtocolEngine::V2(engine);
    result
}

fn read_v2_channels<S: HostPipeService>(
    service: &mut S,
    engine: &mut V2Engine<S::Pipe>,
    staged: &mut Staged<S::Pipe>,
    r: &mut dyn Read,
    mem: &dyn GuestMemory,
) -> Result<()> {
    let driver_version = r.read_u32_be()?;
    if driver_version > MAX_DRIVER_VERSION {
        return Err(SnapshotError::UnsupportedDriverVersion(driver_version));
    }
    let regs = V2Registers {
        signal_count: r.read_u32_be()?,
        signal_addr: r.read_u64_be()?,
        open_addr: r.read_u64_be()?,
    };
    let signal_len = SIGNALLED_ENTRY_SIZE as usize * regs.signal_count as usize;
    if regs.signal_addr != 0 && mem.resolve(regs.signal_addr, signal_len).is_none() {
        return Err(SnapshotError::UnmappedGuestBuffer {
            what: "signalled pipe buffer",
            paddr: regs.signal_addr,
        });
    }
    if regs.open_addr != 0 && mem.resolve(regs.open_addr, open_params::SIZE).is_none() {
        return Err(SnapshotError::UnmappedGuestBuffer {
            what: "open command buffer",
            paddr: regs.open_addr,
        });
    }
    engine.regs = regs;
    staged.driver_version = driver_version;

    let capacity = r.read_u32_be()?;
    if !engine.restore_capacity(capacity as usize) {
        return Err(SnapshotError::Corrupt("channel table capacity too large"));
    }

    let count = r.read_u32_be()?;
    for _ in 0..count {
        let id = r.read_u32_be()?;
        let command_buffer = CommandBuffer {
            paddr: r.read_u64_be()?,
            rw_params_max_count: r.read_u32_be()?,
        };
        if id >= capacity {
            return Err(SnapshotError::Corrupt("channel id beyond table capacity"));
        }
        if !(1..=cmdbuf::MAX_RW_PARAMS).contains(&command_buffer.rw_params_max_count) {
            return Err(SnapshotError::Corrupt("bad rw_params_max_count"));
        }
        if mem.resolve(command_buffer.paddr, cmdbuf::SIZE).is_none() {
            return Err(SnapshotError::UnmappedGuestBuffer {
                what: "command buffer",
                paddr: command_buffer.paddr,
            });
        }

        let channel = read_channel(service, ChannelKey::Id(id), r, &mut staged.force_closed)?
            .with_command_buffer(command_buffer);
        if let Err(channel) = engine.insert_restored(id, channel) {
            release(service, channel, CloseReason::LoadSnapshot);
            return Err(SnapshotError::Corrupt("duplicate channel id"));
        }
    }

    let wanted_count = r.read_u32_be()?;
    for _ in 0..wanted_count {
        let id = r.read_u32_be()?;
        if engine.channel(id).is_none() {
            return Err(SnapshotError::Corrupt("wanted list names a missing channel"));
        }
        staged.wanted.push(ChannelKey::Id(id));
    }
    Ok(())
}

impl<S: HostPipeService> SnapshotSource for PipeDevice<S> {
    fn save_pipe_device(&mut self, w: &mut dyn Write) -> Result<()> {
        self.save_state(w)
    }
}

/// Restores a [`PipeDevice`] from a snapshot file, validating guest buffers against `mem`.
pub struct PipeDeviceRestore<'a, S: HostPipeService> {
    pub device: &'a mut PipeDevice<S>,
    pub mem: &'a dyn GuestMemory,
}

impl<S: HostPipeService> SnapshotTarget for PipeDeviceRestore<'_, S> {
    fn restore_pipe_device(&mut self, r: &mut dyn Read) -> Result<()> {
        self.device.load_state(r, self.mem)
    }

    fn post_restore(&mut self) -> Result<()> {
        self.device.post_load();
        Ok(())
    }
}
