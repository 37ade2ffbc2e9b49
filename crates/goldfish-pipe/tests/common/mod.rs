//! Shared helpers for `goldfish-pipe` integration tests: a scripted host service, a recording IRQ
//! line and small guest drivers for both protocols.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;

use goldfish_pipe::regs::{cmdbuf, open_params, v1, v2, PipeCmd, REG_CMD, REG_VERSION};
use goldfish_pipe::{
    ChannelKey, CloseReason, HostEvent, HostPipeService, IrqLine, LoadedPipe, PipeDevice,
    PipeDeviceConfig, PipeError, PipeResult, PollFlags, WakeFlags,
};
use guest_memory::{DenseMemory, GuestMemory};

#[derive(Clone, Default)]
pub struct TestIrq {
    level: Rc<Cell<bool>>,
    events: Rc<RefCell<Vec<bool>>>,
}

impl TestIrq {
    pub fn level(&self) -> bool {
        self.level.get()
    }

    pub fn events(&self) -> Vec<bool> {
        self.events.borrow().clone()
    }
}

impl IrqLine for TestIrq {
    fn set_level(&self, level: bool) {
        self.level.set(level);
        self.events.borrow_mut().push(level);
    }
}

/// Host-side state of one fake pipe, shared with the test.
#[derive(Debug, Default)]
pub struct PipeState {
    /// Bytes the guest wrote.
    pub received: Vec<u8>,
    /// Bytes waiting for the guest to read.
    pub pending: VecDeque<u8>,
    pub armed: WakeFlags,
    /// Error returned by the next send instead of consuming data.
    pub fail_send: Option<PipeError>,
    pub fail_save: bool,
}

pub type SharedPipe = Rc<RefCell<PipeState>>;

#[derive(Debug)]
pub struct FakePipe {
    pub key: ChannelKey,
    pub state: SharedPipe,
}

/// A host service whose pipes echo nothing on their own: tests feed data and events by hand.
#[derive(Default)]
pub struct FakeService {
    pub refuse_open: bool,
    pub pipes: HashMap<ChannelKey, SharedPipe>,
    pub closed: Vec<(ChannelKey, CloseReason)>,
    pub wake_on_calls: Vec<(ChannelKey, WakeFlags)>,
    pub events: Vec<HostEvent>,
    pub dma: BTreeMap<u64, u64>,
    pub hooks: Vec<&'static str>,
    pub fail_load: HashSet<ChannelKey>,
}

impl FakeService {
    pub fn pipe(&self, key: ChannelKey) -> SharedPipe {
        self.pipes[&key].clone()
    }

    /// Queues bytes for the guest and reports READ if the guest asked for it.
    pub fn feed(&mut self, key: ChannelKey, data: &[u8]) {
        let state = self.pipe(key);
        let mut state = state.borrow_mut();
        state.pending.extend(data);
        if state.armed.contains(WakeFlags::READ) {
            state.armed.remove(WakeFlags::READ);
            self.events.push(HostEvent::Wake {
                key,
                flags: WakeFlags::READ,
            });
        }
    }

    fn share(&mut self, key: ChannelKey, state: PipeState) -> FakePipe {
        let state = Rc::new(RefCell::new(state));
        self.pipes.insert(key, state.clone());
        FakePipe { key, state }
    }
}

impl HostPipeService for FakeService {
    type Pipe = FakePipe;

    fn open(&mut self, key: ChannelKey) -> Option<FakePipe> {
        if self.refuse_open {
            return None;
        }
        Some(self.share(key, PipeState::default()))
    }

    fn close(&mut self, pipe: FakePipe, reason: CloseReason) {
        self.closed.push((pipe.key, reason));
        self.pipes.remove(&pipe.key);
    }

    fn send(&mut self, pipe: &mut FakePipe, buffers: &[&[u8]]) -> PipeResult<usize> {
        let mut state = pipe.state.borrow_mut();
        if let Some(err) = state.fail_send.take() {
            return Err(err);
        }
        let mut total = 0;
        for buf in buffers {
            state.received.extend_from_slice(buf);
            total += buf.len();
        }
        Ok(total)
    }

    fn recv(&mut self, pipe: &mut FakePipe, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        let mut state = pipe.state.borrow_mut();
        if state.pending.is_empty() {
            return Err(PipeError::Again);
        }
        let mut total = 0;
        for buf in buffers.iter_mut() {
            for byte in buf.iter_mut() {
                let Some(b) = state.pending.pop_front() else {
                    return Ok(total);
                };
                *byte = b;
                total += 1;
            }
        }
        Ok(total)
    }

    fn poll(&mut self, pipe: &mut FakePipe) -> PollFlags {
        if pipe.state.borrow().pending.is_empty() {
            PollFlags::OUT
        } else {
            PollFlags::IN | PollFlags::OUT
        }
    }

    fn wake_on(&mut self, pipe: &mut FakePipe, flags: WakeFlags) {
        self.wake_on_calls.push((pipe.key, flags));
        let mut state = pipe.state.borrow_mut();
        state.armed = flags;
        let mut ready = WakeFlags::WRITE;
        if !state.pending.is_empty() {
            ready |= WakeFlags::READ;
        }
        let fired = flags & ready;
        if !fired.is_empty() {
            state.armed.remove(fired);
            self.events.push(HostEvent::Wake {
                key: pipe.key,
                flags: fired,
            });
        }
    }

    fn save(&mut self, pipe: &FakePipe, out: &mut dyn Write) -> io::Result<()> {
        let state = pipe.state.borrow();
        if state.fail_save {
            return Err(io::Error::new(io::ErrorKind::Other, "unsaveable pipe"));
        }
        let pending: Vec<u8> = state.pending.iter().copied().collect();
        out.write_all(&(state.received.len() as u32).to_le_bytes())?;
        out.write_all(&state.received)?;
        out.write_all(&pending)
    }

    fn load(&mut self, input: &mut dyn Read, key: ChannelKey) -> LoadedPipe<FakePipe> {
        if self.fail_load.contains(&key) {
            return LoadedPipe::force_closed();
        }
        let mut bytes = Vec::new();
        if input.read_to_end(&mut bytes).is_err() || bytes.len() < 4 {
            return LoadedPipe::force_closed();
        }
        let received_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + received_len {
            return LoadedPipe::force_closed();
        }
        let state = PipeState {
            received: bytes[4..4 + received_len].to_vec(),
            pending: bytes[4 + received_len..].iter().copied().collect(),
            ..PipeState::default()
        };
        LoadedPipe::restored(self.share(key, state))
    }

    fn pre_save(&mut self) {
        self.hooks.push("pre_save");
    }

    fn post_save(&mut self) {
        self.hooks.push("post_save");
    }

    fn pre_load(&mut self) {
        self.hooks.push("pre_load");
    }

    fn post_load(&mut self) {
        self.hooks.push("post_load");
    }

    fn dma_add_buffer(&mut self, _key: ChannelKey, paddr: u64, size: u64) {
        self.dma.insert(paddr, size);
    }

    fn dma_remove_buffer(&mut self, paddr: u64) {
        self.dma.remove(&paddr);
    }

    fn dma_invalidate_host_mappings(&mut self) {
        self.hooks.push("dma_invalidate");
    }

    fn dma_reset_host_mappings(&mut self) {
        self.hooks.push("dma_reset");
        self.dma.clear();
    }

    fn dma_save_mappings(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.hooks.push("dma_save");
        out.write_all(&(self.dma.len() as u32).to_be_bytes())?;
        for (paddr, size) in &self.dma {
            out.write_all(&paddr.to_be_bytes())?;
            out.write_all(&size.to_be_bytes())?;
        }
        Ok(())
    }

    fn dma_load_mappings(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.hooks.push("dma_load");
        let mut count = [0u8; 4];
        input.read_exact(&mut count)?;
        self.dma.clear();
        for _ in 0..u32::from_be_bytes(count) {
            let mut entry = [0u8; 16];
            input.read_exact(&mut entry)?;
            let paddr = u64::from_be_bytes(entry[..8].try_into().unwrap());
            let size = u64::from_be_bytes(entry[8..].try_into().unwrap());
            self.dma.insert(paddr, size);
        }
        Ok(())
    }

    fn take_host_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.events)
    }
}

pub const RAM_SIZE: u64 = 0x10_0000;
pub const OPEN_BUFFER: u64 = 0x1000;
pub const SIGNAL_BUFFER: u64 = 0x2000;
pub const SIGNAL_COUNT: u32 = 16;
/// Guest data buffers live from here on.
pub const DATA: u64 = 0x8_0000;

pub fn command_buffer(id: u32) -> u64 {
    0x1_0000 + u64::from(id) * cmdbuf::SIZE as u64
}

/// A device plus guest RAM, driven the way a guest kernel driver would.
pub struct Guest {
    pub dev: PipeDevice<FakeService>,
    pub mem: DenseMemory,
    pub irq: TestIrq,
}

impl Guest {
    pub fn new(config: PipeDeviceConfig) -> Self {
        let irq = TestIrq::default();
        Self {
            dev: PipeDevice::new(config, FakeService::default(), Box::new(irq.clone())),
            mem: DenseMemory::new(RAM_SIZE).unwrap(),
            irq,
        }
    }

    /// A driver speaking the command-buffer protocol, with its signal and open buffers set up.
    pub fn v2() -> Self {
        Self::v2_with(PipeDeviceConfig::default())
    }

    pub fn v2_with(config: PipeDeviceConfig) -> Self {
        let mut guest = Self::new(config);
        guest.write(REG_VERSION, 4);
        assert_eq!(guest.read(REG_VERSION), 2);
        guest.write(v2::REG_SIGNAL_BUFFER_HIGH, (SIGNAL_BUFFER >> 32) as u32);
        guest.write(v2::REG_SIGNAL_BUFFER, SIGNAL_BUFFER as u32);
        guest.write(v2::REG_SIGNAL_BUFFER_COUNT, SIGNAL_COUNT);
        guest.write(v2::REG_OPEN_BUFFER_HIGH, (OPEN_BUFFER >> 32) as u32);
        guest.write(v2::REG_OPEN_BUFFER, OPEN_BUFFER as u32);
        guest
    }

    /// A driver that predates version reporting.
    pub fn v1() -> Self {
        let mut guest = Self::new(PipeDeviceConfig::default());
        assert_eq!(guest.read(REG_VERSION), 1);
        guest
    }

    pub fn read(&mut self, offset: u64) -> u32 {
        self.dev.mmio_read(offset, 4, &mut self.mem) as u32
    }

    pub fn write(&mut self, offset: u64, value: u32) {
        self.dev.mmio_write(offset, 4, u64::from(value), &mut self.mem);
    }

    pub fn service(&mut self) -> &mut FakeService {
        self.dev.service_mut()
    }

    // Command-buffer protocol.

    pub fn open(&mut self, id: u32, max: u32) -> i32 {
        let buf = command_buffer(id);
        self.mem.write_u64_le(OPEN_BUFFER + open_params::COMMAND_BUFFER_PTR, buf).unwrap();
        self.mem.write_u32_le(OPEN_BUFFER + open_params::RW_PARAMS_MAX_COUNT, max).unwrap();
        self.mem.write_u32_le(buf + cmdbuf::ID, id).unwrap();
        self.command(id, PipeCmd::Open)
    }

    /// Issues `cmd` through channel `id`'s command buffer and returns the status.
    pub fn command(&mut self, id: u32, cmd: PipeCmd) -> i32 {
        let buf = command_buffer(id);
        self.mem.write_u32_le(buf + cmdbuf::CMD, cmd as u32).unwrap();
        self.mem.write_u32_le(buf + cmdbuf::STATUS, 0xdead_beef).unwrap();
        self.write(REG_CMD, id);
        self.status(id)
    }

    pub fn status(&self, id: u32) -> i32 {
        self.mem.read_u32_le(command_buffer(id) + cmdbuf::STATUS).unwrap() as i32
    }

    pub fn consumed(&self, id: u32) -> u32 {
        self.mem.read_u32_le(command_buffer(id) + cmdbuf::RW_CONSUMED_SIZE).unwrap()
    }

    /// Fills in the transfer descriptors of channel `id`, negotiated with `max` descriptors.
    pub fn set_buffers(&mut self, id: u32, max: u32, buffers: &[(u64, u32)], read_index: u32) {
        let buf = command_buffer(id);
        self.mem
            .write_u32_le(buf + cmdbuf::RW_BUFFERS_COUNT, buffers.len() as u32)
            .unwrap();
        for (i, &(ptr, len)) in buffers.iter().enumerate() {
            let i = i as u64;
            self.mem.write_u64_le(buf + cmdbuf::RW_PTRS + 8 * i, ptr).unwrap();
            self.mem.write_u32_le(buf + cmdbuf::rw_sizes(max) + 4 * i, len).unwrap();
        }
        self.mem
            .write_u32_le(buf + cmdbuf::rw_read_index(max), read_index)
            .unwrap();
    }

    /// Reads GET_SIGNALLED and returns the reported `(id, flags)` entries.
    pub fn get_signalled(&mut self) -> Vec<(u32, u32)> {
        let count = self.read(v2::REG_GET_SIGNALLED) as u64;
        (0..count)
            .map(|i| {
                let entry = SIGNAL_BUFFER + 8 * i;
                (
                    self.mem.read_u32_le(entry).unwrap(),
                    self.mem.read_u32_le(entry + 4).unwrap(),
                )
            })
            .collect()
    }

    // Legacy protocol.

    pub fn set_channel(&mut self, handle: u64) {
        self.write(v1::REG_CHANNEL, handle as u32);
        self.write(v1::REG_CHANNEL_HIGH, (handle >> 32) as u32);
    }

    pub fn v1_command(&mut self, handle: u64, cmd: PipeCmd) -> i32 {
        self.set_channel(handle);
        self.write(REG_CMD, cmd as u32);
        self.read(v1::REG_STATUS) as i32
    }

    pub fn v1_transfer(&mut self, handle: u64, cmd: PipeCmd, address: u64, size: u32) -> i32 {
        self.write(v1::REG_ADDRESS, address as u32);
        self.write(v1::REG_ADDRESS_HIGH, (address >> 32) as u32);
        self.write(v1::REG_SIZE, size);
        self.v1_command(handle, cmd)
    }
}
