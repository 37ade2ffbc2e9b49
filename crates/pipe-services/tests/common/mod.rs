//! A guest driver for the command-buffer protocol over a registry-backed device.
#![allow(dead_code)]

use goldfish_pipe::regs::{cmdbuf, open_params, v2, PipeCmd, REG_CMD, REG_VERSION};
use goldfish_pipe::{NoIrq, PipeDevice, PipeDeviceConfig};
use guest_memory::{DenseMemory, GuestMemory};
use pipe_services::ServiceRegistry;

pub const RAM_SIZE: u64 = 0x10_0000;
pub const OPEN_BUFFER: u64 = 0x1000;
pub const SIGNAL_BUFFER: u64 = 0x2000;
pub const SIGNAL_COUNT: u32 = 16;
pub const MAX_BUFFERS: u32 = 4;
/// Scratch space for transfer data, one page per channel.
pub const DATA: u64 = 0x8_0000;

pub fn command_buffer(id: u32) -> u64 {
    0x1_0000 + u64::from(id) * cmdbuf::SIZE as u64
}

pub fn data(id: u32) -> u64 {
    DATA + u64::from(id) * 0x1000
}

pub struct Guest {
    pub dev: PipeDevice<ServiceRegistry>,
    pub mem: DenseMemory,
}

impl Guest {
    pub fn new(registry: ServiceRegistry) -> Self {
        let mut guest = Self {
            dev: PipeDevice::new(PipeDeviceConfig::default(), registry, Box::new(NoIrq)),
            mem: DenseMemory::new(RAM_SIZE).unwrap(),
        };
        guest.write(REG_VERSION, 4);
        assert_eq!(guest.read(REG_VERSION), 2);
        guest.write(v2::REG_SIGNAL_BUFFER_HIGH, 0);
        guest.write(v2::REG_SIGNAL_BUFFER, SIGNAL_BUFFER as u32);
        guest.write(v2::REG_SIGNAL_BUFFER_COUNT, SIGNAL_COUNT);
        guest.write(v2::REG_OPEN_BUFFER_HIGH, 0);
        guest.write(v2::REG_OPEN_BUFFER, OPEN_BUFFER as u32);
        guest
    }

    pub fn read(&mut self, offset: u64) -> u32 {
        self.dev.mmio_read(offset, 4, &mut self.mem) as u32
    }

    pub fn write(&mut self, offset: u64, value: u32) {
        self.dev.mmio_write(offset, 4, u64::from(value), &mut self.mem);
    }

    pub fn open(&mut self, id: u32) -> i32 {
        let buf = command_buffer(id);
        self.mem
            .write_u64_le(OPEN_BUFFER + open_params::COMMAND_BUFFER_PTR, buf)
            .unwrap();
        self.mem
            .write_u32_le(OPEN_BUFFER + open_params::RW_PARAMS_MAX_COUNT, MAX_BUFFERS)
            .unwrap();
        self.mem.write_u32_le(buf + cmdbuf::ID, id).unwrap();
        self.command(id, PipeCmd::Open)
    }

    pub fn command(&mut self, id: u32, cmd: PipeCmd) -> i32 {
        let buf = command_buffer(id);
        self.mem.write_u32_le(buf + cmdbuf::CMD, cmd as u32).unwrap();
        self.write(REG_CMD, id);
        self.mem.read_u32_le(buf + cmdbuf::STATUS).unwrap() as i32
    }

    fn set_buffer(&mut self, id: u32, len: usize, read_index: u32) {
        let buf = command_buffer(id);
        self.mem.write_u32_le(buf + cmdbuf::RW_BUFFERS_COUNT, 1).unwrap();
        self.mem.write_u64_le(buf + cmdbuf::RW_PTRS, data(id)).unwrap();
        self.mem
            .write_u32_le(buf + cmdbuf::rw_sizes(MAX_BUFFERS), len as u32)
            .unwrap();
        self.mem
            .write_u32_le(buf + cmdbuf::rw_read_index(MAX_BUFFERS), read_index)
            .unwrap();
    }

    /// Writes `bytes` on channel `id`. Returns the status and the bytes consumed.
    pub fn send(&mut self, id: u32, bytes: &[u8]) -> (i32, u32) {
        self.mem.write_from(data(id), bytes).unwrap();
        self.set_buffer(id, bytes.len(), 1);
        let status = self.command(id, PipeCmd::Write);
        (status, self.consumed(id))
    }

    /// Reads up to `max` bytes from channel `id`, or returns the error status.
    pub fn recv(&mut self, id: u32, max: usize) -> Result<Vec<u8>, i32> {
        self.set_buffer(id, max, 0);
        let status = self.command(id, PipeCmd::Read);
        if status < 0 {
            return Err(status);
        }
        let mut out = vec![0u8; self.consumed(id) as usize];
        self.mem.read_into(data(id), &mut out).unwrap();
        Ok(out)
    }

    /// Opens channel `id` and connects it to `target`.
    pub fn connect(&mut self, id: u32, target: &str) -> i32 {
        assert_eq!(self.open(id), 0);
        let mut name = target.as_bytes().to_vec();
        name.push(0);
        self.send(id, &name).0
    }

    pub fn consumed(&self, id: u32) -> u32 {
        self.mem
            .read_u32_le(command_buffer(id) + cmdbuf::RW_CONSUMED_SIZE)
            .unwrap()
    }

    pub fn get_signalled(&mut self) -> Vec<(u32, u32)> {
        let count = u64::from(self.read(v2::REG_GET_SIGNALLED));
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
}
