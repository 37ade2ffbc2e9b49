//! Services for exercising the transport from a guest without any real host backend.

use std::collections::VecDeque;
use std::io::{self, Write};

use goldfish_pipe::{ChannelKey, PipeError, PipeResult, PollFlags, WakeFlags};

use crate::service::{PipeService, ServicePipe};
use crate::waker::HostWaker;

/// `pipe:zero`: reads return zeroes, writes are discarded.
#[derive(Debug, Default)]
pub struct ZeroService;

impl PipeService for ZeroService {
    fn name(&self) -> &str {
        "zero"
    }

    fn create(
        &mut self,
        _key: ChannelKey,
        _args: Option<&str>,
        waker: HostWaker,
    ) -> Option<Box<dyn ServicePipe>> {
        Some(Box::new(ZeroPipe { waker }))
    }

    fn can_load(&self) -> bool {
        true
    }

    fn load(
        &mut self,
        _key: ChannelKey,
        _args: Option<&str>,
        _state: &[u8],
        waker: HostWaker,
    ) -> Option<Box<dyn ServicePipe>> {
        Some(Box::new(ZeroPipe { waker }))
    }
}

struct ZeroPipe {
    waker: HostWaker,
}

impl ServicePipe for ZeroPipe {
    fn send(&mut self, buffers: &[&[u8]]) -> PipeResult<usize> {
        Ok(buffers.iter().map(|b| b.len()).sum())
    }

    fn recv(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        let mut total = 0;
        for buf in buffers.iter_mut() {
            buf.fill(0);
            total += buf.len();
        }
        Ok(total)
    }

    fn poll(&self) -> PollFlags {
        PollFlags::IN | PollFlags::OUT
    }

    fn wake_on(&mut self, flags: WakeFlags) {
        self.waker.wake(flags & (WakeFlags::READ | WakeFlags::WRITE));
    }
}

/// Bytes a pingpong pipe holds before writes return AGAIN.
pub const PINGPONG_CAPACITY: usize = 16 * 1024;

/// `pipe:pingpong`: every byte written is read back in order.
#[derive(Debug, Default)]
pub struct PingPongService;

impl PipeService for PingPongService {
    fn name(&self) -> &str {
        "pingpong"
    }

    fn create(
        &mut self,
        _key: ChannelKey,
        _args: Option<&str>,
        waker: HostWaker,
    ) -> Option<Box<dyn ServicePipe>> {
        Some(Box::new(PingPongPipe::new(waker, VecDeque::new())))
    }

    fn can_load(&self) -> bool {
        true
    }

    fn load(
        &mut self,
        _key: ChannelKey,
        _args: Option<&str>,
        state: &[u8],
        waker: HostWaker,
    ) -> Option<Box<dyn ServicePipe>> {
        if state.len() > PINGPONG_CAPACITY {
            return None;
        }
        Some(Box::new(PingPongPipe::new(waker, state.iter().copied().collect())))
    }
}

struct PingPongPipe {
    waker: HostWaker,
    data: VecDeque<u8>,
    armed: WakeFlags,
}

impl PingPongPipe {
    fn new(waker: HostWaker, data: VecDeque<u8>) -> Self {
        Self {
            waker,
            data,
            armed: WakeFlags::empty(),
        }
    }

    fn ready(&self) -> WakeFlags {
        let mut ready = WakeFlags::empty();
        if !self.data.is_empty() {
            ready |= WakeFlags::READ;
        }
        if self.data.len() < PINGPONG_CAPACITY {
            ready |= WakeFlags::WRITE;
        }
        ready
    }

    fn fire(&mut self) {
        let fired = self.armed & self.ready();
        if !fired.is_empty() {
            self.armed.remove(fired);
            self.waker.wake(fired);
        }
    }
}

impl ServicePipe for PingPongPipe {
    fn send(&mut self, buffers: &[&[u8]]) -> PipeResult<usize> {
        let room = PINGPONG_CAPACITY - self.data.len();
        if room == 0 {
            return Err(PipeError::Again);
        }
        let mut taken = 0;
        for buf in buffers {
            let n = buf.len().min(room - taken);
            self.data.extend(&buf[..n]);
            taken += n;
            if taken == room {
                break;
            }
        }
        self.fire();
        Ok(taken)
    }

    fn recv(&mut self, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        if self.data.is_empty() {
            return Err(PipeError::Again);
        }
        let mut total = 0;
        for buf in buffers.iter_mut() {
            let n = buf.len().min(self.data.len());
            for (dst, src) in buf.iter_mut().zip(self.data.drain(..n)) {
                *dst = src;
            }
            total += n;
            if self.data.is_empty() {
                break;
            }
        }
        self.fire();
        Ok(total)
    }

    fn poll(&self) -> PollFlags {
        let ready = self.ready();
        let mut flags = PollFlags::empty();
        if ready.contains(WakeFlags::READ) {
            flags |= PollFlags::IN;
        }
        if ready.contains(WakeFlags::WRITE) {
            flags |= PollFlags::OUT;
        }
        flags
    }

    fn wake_on(&mut self, flags: WakeFlags) {
        self.armed |= flags & (WakeFlags::READ | WakeFlags::WRITE);
        self.fire();
    }

    fn save(&self, out: &mut dyn Write) -> io::Result<()> {
        let (head, tail) = self.data.as_slices();
        out.write_all(head)?;
        out.write_all(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waker::EventQueue;
    use goldfish_pipe::HostEvent;

    fn pingpong() -> (Box<dyn ServicePipe>, EventQueue) {
        let queue = EventQueue::default();
        let waker = HostWaker::new(ChannelKey::Id(0), queue.clone());
        let pipe = PingPongService.create(ChannelKey::Id(0), None, waker).unwrap();
        (pipe, queue)
    }

    #[test]
    fn pingpong_echoes_across_buffers() {
        let (mut pipe, _) = pingpong();
        assert_eq!(pipe.send(&[b"hel", b"lo"]), Ok(5));
        let mut a = [0u8; 2];
        let mut b = [0u8; 8];
        assert_eq!(pipe.recv(&mut [&mut a, &mut b]), Ok(5));
        assert_eq!(&a, b"he");
        assert_eq!(&b[..3], b"llo");
        assert_eq!(pipe.recv(&mut [&mut b]), Err(PipeError::Again));
    }

    #[test]
    fn pingpong_wakes_read_once_data_arrives() {
        let (mut pipe, queue) = pingpong();
        pipe.wake_on(WakeFlags::READ);
        assert!(queue.borrow().is_empty());
        pipe.send(&[b"x"]).unwrap();
        pipe.send(&[b"y"]).unwrap();
        assert_eq!(
            *queue.borrow(),
            vec![HostEvent::Wake {
                key: ChannelKey::Id(0),
                flags: WakeFlags::READ
            }]
        );
    }

    #[test]
    fn pingpong_applies_backpressure() {
        let (mut pipe, _) = pingpong();
        let big = vec![7u8; PINGPONG_CAPACITY + 10];
        assert_eq!(pipe.send(&[&big]), Ok(PINGPONG_CAPACITY));
        assert_eq!(pipe.poll(), PollFlags::IN);
        assert_eq!(pipe.send(&[b"z"]), Err(PipeError::Again));
    }

    #[test]
    fn zero_fills_and_swallows() {
        let queue = EventQueue::default();
        let mut pipe = ZeroService
            .create(ChannelKey::Id(4), None, HostWaker::new(ChannelKey::Id(4), queue.clone()))
            .unwrap();
        let mut buf = [0xffu8; 4];
        assert_eq!(pipe.recv(&mut [&mut buf]), Ok(4));
        assert_eq!(buf, [0; 4]);
        assert_eq!(pipe.send(&[b"ab", b"c"]), Ok(3));
        pipe.wake_on(WakeFlags::READ | WakeFlags::CLOSED);
        assert_eq!(
            *queue.borrow(),
            vec![HostEvent::Wake {
                key: ChannelKey::Id(4),
                flags: WakeFlags::READ
            }]
        );
    }
}
