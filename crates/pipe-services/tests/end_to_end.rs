mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{command_buffer, Guest};
use goldfish_pipe::regs::{cmdbuf, PipeCmd};
use goldfish_pipe::{
    ChannelKey, CloseReason, PipeResult, PollFlags, WakeFlags, PIPE_ERROR_AGAIN,
    PIPE_ERROR_INVAL, PIPE_ERROR_IO,
};
use guest_memory::GuestMemory;
use pipe_services::{HostWaker, PipeService, ServicePipe, ServiceRegistry};
use pretty_assertions::assert_eq;

/// Records what each created pipe was asked to do.
#[derive(Default, Clone)]
struct Journal(Rc<RefCell<Vec<String>>>);

impl Journal {
    fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

struct Recording {
    name: &'static str,
    journal: Journal,
    refuse: bool,
}

impl PipeService for Recording {
    fn name(&self) -> &str {
        self.name
    }

    fn create(
        &mut self,
        key: ChannelKey,
        args: Option<&str>,
        waker: HostWaker,
    ) -> Option<Box<dyn ServicePipe>> {
        self.journal
            .0
            .borrow_mut()
            .push(format!("create {} {key} {args:?}", self.name));
        if self.refuse {
            return None;
        }
        Some(Box::new(RecordingPipe {
            journal: self.journal.clone(),
            waker,
        }))
    }
}

struct RecordingPipe {
    journal: Journal,
    waker: HostWaker,
}

impl ServicePipe for RecordingPipe {
    fn close(&mut self, reason: CloseReason) {
        self.journal.0.borrow_mut().push(format!("close {reason:?}"));
    }

    fn send(&mut self, buffers: &[&[u8]]) -> PipeResult<usize> {
        let total = buffers.iter().map(|b| b.len()).sum();
        if total > 0 && buffers[0][0] == b'!' {
            self.waker.close();
        }
        Ok(total)
    }

    fn recv(&mut self, _buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        Ok(0)
    }

    fn poll(&self) -> PollFlags {
        PollFlags::OUT
    }

    fn wake_on(&mut self, _flags: WakeFlags) {}
}

fn recording(name: &'static str, refuse: bool) -> (ServiceRegistry, Journal) {
    let journal = Journal::default();
    let mut registry = ServiceRegistry::with_debug_services();
    registry.register(Box::new(Recording {
        name,
        journal: journal.clone(),
        refuse,
    }));
    (registry, journal)
}

#[test]
fn pingpong_echoes_after_connecting() {
    let mut g = Guest::new(ServiceRegistry::with_debug_services());
    assert_eq!(g.open(0), 0);
    let (status, consumed) = g.send(0, b"pipe:pingpong\0trailing");
    assert_eq!(status, 0);
    assert_eq!(consumed, 14);

    assert_eq!(g.send(0, b"hello"), (0, 5));
    assert_eq!(g.recv(0, 64), Ok(b"hello".to_vec()));
    assert_eq!(g.recv(0, 64), Err(PIPE_ERROR_AGAIN));
    assert_eq!(
        g.dev
            .channel(ChannelKey::Id(0))
            .and_then(|ch| ch.host_pipe())
            .and_then(|p| p.service_name()),
        Some("pingpong")
    );
}

#[test]
fn connection_string_may_arrive_in_pieces() {
    let mut g = Guest::new(ServiceRegistry::with_debug_services());
    assert_eq!(g.open(1), 0);
    assert_eq!(g.send(1, b"pipe:ze"), (0, 7));
    assert_eq!(g.command(1, PipeCmd::Poll), PollFlags::OUT.bits() as i32);
    assert_eq!(g.recv(1, 4), Err(PIPE_ERROR_IO));
    assert_eq!(g.send(1, b"ro\0"), (0, 3));
    assert_eq!(g.recv(1, 4), Ok(vec![0; 4]));
    assert_eq!(
        g.command(1, PipeCmd::Poll),
        (PollFlags::IN | PollFlags::OUT).bits() as i32
    );
}

#[test]
fn bad_connection_strings() {
    let mut g = Guest::new(ServiceRegistry::with_debug_services());
    assert_eq!(g.connect(0, "pipe:nope"), PIPE_ERROR_INVAL);
    assert_eq!(g.connect(1, "tcp:5555"), PIPE_ERROR_INVAL);

    assert_eq!(g.open(2), 0);
    assert_eq!(g.send(2, &[b'x'; 100]).0, 0);
    assert_eq!(g.send(2, &[b'x'; 28]).0, PIPE_ERROR_IO);
}

#[test]
fn refused_connection_is_invalid() {
    let (registry, journal) = recording("fussy", true);
    let mut g = Guest::new(registry);
    assert_eq!(g.connect(3, "pipe:fussy:a"), PIPE_ERROR_INVAL);
    assert_eq!(journal.entries(), vec![r#"create fussy id 3 Some("a")"#]);
}

#[test]
fn qemud_names_fall_back_to_the_generic_service() {
    let (mut registry, journal) = recording("qemud", false);
    registry.register(Box::new(Recording {
        name: "qemud:adb",
        journal: journal.clone(),
        refuse: false,
    }));
    let mut g = Guest::new(registry);
    assert_eq!(g.connect(0, "pipe:qemud:sensors:list"), 0);
    assert_eq!(g.connect(1, "pipe:qemud:adb:5555"), 0);
    assert_eq!(
        journal.entries(),
        vec![
            r#"create qemud id 0 Some("sensors:list")"#.to_owned(),
            r#"create qemud:adb id 1 Some("5555")"#.to_owned(),
        ]
    );
}

#[test]
fn guest_close_reaches_the_service_pipe() {
    let (registry, journal) = recording("rec", false);
    let mut g = Guest::new(registry);
    assert_eq!(g.connect(5, "pipe:rec"), 0);
    assert_eq!(g.command(5, PipeCmd::Close), 0);
    assert_eq!(journal.entries()[1], "close Graceful");
}

#[test]
fn host_close_is_reported_to_the_guest() {
    let (registry, _) = recording("rec", false);
    let mut g = Guest::new(registry);
    assert_eq!(g.connect(2, "pipe:rec"), 0);
    assert_eq!(g.send(2, b"!bye"), (0, 4));
    assert_eq!(
        g.get_signalled(),
        vec![(2, WakeFlags::CLOSED.bits() as u32)]
    );
    assert_eq!(g.send(2, b"more").0, PIPE_ERROR_IO);
}

#[test]
fn pingpong_read_wake_is_delivered_once_data_is_echoed() {
    let mut g = Guest::new(ServiceRegistry::with_debug_services());
    assert_eq!(g.connect(0, "pipe:pingpong"), 0);
    assert_eq!(g.command(0, PipeCmd::WakeOnRead), 0);
    assert_eq!(g.get_signalled(), vec![]);

    g.send(0, b"ping");
    assert_eq!(g.get_signalled(), vec![(0, WakeFlags::READ.bits() as u32)]);
    assert_eq!(g.recv(0, 8), Ok(b"ping".to_vec()));
}

#[test]
fn dma_registrations_survive_a_snapshot() {
    let mut g = Guest::new(ServiceRegistry::with_debug_services());
    assert_eq!(g.connect(0, "pipe:zero"), 0);
    let buf = command_buffer(0);
    g.mem.write_u64_le(buf + cmdbuf::DMA_PADDR, 0x4_0000).unwrap();
    g.mem.write_u64_le(buf + cmdbuf::DMA_SIZE, 0x2000).unwrap();
    assert_eq!(g.command(0, PipeCmd::DmaMapHost), 0);
    assert_eq!(g.dev.service().dma().len(), 1);

    let mut blob = Vec::new();
    g.dev.save_state(&mut blob).unwrap();

    let mut restored = Guest::new(ServiceRegistry::with_debug_services());
    restored.dev.load_state(&mut blob.as_slice(), &g.mem).unwrap();
    let dma = restored.dev.service_mut().dma_mut();
    let entry = *dma.get(0x4_0000).unwrap();
    assert_eq!(entry.size, 0x2000);
    assert!(!entry.has_host_mapping());
    assert!(dma.resolve(&g.mem, 0x4_0000).is_some());
}

#[test]
fn snapshot_restores_connected_and_connecting_pipes() {
    let mut g = Guest::new(ServiceRegistry::with_debug_services());
    assert_eq!(g.connect(0, "pipe:pingpong"), 0);
    assert_eq!(g.send(0, b"kept"), (0, 4));
    assert_eq!(g.open(1), 0);
    assert_eq!(g.send(1, b"pipe:ping"), (0, 9));

    let mut blob = Vec::new();
    g.dev.save_state(&mut blob).unwrap();

    let mut r = Guest::new(ServiceRegistry::with_debug_services());
    r.mem.write_from(0, g.mem.as_slice()).unwrap();
    r.dev.load_state(&mut blob.as_slice(), &r.mem).unwrap();
    r.dev.post_load();

    assert_eq!(r.recv(0, 16), Ok(b"kept".to_vec()));
    assert_eq!(r.send(1, b"pong\0"), (0, 5));
    assert_eq!(r.send(1, b"again"), (0, 5));
    assert_eq!(r.recv(1, 16), Ok(b"again".to_vec()));
}

#[test]
fn pipes_of_missing_services_come_back_closed() {
    let (registry, _) = recording("rec", false);
    let mut g = Guest::new(registry);
    assert_eq!(g.connect(0, "pipe:rec"), 0);
    assert_eq!(g.connect(1, "pipe:pingpong"), 0);

    let mut blob = Vec::new();
    g.dev.save_state(&mut blob).unwrap();

    // `rec` cannot restore pipes, and the new registry does not know it anyway.
    let mut r = Guest::new(ServiceRegistry::with_debug_services());
    r.mem.write_from(0, g.mem.as_slice()).unwrap();
    r.dev.load_state(&mut blob.as_slice(), &r.mem).unwrap();
    r.dev.post_load();

    assert!(r.dev.channel(ChannelKey::Id(0)).unwrap().is_closed());
    assert_eq!(r.get_signalled(), vec![(0, WakeFlags::CLOSED.bits() as u32)]);
    assert_eq!(r.send(0, b"x").0, PIPE_ERROR_IO);
    assert_eq!(r.command(0, PipeCmd::Close), 0);
    assert_eq!(r.send(1, b"ok"), (0, 2));
}
