use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};

use goldfish_pipe::{
    ChannelKey, CloseReason, HostEvent, HostPipeService, LoadedPipe, PipeError, PipeResult,
    PollFlags, WakeFlags,
};
use pipe_snapshot::io::{ReadBeExt, WriteBeExt};
use pipe_snapshot::SnapshotError;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connector::{parse_target, ConnectError, Connector, Feed, CONNECTOR_BUFFER_SIZE};
use crate::debug::{PingPongService, ZeroService};
use crate::dma::DmaMap;
use crate::service::{PipeService, ServicePipe};
use crate::waker::{EventQueue, HostWaker};

const MAX_SAVED_NAME_LEN: usize = 4096;

const SAVED_CONNECTOR: u8 = 0;
const SAVED_SERVICE: u8 = 1;

#[derive(Debug, Error)]
enum LoadError {
    #[error(transparent)]
    Stream(#[from] SnapshotError),
    #[error("unknown saved pipe kind {0}")]
    UnknownKind(u8),
    #[error("saved connector holds {0} bytes")]
    ConnectorTooLong(usize),
    #[error("no pipe service named {0:?}")]
    UnknownService(String),
    #[error("pipe service {0:?} cannot restore pipes")]
    NotLoadable(String),
    #[error("pipe service {0:?} rejected the saved state")]
    Rejected(String),
}

/// Host end of one channel, handed to the pipe device.
pub struct HostPipe {
    waker: HostWaker,
    state: PipeState,
}

enum PipeState {
    Connecting(Connector),
    Connected(Connection),
}

struct Connection {
    service: String,
    args: Option<String>,
    pipe: Box<dyn ServicePipe>,
}

impl HostPipe {
    pub fn key(&self) -> ChannelKey {
        self.waker.key()
    }

    /// The service this channel connected to, or `None` while the name is still being written.
    pub fn service_name(&self) -> Option<&str> {
        match &self.state {
            PipeState::Connecting(_) => None,
            PipeState::Connected(conn) => Some(&conn.service),
        }
    }

    pub fn args(&self) -> Option<&str> {
        match &self.state {
            PipeState::Connecting(_) => None,
            PipeState::Connected(conn) => conn.args.as_deref(),
        }
    }
}

impl fmt::Debug for HostPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPipe")
            .field("key", &self.key())
            .field("service", &self.service_name())
            .finish_non_exhaustive()
    }
}

/// Host pipe service backed by named [`PipeService`]s.
///
/// Every channel starts as a connector. The first bytes the guest writes must be a
/// NUL-terminated `pipe:<name>[:<args>]` string, after which the channel is served by the
/// service registered under `<name>`.
pub struct ServiceRegistry {
    services: BTreeMap<String, Box<dyn PipeService>>,
    events: EventQueue,
    dma: DmaMap,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: BTreeMap::new(),
            events: EventQueue::default(),
            dma: DmaMap::new(),
        }
    }

    /// A registry with the `zero` and `pingpong` services.
    pub fn with_debug_services() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ZeroService));
        registry.register(Box::new(PingPongService));
        registry
    }

    /// Adds `service`, returning the one it replaces.
    pub fn register(&mut self, service: Box<dyn PipeService>) -> Option<Box<dyn PipeService>> {
        let name = service.name().to_owned();
        debug!(service = %name, "pipe service registered");
        self.services.insert(name, service)
    }

    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn PipeService>> {
        self.services.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn dma(&self) -> &DmaMap {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut DmaMap {
        &mut self.dma
    }

    /// Switches a connector whose name is complete over to its service.
    fn connect(&mut self, pipe: &mut HostPipe) -> Result<(), ConnectError> {
        let PipeState::Connecting(connector) = &pipe.state else {
            return Ok(());
        };
        let services = &mut self.services;
        let target = parse_target(connector.target()?, |name| services.contains_key(name))?;
        let Some(service) = services.get_mut(target.name) else {
            return Err(ConnectError::UnknownService(target.name.to_owned()));
        };
        let Some(created) = service.create(pipe.key(), target.args, pipe.waker.clone()) else {
            return Err(ConnectError::Refused(target.name.to_owned()));
        };
        debug!(channel = %pipe.key(), service = target.name, args = ?target.args, "pipe connected");
        let connection = Connection {
            service: target.name.to_owned(),
            args: target.args.map(str::to_owned),
            pipe: created,
        };
        pipe.state = PipeState::Connected(connection);
        Ok(())
    }

    fn save_pipe(&self, pipe: &HostPipe, out: &mut dyn Write) -> pipe_snapshot::Result<()> {
        match &pipe.state {
            PipeState::Connecting(connector) => {
                out.write_u8(SAVED_CONNECTOR)?;
                out.write_len_prefixed_bytes_u32(connector.buffered())
            }
            PipeState::Connected(conn) => {
                out.write_u8(SAVED_SERVICE)?;
                out.write_string_u32(&conn.service)?;
                match &conn.args {
                    Some(args) => {
                        out.write_bool(true)?;
                        out.write_string_u32(args)?;
                    }
                    None => out.write_bool(false)?,
                }
                conn.pipe.save(out)?;
                Ok(())
            }
        }
    }

    fn load_pipe(&mut self, input: &mut dyn Read, key: ChannelKey) -> Result<HostPipe, LoadError> {
        let waker = HostWaker::new(key, self.events.clone());
        let state = match input.read_u8()? {
            SAVED_CONNECTOR => {
                let len = input.read_u32_be()? as usize;
                if len > CONNECTOR_BUFFER_SIZE {
                    return Err(LoadError::ConnectorTooLong(len));
                }
                let buffered = input.read_exact_vec(len)?;
                let connector =
                    Connector::from_saved(buffered).ok_or(LoadError::ConnectorTooLong(len))?;
                PipeState::Connecting(connector)
            }
            SAVED_SERVICE => {
                let name = input.read_string_u32(MAX_SAVED_NAME_LEN)?;
                let args = if input.read_bool()? {
                    Some(input.read_string_u32(MAX_SAVED_NAME_LEN)?)
                } else {
                    None
                };
                let mut state = Vec::new();
                input.read_to_end(&mut state).map_err(SnapshotError::from)?;

                let Some(service) = self.services.get_mut(&name) else {
                    return Err(LoadError::UnknownService(name));
                };
                if !service.can_load() {
                    return Err(LoadError::NotLoadable(name));
                }
                let Some(pipe) = service.load(key, args.as_deref(), &state, waker.clone()) else {
                    return Err(LoadError::Rejected(name));
                };
                PipeState::Connected(Connection {
                    service: name,
                    args,
                    pipe,
                })
            }
            other => return Err(LoadError::UnknownKind(other)),
        };
        Ok(HostPipe { waker, state })
    }
}

fn into_io(err: SnapshotError) -> io::Error {
    match err {
        SnapshotError::Io(err) => err,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl HostPipeService for ServiceRegistry {
    type Pipe = HostPipe;

    fn open(&mut self, key: ChannelKey) -> Option<HostPipe> {
        Some(HostPipe {
            waker: HostWaker::new(key, self.events.clone()),
            state: PipeState::Connecting(Connector::new()),
        })
    }

    fn close(&mut self, mut pipe: HostPipe, reason: CloseReason) {
        if let PipeState::Connected(conn) = &mut pipe.state {
            conn.pipe.close(reason);
        }
        pipe.waker.abort_pending();
    }

    fn send(&mut self, pipe: &mut HostPipe, buffers: &[&[u8]]) -> PipeResult<usize> {
        let connector = match &mut pipe.state {
            PipeState::Connected(conn) => return conn.pipe.send(buffers),
            PipeState::Connecting(connector) => connector,
        };
        match connector.feed(buffers) {
            Feed::Pending(consumed) => Ok(consumed),
            Feed::Overflow => {
                warn!(channel = %pipe.key(), "pipe connection string too long");
                Err(PipeError::Io)
            }
            Feed::Complete(consumed) => match self.connect(pipe) {
                Ok(()) => Ok(consumed),
                Err(err) => {
                    warn!(channel = %pipe.key(), %err, "pipe connection failed");
                    Err(PipeError::Invalid)
                }
            },
        }
    }

    fn recv(&mut self, pipe: &mut HostPipe, buffers: &mut [&mut [u8]]) -> PipeResult<usize> {
        match &mut pipe.state {
            PipeState::Connected(conn) => conn.pipe.recv(buffers),
            PipeState::Connecting(_) => Err(PipeError::Io),
        }
    }

    fn poll(&mut self, pipe: &mut HostPipe) -> PollFlags {
        match &pipe.state {
            PipeState::Connected(conn) => conn.pipe.poll(),
            PipeState::Connecting(_) => PollFlags::OUT,
        }
    }

    fn wake_on(&mut self, pipe: &mut HostPipe, flags: WakeFlags) {
        if let PipeState::Connected(conn) = &mut pipe.state {
            conn.pipe.wake_on(flags);
        }
    }

    fn save(&mut self, pipe: &HostPipe, out: &mut dyn Write) -> io::Result<()> {
        self.save_pipe(pipe, out).map_err(into_io)
    }

    fn load(&mut self, input: &mut dyn Read, key: ChannelKey) -> LoadedPipe<HostPipe> {
        match self.load_pipe(input, key) {
            Ok(pipe) => LoadedPipe::restored(pipe),
            Err(err) => {
                warn!(channel = %key, %err, "host pipe not restored");
                LoadedPipe::force_closed()
            }
        }
    }

    fn pre_save(&mut self) {
        self.services.values_mut().for_each(|s| s.pre_save());
    }

    fn post_save(&mut self) {
        self.services.values_mut().for_each(|s| s.post_save());
    }

    fn pre_load(&mut self) {
        self.services.values_mut().for_each(|s| s.pre_load());
    }

    fn post_load(&mut self) {
        self.services.values_mut().for_each(|s| s.post_load());
    }

    fn dma_add_buffer(&mut self, key: ChannelKey, paddr: u64, size: u64) {
        self.dma.add(key, paddr, size);
    }

    fn dma_remove_buffer(&mut self, paddr: u64) {
        if self.dma.remove(paddr).is_none() {
            debug!(paddr, "removing unregistered dma buffer");
        }
    }

    fn dma_invalidate_host_mappings(&mut self) {
        self.dma.invalidate();
    }

    fn dma_reset_host_mappings(&mut self) {
        self.dma.reset();
    }

    fn dma_save_mappings(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.dma.save(out).map_err(into_io)
    }

    fn dma_load_mappings(&mut self, input: &mut dyn Read) -> io::Result<()> {
        self.dma.load(input).map_err(into_io)
    }

    fn take_host_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}
