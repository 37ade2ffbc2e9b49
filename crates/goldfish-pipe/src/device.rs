use std::time::{Duration, Instant};

use guest_memory::{GuestBufferMapper, GuestMemory};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::PipeDeviceConfig;
use crate::engine::{release, signal, Ctx, ProtocolEngine};
use crate::flags::WakeFlags;
use crate::irq::{InterruptPin, IrqLine};
use crate::regs::{MIN_V2_DRIVER_VERSION, REG_VERSION};
use crate::service::{ChannelKey, CloseReason, HostEvent, HostPipeService};
use crate::v1::V1Engine;
use crate::v2::V2Engine;
use crate::wanted::WantedList;

/// Register accesses and wake deliveries slower than this are reported when latency tracing is on.
const LONG_TRANSACTION: Duration = Duration::from_millis(1);

/// The goldfish pipe device.
///
/// Owns every channel and the wanted list, and routes 32-bit register accesses to the protocol
/// engine negotiated by the last `VERSION` probe. The interrupt line is high exactly while some
/// channel has events the guest has not collected yet.
///
/// Host-initiated events are applied through [`signal_wake`](Self::signal_wake) and
/// [`close_from_host`](Self::close_from_host), or pulled from the service with
/// [`poll_host_events`](Self::poll_host_events), which also runs after every register write.
pub struct PipeDevice<S: HostPipeService> {
    pub(crate) config: PipeDeviceConfig,
    pub(crate) service: S,
    pub(crate) engine: ProtocolEngine<S::Pipe>,
    pub(crate) wanted: WantedList,
    pub(crate) irq: InterruptPin,
    mapper: GuestBufferMapper,
    pub(crate) driver_version: u32,
    pending_wake: Option<Instant>,
}

impl<S: HostPipeService> PipeDevice<S> {
    pub fn new(config: PipeDeviceConfig, service: S, irq: Box<dyn IrqLine>) -> Self {
        let engine = ProtocolEngine::V2(V2Engine::new(
            config.initial_capacity as usize,
            config.max_capacity as usize,
        ));
        Self {
            mapper: GuestBufferMapper::new(config.ram_split.map(|split| split.0)),
            config,
            service,
            engine,
            wanted: WantedList::new(),
            irq: InterruptPin::new(irq),
            driver_version: 0,
            pending_wake: None,
        }
    }

    pub fn config(&self) -> &PipeDeviceConfig {
        &self.config
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    /// Protocol generation currently spoken: 1 (legacy) or 2.
    pub fn device_version(&self) -> u32 {
        self.engine.device_version()
    }

    pub fn driver_version(&self) -> u32 {
        self.driver_version
    }

    pub fn irq_level(&self) -> bool {
        self.irq.level()
    }

    pub fn channel(&self, key: ChannelKey) -> Option<&Channel<S::Pipe>> {
        self.engine.channel(key)
    }

    pub fn channel_count(&self) -> usize {
        self.engine.channel_count()
    }

    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        self.engine.keys()
    }

    /// Channels with undelivered events, in delivery order.
    pub fn wanted_keys(&self) -> Vec<ChannelKey> {
        self.wanted.iter().collect()
    }

    pub fn mmio_read(&mut self, offset: u64, size: usize, mem: &mut dyn GuestMemory) -> u64 {
        if size != 4 {
            debug!(offset, size, "unsupported pipe register read size");
            return 0;
        }
        let start = self.config.trace_latency.then(Instant::now);

        let value = if offset == REG_VERSION {
            self.probe()
        } else {
            let Self {
                service,
                engine,
                wanted,
                irq,
                mapper,
                ..
            } = self;
            match engine {
                ProtocolEngine::V1(engine) => engine.read(offset, wanted, irq),
                ProtocolEngine::V2(engine) => {
                    let mut ctx = Ctx {
                        service,
                        wanted,
                        irq,
                        mapper: *mapper,
                        mem,
                    };
                    engine.read(offset, &mut ctx)
                }
            }
        };

        if let Some(start) = start {
            self.report_latency("pipe_read", offset, start);
            if self.wanted.is_empty() {
                if let Some(woken) = self.pending_wake.take() {
                    self.report_latency("pipe_wake", offset, woken);
                }
            }
        }
        u64::from(value)
    }

    pub fn mmio_write(&mut self, offset: u64, size: usize, value: u64, mem: &mut dyn GuestMemory) {
        if size != 4 {
            debug!(offset, size, value, "unsupported pipe register write size");
            return;
        }
        let value = value as u32;
        let start = self.config.trace_latency.then(Instant::now);

        if offset == REG_VERSION {
            self.driver_version = value;
        } else {
            let Self {
                service,
                engine,
                wanted,
                irq,
                mapper,
                ..
            } = self;
            let mut ctx = Ctx {
                service,
                wanted,
                irq,
                mapper: *mapper,
                mem,
            };
            match engine {
                ProtocolEngine::V1(engine) => engine.write(offset, value, &mut ctx),
                ProtocolEngine::V2(engine) => engine.write(offset, value, &mut ctx),
            }
        }
        self.poll_host_events();

        if let Some(start) = start {
            self.report_latency("pipe_write", offset, start);
        }
    }

    /// Reports `flags` to the guest on behalf of the host end of `key`.
    pub fn signal_wake(&mut self, key: ChannelKey, flags: WakeFlags) -> bool {
        let Some(channel) = self.engine.channel_mut(key) else {
            debug!(channel = %key, ?flags, "wake for unknown channel");
            return false;
        };
        signal(channel, flags, &mut self.wanted, &mut self.irq);
        if self.config.trace_latency && self.pending_wake.is_none() {
            self.pending_wake = Some(Instant::now());
        }
        true
    }

    /// Marks `key` closed by the host. Further commands other than CLOSE fail with IO.
    pub fn close_from_host(&mut self, key: ChannelKey) -> bool {
        match self.engine.channel_mut(key) {
            Some(channel) if !channel.closed => channel.closed = true,
            Some(_) => return false,
            None => {
                debug!(channel = %key, "host close for unknown channel");
                return false;
            }
        }
        self.signal_wake(key, WakeFlags::CLOSED)
    }

    /// Applies every wake and close the service queued since the last call.
    pub fn poll_host_events(&mut self) {
        for event in self.service.take_host_events() {
            match event {
                HostEvent::Wake { key, flags } => {
                    self.signal_wake(key, flags);
                }
                HostEvent::Close { key } => {
                    self.close_from_host(key);
                }
            }
        }
    }

    /// Closes every channel with `reason` and forgets pending events.
    pub fn close_all(&mut self, reason: CloseReason) {
        for channel in self.engine.drain_channels() {
            release(&mut self.service, channel, reason);
        }
        self.wanted.clear();
        self.irq.lower();
        self.pending_wake = None;
    }

    /// Renegotiates the protocol from the last driver version written.
    fn probe(&mut self) -> u32 {
        self.close_all(CloseReason::Reboot);
        self.service.dma_reset_host_mappings();
        self.engine = self.engine_for(self.driver_version);
        debug!(
            driver_version = self.driver_version,
            device_version = self.engine.device_version(),
            "pipe device probed"
        );
        self.engine.device_version()
    }

    pub(crate) fn engine_for(&self, driver_version: u32) -> ProtocolEngine<S::Pipe> {
        if driver_version < MIN_V2_DRIVER_VERSION {
            ProtocolEngine::V1(V1Engine::new())
        } else {
            ProtocolEngine::V2(V2Engine::new(
                self.config.initial_capacity as usize,
                self.config.max_capacity as usize,
            ))
        }
    }

    fn report_latency(&self, what: &'static str, offset: u64, start: Instant) {
        let elapsed = start.elapsed();
        if elapsed > LONG_TRANSACTION {
            warn!(what, offset, elapsed_us = elapsed.as_micros() as u64, "high pipe latency");
        }
    }
}
