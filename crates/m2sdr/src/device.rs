//! Device handles and transports.
//!
//! A [`Device`] owns everything per-channel — counter state, buffer pools,
//! the lock table — in one arena; stream handles carry opaque indices into
//! it and release their resources on drop. The transport is a tagged
//! variant: the capability set (register access, buffer progress, poll) is
//! dispatched by matching, nothing more dynamic.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use m2sdr_dma::irq::ChannelDirections;
use m2sdr_dma::mock::MockSdr;
use m2sdr_dma::{
    registry, BufferPool, ChannelLockArbiter, DirectionState, InterruptDemux, RegisterPort,
};
use m2sdr_proto::{csr, Direction, DMA_BUFFER_COUNT, DMA_BUFFER_SIZE};
use m2sdr_udp::{EtherbonePort, UdpStreamer};

#[cfg(unix)]
use crate::chardev::CharDevice;
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::ident::DeviceId;
use crate::stream::StreamHandle;

/// The sample stream listens one port above the Etherbone control port.
const STREAM_PORT_OFFSET: u16 = 1;

/// Geometry for a simulated device.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub num_channels: usize,
    pub buf_count: usize,
    pub buf_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_channels: 1,
            buf_count: DMA_BUFFER_COUNT,
            buf_size: DMA_BUFFER_SIZE,
        }
    }
}

/// Per-channel buffer pools for transports that run the engine host-side.
pub(crate) struct DirPools {
    pub rx: Arc<BufferPool>,
    pub tx: Arc<BufferPool>,
}

pub(crate) struct SimTransport {
    pub mock: Arc<MockSdr>,
}

pub(crate) struct EthTransport {
    pub port: EtherbonePort,
    pub streamer: Mutex<UdpStreamer>,
}

#[cfg(unix)]
pub(crate) struct PcieTransport {
    /// One node per channel; this build opens the identifier's node, which
    /// is channel 0.
    pub nodes: Vec<CharDevice>,
}

/// One transport per open, dispatched by matching.
pub(crate) enum Transport {
    Sim(SimTransport),
    Eth(EthTransport),
    #[cfg(unix)]
    Pcie(PcieTransport),
}

impl Transport {
    /// The register-access capability of this transport.
    pub(crate) fn reg(&self) -> &dyn RegisterPort {
        match self {
            Transport::Sim(sim) => sim.mock.as_ref(),
            Transport::Eth(eth) => &eth.port,
            #[cfg(unix)]
            Transport::Pcie(pcie) => &pcie.nodes[0],
        }
    }
}

pub(crate) struct DeviceInner {
    pub transport: Transport,
    pub channels: Vec<ChannelDirections>,
    /// Host-side pools, populated for the engine transports.
    pub pools: Vec<Option<DirPools>>,
    pub arbiter: ChannelLockArbiter,
    pub demux: InterruptDemux,
    pub number: registry::DeviceNumber,
    pub next_holder: AtomicU64,
    pub buf_count: usize,
    pub buf_size: usize,
    /// Serializes transport servicing across stream handles.
    service_lock: Mutex<()>,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        registry::unregister_device(self.number);
    }
}

impl DeviceInner {
    /// Advances the transport: steps the simulated engines, pumps the
    /// socket, or refreshes the kernel counters — then dispatches pending
    /// interrupts. Called from the blocking wait loops.
    pub(crate) fn service(&self, channel: usize) -> Result<()> {
        let _guard = self.service_lock.lock().unwrap();
        match &self.transport {
            Transport::Sim(sim) => {
                let dirs = &self.channels[channel];
                // The model is passive: emulate the device keeping pace
                // with what software submitted, and loop emitted buffers
                // back in while the crossbar is closed.
                let behind = dirs.tx.tx_level();
                if dirs.tx.is_enabled() && behind > 0 {
                    sim.mock.step(channel, Direction::Tx, behind as usize);
                }
                let looped = sim.mock.pending_loopback(channel);
                if looped > 0 {
                    sim.mock.step(channel, Direction::Rx, looped);
                }
                self.demux.service(sim.mock.as_ref(), &self.channels)?;
            }
            Transport::Eth(eth) => {
                let mut streamer = eth.streamer.lock().unwrap();
                streamer.pump_tx()?;
                streamer.pump_rx()?;
            }
            #[cfg(unix)]
            Transport::Pcie(pcie) => {
                let node = &pcie.nodes[channel];
                let dirs = &self.channels[channel];
                for (dir, state) in [(Direction::Rx, &dirs.rx), (Direction::Tx, &dirs.tx)] {
                    if state.is_enabled() {
                        let counters = node.dma_counters(dir, true)?;
                        state.set_hw(counters.hw_count as u64);
                    }
                }
            }
        }
        Ok(())
    }
}

/// An open M2SDR device.
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Opens a device by identifier string; see [`crate::DeviceId`] for the
    /// accepted forms.
    pub fn open(id: &str) -> Result<Self> {
        match DeviceId::parse(id)? {
            DeviceId::Pcie(path) => Self::open_pcie(&path),
            DeviceId::Eth(addr) => Self::open_eth(addr),
        }
    }

    /// Opens the software device model: full engine semantics, no hardware.
    pub fn open_sim(config: SimConfig) -> Result<Self> {
        registry::init()?;
        let mock = Arc::new(MockSdr::new(config.num_channels));
        mock.write_reg(csr::CSR_MSI_ENABLE, u32::MAX)?;
        verify_identity(mock.as_ref())?;

        let mut pools = Vec::with_capacity(config.num_channels);
        for channel in 0..config.num_channels {
            pools.push(Some(DirPools {
                rx: Arc::new(BufferPool::new(channel, config.buf_count, config.buf_size)?),
                tx: Arc::new(BufferPool::new(channel, config.buf_count, config.buf_size)?),
            }));
        }

        let number = registry::register_device("m2sdr-sim")?;
        info!(
            channels = config.num_channels,
            buf_count = config.buf_count,
            buf_size = config.buf_size,
            minor = number.minor,
            "opened simulated device"
        );
        Ok(Self::assemble(
            Transport::Sim(SimTransport { mock }),
            config.num_channels,
            pools,
            number,
            config.buf_count,
            config.buf_size,
        ))
    }

    fn open_eth(control: SocketAddr) -> Result<Self> {
        registry::init()?;
        let port = EtherbonePort::connect(control)?;
        verify_identity(&port)?;

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        let stream_peer = SocketAddr::new(control.ip(), control.port() + STREAM_PORT_OFFSET);
        let streamer = UdpStreamer::new(socket, stream_peer, DMA_BUFFER_COUNT, DMA_BUFFER_SIZE)?;

        // The facade's channel state *is* the streamer's: one channel.
        let channels = vec![ChannelDirections {
            rx: Arc::clone(streamer.rx_state()),
            tx: Arc::clone(streamer.tx_state()),
        }];

        let number = registry::register_device("m2sdr-eth")?;
        info!(%control, %stream_peer, minor = number.minor, "opened ethernet device");
        let inner = DeviceInner {
            transport: Transport::Eth(EthTransport {
                port,
                streamer: Mutex::new(streamer),
            }),
            channels,
            pools: vec![None],
            arbiter: ChannelLockArbiter::new(1),
            demux: InterruptDemux::new(),
            number,
            next_holder: AtomicU64::new(1),
            buf_count: DMA_BUFFER_COUNT,
            buf_size: DMA_BUFFER_SIZE,
            service_lock: Mutex::new(()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    #[cfg(unix)]
    fn open_pcie(path: &std::path::Path) -> Result<Self> {
        registry::init()?;
        let node = CharDevice::open(path)?;
        verify_identity(&node)?;

        let info = node.mmap_info()?;
        let buf_count = info.tx_count as usize;
        let buf_size = info.tx_size as usize;
        if !buf_count.is_power_of_two() || !buf_size.is_power_of_two() {
            return Err(Error::Unsupported(format!(
                "driver reports non-power-of-two ring geometry {buf_count}x{buf_size}"
            )));
        }

        let number = registry::register_device(&path.display().to_string())?;
        info!(path = %path.display(), buf_count, buf_size, minor = number.minor, "opened pcie device");
        Ok(Self::assemble(
            Transport::Pcie(PcieTransport { nodes: vec![node] }),
            1,
            vec![None],
            number,
            buf_count,
            buf_size,
        ))
    }

    #[cfg(not(unix))]
    fn open_pcie(_path: &std::path::Path) -> Result<Self> {
        Err(Error::Unsupported(
            "pcie transport requires a unix host".into(),
        ))
    }

    fn assemble(
        transport: Transport,
        num_channels: usize,
        pools: Vec<Option<DirPools>>,
        number: registry::DeviceNumber,
        buf_count: usize,
        buf_size: usize,
    ) -> Self {
        let channels = (0..num_channels)
            .map(|_| ChannelDirections {
                rx: Arc::new(DirectionState::new(Direction::Rx, buf_count)),
                tx: Arc::new(DirectionState::new(Direction::Tx, buf_count)),
            })
            .collect();
        Self {
            inner: Arc::new(DeviceInner {
                transport,
                channels,
                pools,
                arbiter: ChannelLockArbiter::new(num_channels),
                demux: InterruptDemux::new(),
                number,
                next_holder: AtomicU64::new(1),
                buf_count,
                buf_size,
                service_lock: Mutex::new(()),
            }),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    pub fn buf_count(&self) -> usize {
        self.inner.buf_count
    }

    /// Single-register read at a word-aligned byte offset.
    pub fn read_register(&self, addr: u32) -> Result<u32> {
        Ok(self.inner.transport.reg().read_reg(addr)?)
    }

    /// Single-register write at a word-aligned byte offset.
    pub fn write_register(&self, addr: u32, value: u32) -> Result<()> {
        Ok(self.inner.transport.reg().write_reg(addr, value)?)
    }

    /// Writes `value` to the scratch register and reads it back.
    pub fn scratch(&self, value: u32) -> Result<u32> {
        self.write_register(csr::CSR_SCRATCH, value)?;
        self.read_register(csr::CSR_SCRATCH)
    }

    /// Toggles timestamp-header insertion/stripping in the datapath.
    pub fn set_header_enable(&self, enable: bool) -> Result<()> {
        self.write_register(csr::CSR_HEADER_ENABLE, enable as u32)
    }

    /// Selects the datapath crossbar source.
    pub fn set_crossbar_mux(&self, select: u32) -> Result<()> {
        self.write_register(csr::CSR_CROSSBAR_MUX, select)
    }

    /// Enables the channel's internal TX→RX loopback.
    pub fn set_loopback(&self, channel: usize, enable: bool) -> Result<()> {
        self.check_channel(channel)?;
        match &self.inner.transport {
            #[cfg(unix)]
            Transport::Pcie(pcie) => pcie.nodes[channel].set_loopback(enable),
            _ => self.write_register(
                csr::channel_base(channel) + csr::DMA_LOOPBACK_ENABLE,
                enable as u32,
            ),
        }
    }

    /// Registers a callback for an external (non-DMA) interrupt vector.
    pub fn register_irq_callback<F>(&self, vector: u32, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.demux.register_callback(vector, Box::new(callback));
    }

    pub fn unregister_irq_callback(&self, vector: u32) {
        self.inner.demux.unregister_callback(vector);
    }

    /// Non-destructive lock status for a `(channel, direction)`.
    pub fn lock_status(&self, channel: usize, direction: Direction) -> Result<bool> {
        self.check_channel(channel)?;
        match &self.inner.transport {
            #[cfg(unix)]
            Transport::Pcie(pcie) => pcie.nodes[channel].lock_status(direction),
            _ => Ok(self.inner.arbiter.is_locked(channel, direction)),
        }
    }

    /// Configures one direction of one channel and starts it. Returns the
    /// stream handle that owns the lock and the ring; dropping the handle
    /// stops the engine and releases everything.
    pub fn config(&self, config: &StreamConfig) -> Result<StreamHandle> {
        config.validate(self.inner.buf_size, self.num_channels())?;
        StreamHandle::start(Arc::clone(&self.inner), config)
    }

    /// `poll`-style readiness of a direction: readable for RX, writable
    /// for TX.
    pub fn poll_ready(&self, channel: usize, direction: Direction) -> Result<bool> {
        self.check_channel(channel)?;
        self.inner.service(channel)?;
        let dirs = &self.inner.channels[channel];
        Ok(match direction {
            Direction::Rx => dirs.rx.rx_available() > 2,
            Direction::Tx => {
                (dirs.tx.tx_level().max(0) as u64) < self.inner.buf_count as u64 / 2
            }
        })
    }

    /// The software device model behind a simulated open, for rigs that
    /// drive it directly (rate control, fault injection).
    pub fn sim(&self) -> Option<&Arc<MockSdr>> {
        match &self.inner.transport {
            Transport::Sim(sim) => Some(&sim.mock),
            _ => None,
        }
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel >= self.num_channels() {
            return Err(Error::InvalidArgument(format!(
                "channel {} out of range (device has {})",
                channel,
                self.num_channels()
            )));
        }
        Ok(())
    }
}

/// Checks the info block against the identity this runtime understands.
fn verify_identity(port: &dyn RegisterPort) -> Result<()> {
    let vendor = port.read_reg(csr::CSR_INFO_VENDOR_ID)?;
    let product = port.read_reg(csr::CSR_INFO_PRODUCT_ID)?;
    let api = port.read_reg(csr::CSR_INFO_API_VERSION)?;
    if vendor != csr::VENDOR_ID || product != csr::PRODUCT_ID {
        return Err(Error::Unsupported(format!(
            "unknown device {vendor:#06x}:{product:#06x}"
        )));
    }
    if api != csr::API_VERSION {
        return Err(Error::Unsupported(format!(
            "gateware api {api}, runtime speaks {}",
            csr::API_VERSION
        )));
    }
    debug!(vendor, product, api, "device identity verified");
    Ok(())
}
