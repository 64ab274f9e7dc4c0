//! Blocking stream handles.
//!
//! A handle owns one `(channel, direction)`: the channel lock, the running
//! engine, and the user-side ring cursor. `rx`/`tx` are all-or-nothing —
//! the call waits until the whole request fits, then moves it; on timeout
//! nothing is consumed or produced beyond what the device moved on its own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use m2sdr_dma::counters::Timeout;
use m2sdr_dma::{AccessMode, DescriptorProgrammer, DirectionState, EngineConfig, HolderId, UserRing};
use m2sdr_proto::Direction;

#[cfg(unix)]
use crate::chardev::MappedRegion;
use crate::config::StreamConfig;
use crate::device::{DeviceInner, Transport};
use crate::error::{Error, Result};

/// Wait-loop granularity: how often the transport is serviced while a
/// blocking call waits for counter progress.
const SERVICE_TICK: Duration = Duration::from_millis(2);

/// Counter snapshot reported back through the `meta` argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub hw_count: u64,
    pub sw_count: u64,
    /// RX buffers dropped by overflow recovery.
    pub lost_buffers: u64,
    /// TX buffers the device replayed while software fell behind.
    pub underflows: u64,
}

enum Backend {
    /// Host-side ring: simulation, ethernet, and the PCIe zero-copy path.
    Ring(UserRing),
    /// PCIe zero-copy keeps the mapping alive for the ring built over it.
    #[cfg(unix)]
    PcieZeroCopy {
        ring: UserRing,
        _region: MappedRegion,
    },
    /// PCIe staged path through the whole-buffer read/write fallback.
    #[cfg(unix)]
    PcieStaged,
}

/// A configured, running stream direction.
pub struct StreamHandle {
    device: Arc<DeviceInner>,
    channel: usize,
    direction: Direction,
    holder: HolderId,
    default_timeout_ms: i64,
    backend: Backend,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("channel", &self.channel)
            .field("direction", &self.direction)
            .field("holder", &self.holder)
            .field("default_timeout_ms", &self.default_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub(crate) fn start(device: Arc<DeviceInner>, config: &StreamConfig) -> Result<Self> {
        let channel = config.channel;
        let direction = config.direction;
        let holder = device
            .next_holder
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        device.arbiter.request(holder, channel, direction)?;
        let result = Self::start_locked(Arc::clone(&device), config, holder);
        if result.is_err() {
            device.arbiter.release(holder, channel, direction);
        }
        result
    }

    fn start_locked(
        device: Arc<DeviceInner>,
        config: &StreamConfig,
        holder: HolderId,
    ) -> Result<Self> {
        let channel = config.channel;
        let direction = config.direction;
        let state = direction_state(&device, channel, direction);
        let mode = if config.flags.zero_copy {
            AccessMode::ZeroCopy
        } else {
            AccessMode::Staged
        };

        let backend = match &device.transport {
            Transport::Sim(sim) => {
                let pools = device.pools[channel].as_ref().ok_or_else(|| {
                    Error::Unsupported("transport carries no host-side pools".into())
                })?;
                let pool = match direction {
                    Direction::Rx => &pools.rx,
                    Direction::Tx => &pools.tx,
                };
                let engine = EngineConfig {
                    aligned_frames: config.flags.aligned_frames,
                    ..EngineConfig::default()
                };
                DescriptorProgrammer::new(sim.mock.as_ref(), channel).start(
                    direction,
                    pool,
                    &state,
                    &engine,
                )?;
                Backend::Ring(UserRing::new(Arc::clone(pool), Arc::clone(&state), mode)?)
            }
            Transport::Eth(eth) => {
                let streamer = eth.streamer.lock().unwrap();
                let ring = match direction {
                    Direction::Rx => streamer.rx_ring(mode)?,
                    Direction::Tx => streamer.tx_ring(mode)?,
                };
                state.reset();
                state.set_enabled(true);
                Backend::Ring(ring)
            }
            #[cfg(unix)]
            Transport::Pcie(pcie) => {
                let node = &pcie.nodes[channel];
                if !node.request_lock(direction)? {
                    return Err(Error::Busy);
                }
                node.dma_control(direction, true)?;
                state.reset();
                state.set_enabled(true);
                if config.flags.zero_copy {
                    let region = node.map_dma_region(direction)?;
                    // SAFETY: the region stays mapped for the pool's whole
                    // life; both live in this backend and drop in order.
                    let pool = unsafe {
                        m2sdr_dma::BufferPool::from_raw_parts(
                            channel,
                            region.base(),
                            region.buf_count(),
                            region.buf_size(),
                            None,
                        )
                    }?;
                    Backend::PcieZeroCopy {
                        ring: UserRing::new(Arc::new(pool), Arc::clone(&state), mode)?,
                        _region: region,
                    }
                } else {
                    Backend::PcieStaged
                }
            }
        };

        debug!(
            channel,
            %direction,
            zero_copy = config.flags.zero_copy,
            timeout_ms = config.timeout_ms,
            "stream configured"
        );

        Ok(Self {
            device,
            channel,
            direction,
            holder,
            default_timeout_ms: config.timeout_ms,
            backend,
        })
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes per DMA buffer, the granularity of every transfer.
    pub fn buf_size(&self) -> usize {
        self.device.buf_size
    }

    fn state(&self) -> Arc<DirectionState> {
        direction_state(&self.device, self.channel, self.direction)
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> StreamStats {
        let state = self.state();
        StreamStats {
            hw_count: state.hw(),
            sw_count: state.sw(),
            lost_buffers: state.lost_buffers(),
            underflows: state.underflows(),
        }
    }

    /// Readiness without blocking: readable (RX) or writable (TX).
    pub fn ready(&self) -> Result<bool> {
        self.device.service(self.channel)?;
        let state = self.state();
        Ok(match self.direction {
            Direction::Rx => state.rx_available() > 2,
            Direction::Tx => (state.tx_level().max(0) as u64) < state.ring_len() / 2,
        })
    }

    /// Receives exactly `buf.len()` bytes of samples. The length must be a
    /// non-zero multiple of the buffer size and at most half the ring.
    /// `timeout_ms` follows the millisecond convention (`0` non-blocking,
    /// negative forever); `None` uses the configured default.
    pub fn rx(
        &mut self,
        buf: &mut [u8],
        meta: Option<&mut StreamStats>,
        timeout_ms: Option<i64>,
    ) -> Result<()> {
        if self.direction != Direction::Rx {
            return Err(Error::InvalidArgument("rx on a tx stream".into()));
        }
        let needed = self.validate_transfer(buf.len())?;
        let timeout = Timeout::from_ms(timeout_ms.unwrap_or(self.default_timeout_ms));

        match &mut self.backend {
            #[cfg(unix)]
            Backend::PcieStaged => {
                let device = Arc::clone(&self.device);
                staged_pcie_rx(&device, self.channel, buf, timeout)?;
            }
            _ => {
                let state = self.state();
                self.wait_progress(timeout, || state.rx_available() >= needed)?;

                let buf_size = self.device.buf_size;
                let ring = self.ring_mut();
                for chunk in buf.chunks_mut(buf_size) {
                    // Overflow recovery inside the ring can trim the
                    // backlog, never below the half-ring the request fits
                    // in, so every chunk is guaranteed present.
                    let slot = ring.next_read_buffer().ok_or(Error::WouldBlock)?;
                    chunk.copy_from_slice(slot);
                    ring.consume();
                }
            }
        }

        self.publish_sw()?;
        if let Some(meta) = meta {
            *meta = self.stats();
        }
        Ok(())
    }

    /// Transmits exactly `buf.len()` bytes of samples; constraints as
    /// [`Self::rx`].
    pub fn tx(
        &mut self,
        buf: &[u8],
        meta: Option<&mut StreamStats>,
        timeout_ms: Option<i64>,
    ) -> Result<()> {
        if self.direction != Direction::Tx {
            return Err(Error::InvalidArgument("tx on an rx stream".into()));
        }
        let needed = self.validate_transfer(buf.len())?;
        let timeout = Timeout::from_ms(timeout_ms.unwrap_or(self.default_timeout_ms));

        match &mut self.backend {
            #[cfg(unix)]
            Backend::PcieStaged => {
                let device = Arc::clone(&self.device);
                staged_pcie_tx(&device, self.channel, buf, timeout)?;
            }
            _ => {
                let state = self.state();
                let half = state.ring_len() / 2;
                self.wait_progress(timeout, || {
                    state.recover_tx_underflow();
                    (state.tx_level().max(0) as u64) + needed <= half
                })?;

                let buf_size = self.device.buf_size;
                let ring = self.ring_mut();
                for chunk in buf.chunks(buf_size) {
                    let slot = ring
                        .next_write_buffer()
                        .ok_or(Error::WouldBlock)?;
                    slot.copy_from_slice(chunk);
                    ring.submit();
                }
                // Push what was just submitted out through the transport.
                self.device.service(self.channel)?;
            }
        }

        self.publish_sw()?;
        if let Some(meta) = meta {
            *meta = self.stats();
        }
        Ok(())
    }

    /// Checks a transfer length and returns it in buffers.
    fn validate_transfer(&self, len: usize) -> Result<u64> {
        let b = self.device.buf_size;
        if len == 0 || len % b != 0 {
            return Err(Error::InvalidArgument(format!(
                "transfer of {len} bytes is not a multiple of the {b}-byte buffer"
            )));
        }
        let buffers = (len / b) as u64;
        let half = self.device.buf_count as u64 / 2;
        if buffers > half {
            return Err(Error::InvalidArgument(format!(
                "transfer of {buffers} buffers exceeds the half-ring limit of {half}"
            )));
        }
        Ok(buffers)
    }

    fn ring_mut(&mut self) -> &mut UserRing {
        match &mut self.backend {
            Backend::Ring(ring) => ring,
            #[cfg(unix)]
            Backend::PcieZeroCopy { ring, .. } => ring,
            #[cfg(unix)]
            Backend::PcieStaged => unreachable!("staged pcie path has no ring"),
        }
    }

    /// Waits for `ready()` while keeping the transport serviced.
    /// Level-triggered: progress is re-checked after every service tick.
    fn wait_progress<F: Fn() -> bool>(&self, timeout: Timeout, ready: F) -> Result<()> {
        let state = self.state();
        let deadline = match timeout {
            Timeout::NonBlocking => {
                self.device.service(self.channel)?;
                return if ready() { Ok(()) } else { Err(Error::WouldBlock) };
            }
            Timeout::Forever => None,
            Timeout::Ms(ms) => Some(Instant::now() + Duration::from_millis(ms)),
        };

        loop {
            self.device.service(self.channel)?;
            if ready() {
                return Ok(());
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::Timeout);
                }
            }
            match state.wait_until(Timeout::Ms(SERVICE_TICK.as_millis() as u64), &ready) {
                Ok(()) | Err(m2sdr_dma::DmaError::Timeout) => continue,
                Err(m2sdr_dma::DmaError::Interrupted) => return Err(Error::Interrupted),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Publishes the software counter to the kernel on the PCIe zero-copy
    /// path; a no-op everywhere else.
    fn publish_sw(&self) -> Result<()> {
        #[cfg(unix)]
        if let Backend::PcieZeroCopy { .. } = &self.backend {
            if let Transport::Pcie(pcie) = &self.device.transport {
                let sw = self.state().sw() as i64;
                pcie.nodes[self.channel].publish_sw_count(self.direction, sw)?;
            }
        }
        Ok(())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let state = self.state();
        state.cancel_waiters();

        match &self.device.transport {
            Transport::Sim(sim) => {
                let other = direction_state(&self.device, self.channel, self.direction.opposite());
                let prog = DescriptorProgrammer::new(sim.mock.as_ref(), self.channel);
                if let Err(e) = prog.stop(self.direction, &state, other.is_enabled()) {
                    warn!(error = %e, "engine stop failed on drop");
                }
            }
            Transport::Eth(_) => {
                state.set_enabled(false);
            }
            #[cfg(unix)]
            Transport::Pcie(pcie) => {
                let node = &pcie.nodes[self.channel];
                if let Err(e) = node.dma_control(self.direction, false) {
                    warn!(error = %e, "engine stop failed on drop");
                }
                let _ = node.release_lock(self.direction);
                state.set_enabled(false);
            }
        }

        self.device
            .arbiter
            .release(self.holder, self.channel, self.direction);
        debug!(channel = self.channel, direction = %self.direction, "stream released");
    }
}

fn direction_state(
    device: &Arc<DeviceInner>,
    channel: usize,
    direction: Direction,
) -> Arc<DirectionState> {
    let dirs = &device.channels[channel];
    match direction {
        Direction::Rx => Arc::clone(&dirs.rx),
        Direction::Tx => Arc::clone(&dirs.tx),
    }
}

/// Staged PCIe receive through the read fallback: the kernel only delivers
/// whole buffers, so the request is accumulated privately and copied out
/// only when complete.
#[cfg(unix)]
fn staged_pcie_rx(
    device: &Arc<DeviceInner>,
    channel: usize,
    buf: &mut [u8],
    timeout: Timeout,
) -> Result<()> {
    let Transport::Pcie(pcie) = &device.transport else {
        unreachable!("staged pcie backend on non-pcie transport");
    };
    let node = &pcie.nodes[channel];
    let deadline = deadline_of(timeout)?;

    let mut staged = vec![0u8; buf.len()];
    let mut filled = 0;
    while filled < staged.len() {
        let n = node.read_chunks(&mut staged[filled..])?;
        filled += n;
        if filled == staged.len() {
            break;
        }
        if n == 0 {
            wait_node(node, Direction::Rx, timeout, deadline)?;
        }
    }
    buf.copy_from_slice(&staged);
    Ok(())
}

/// Staged PCIe transmit, mirror of [`staged_pcie_rx`].
#[cfg(unix)]
fn staged_pcie_tx(
    device: &Arc<DeviceInner>,
    channel: usize,
    buf: &[u8],
    timeout: Timeout,
) -> Result<()> {
    let Transport::Pcie(pcie) = &device.transport else {
        unreachable!("staged pcie backend on non-pcie transport");
    };
    let node = &pcie.nodes[channel];
    let deadline = deadline_of(timeout)?;

    let mut written = 0;
    while written < buf.len() {
        let n = node.write_chunks(&buf[written..])?;
        written += n;
        if written == buf.len() {
            break;
        }
        if n == 0 {
            wait_node(node, Direction::Tx, timeout, deadline)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn deadline_of(timeout: Timeout) -> Result<Option<Instant>> {
    Ok(match timeout {
        Timeout::NonBlocking => None,
        Timeout::Forever => None,
        Timeout::Ms(ms) => Some(Instant::now() + Duration::from_millis(ms)),
    })
}

#[cfg(unix)]
fn wait_node(
    node: &crate::chardev::CharDevice,
    direction: Direction,
    timeout: Timeout,
    deadline: Option<Instant>,
) -> Result<()> {
    if timeout == Timeout::NonBlocking {
        return Err(Error::WouldBlock);
    }
    let wait_ms = match deadline {
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(Error::Timeout);
            }
            (d - now).as_millis().min(100) as i32
        }
        None => 100,
    };
    node.wait_ready(direction, wait_ms)?;
    Ok(())
}
