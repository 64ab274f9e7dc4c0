//! Descriptor table programming and engine start/stop.

use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use m2sdr_proto::csr::{self, desc, Direction};
use m2sdr_proto::DMA_BUFFERS_PER_IRQ;

use crate::counters::DirectionState;
use crate::error::{DmaError, DmaResult};
use crate::pool::BufferPool;
use crate::port::{self, RegisterPort};

/// How long the engine is given to drain in-flight transactions between the
/// table flush and the disable write.
const STOP_SETTLE: Duration = Duration::from_millis(1);

/// Engine parameters for one direction.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Interrupt cadence: every `buffers_per_irq`-th descriptor keeps its
    /// interrupt enabled. The ring gets `buf_size * buffers_per_irq` bytes
    /// of headroom between wakeups, which sets the latency floor.
    pub buffers_per_irq: usize,
    /// End-of-frame alignment mode: leaves the last-marker active on every
    /// descriptor instead of suppressing it.
    pub aligned_frames: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffers_per_irq: DMA_BUFFERS_PER_IRQ,
            aligned_frames: false,
        }
    }
}

impl EngineConfig {
    fn validate(&self, ring_len: usize) -> DmaResult<()> {
        if self.buffers_per_irq == 0 || self.buffers_per_irq > ring_len {
            return Err(DmaError::InvalidConfig(format!(
                "buffers_per_irq {} outside 1..={}",
                self.buffers_per_irq, ring_len
            )));
        }
        Ok(())
    }
}

/// Programs one channel's descriptor tables and sequences engine start/stop.
pub struct DescriptorProgrammer<'a, P: RegisterPort + ?Sized> {
    port: &'a P,
    channel: usize,
}

impl<'a, P: RegisterPort + ?Sized> DescriptorProgrammer<'a, P> {
    pub fn new(port: &'a P, channel: usize) -> Self {
        Self { port, channel }
    }

    /// Fills the table from the pool and starts the engine.
    ///
    /// Sequence: flush the table, program one descriptor per buffer, arm
    /// loop mode, zero the counters, then enable the engine and the
    /// transport synchronizer. The enable writes must not be reordered
    /// before the descriptor writes; a release fence sits between them for
    /// platforms that reorder MMIO.
    ///
    /// A failed descriptor write is fatal to the direction: the error
    /// propagates and the engine stays disabled.
    pub fn start(
        &self,
        direction: Direction,
        pool: &BufferPool,
        state: &DirectionState,
        config: &EngineConfig,
    ) -> DmaResult<()> {
        config.validate(pool.len())?;
        let base = csr::direction_base(self.channel, direction);

        self.port.write_reg(base + csr::DMA_TABLE_FLUSH, 1)?;

        for i in 0..pool.len() {
            let irq_disable = i % config.buffers_per_irq != 0;
            let last_disable = !config.aligned_frames;
            let control = desc::control(pool.buf_size(), irq_disable, last_disable);
            self.port.write_reg(base + csr::DMA_TABLE_VALUE, control)?;
            // Table address is documented low-word-first.
            port::write_u64_lo_hi(self.port, base + csr::DMA_TABLE_ADDR, pool.bus_address(i))?;
            self.port.write_reg(base + csr::DMA_TABLE_WE, 1)?;
            trace!(
                channel = self.channel,
                %direction,
                index = i,
                control,
                "programmed descriptor"
            );
        }

        self.port
            .write_reg(base + csr::DMA_TABLE_LOOP_PROG_N, 1)?;
        state.reset();

        // Release pair: descriptor writes above, enable writes below.
        fence(Ordering::Release);

        self.port.write_reg(base + csr::DMA_ENABLE, 1)?;
        self.port.write_reg(
            csr::channel_base(self.channel) + csr::DMA_SYNCHRONIZER_ENABLE,
            1,
        )?;
        state.set_enabled(true);

        debug!(
            channel = self.channel,
            %direction,
            buffers = pool.len(),
            buf_size = pool.buf_size(),
            buffers_per_irq = config.buffers_per_irq,
            "dma engine started"
        );
        Ok(())
    }

    /// Stops the engine: un-arm the loop, flush, let in-flight transactions
    /// settle, disable, re-flush.
    ///
    /// The transport synchronizer is shared by both directions of the
    /// channel; it is disabled only when `other_active` is false. Disabling
    /// it under an active opposite direction would cut that stream's
    /// clock domain crossing mid-transfer.
    pub fn stop(&self, direction: Direction, state: &DirectionState, other_active: bool) -> DmaResult<()> {
        let base = csr::direction_base(self.channel, direction);

        self.port
            .write_reg(base + csr::DMA_TABLE_LOOP_PROG_N, 0)?;
        self.port.write_reg(base + csr::DMA_TABLE_FLUSH, 1)?;
        std::thread::sleep(STOP_SETTLE);
        self.port.write_reg(base + csr::DMA_ENABLE, 0)?;
        self.port.write_reg(base + csr::DMA_TABLE_FLUSH, 1)?;

        if !other_active {
            self.port.write_reg(
                csr::channel_base(self.channel) + csr::DMA_SYNCHRONIZER_ENABLE,
                0,
            )?;
        }
        state.set_enabled(false);

        debug!(
            channel = self.channel,
            %direction,
            synchronizer_kept = other_active,
            "dma engine stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSdr;

    fn setup() -> (MockSdr, BufferPool, DirectionState) {
        let mock = MockSdr::new(1);
        let pool = BufferPool::new(0, 16, 4096).unwrap();
        let state = DirectionState::new(Direction::Rx, 16);
        (mock, pool, state)
    }

    #[test]
    fn start_programs_full_table() {
        let (mock, pool, state) = setup();
        let prog = DescriptorProgrammer::new(&mock, 0);
        prog.start(Direction::Rx, &pool, &state, &EngineConfig::default())
            .unwrap();

        let table = mock.descriptor_table(0, Direction::Rx);
        assert_eq!(table.len(), 16);
        for (i, d) in table.iter().enumerate() {
            assert_eq!(d.addr, pool.bus_address(i));
            assert_eq!(d.control & desc::LENGTH_MASK, 4096);
            // K = 8: descriptors 0 and 8 interrupt, the rest do not.
            assert_eq!(d.control & desc::IRQ_DISABLE == 0, i % 8 == 0);
            assert_ne!(d.control & desc::LAST_DISABLE, 0);
        }
        assert!(mock.engine_enabled(0, Direction::Rx));
        assert!(mock.synchronizer_enabled(0));
        assert!(state.is_enabled());
    }

    #[test]
    fn aligned_frames_keep_last_marker() {
        let (mock, pool, state) = setup();
        let prog = DescriptorProgrammer::new(&mock, 0);
        let config = EngineConfig {
            aligned_frames: true,
            ..EngineConfig::default()
        };
        prog.start(Direction::Rx, &pool, &state, &config).unwrap();
        for d in mock.descriptor_table(0, Direction::Rx) {
            assert_eq!(d.control & desc::LAST_DISABLE, 0);
        }
    }

    #[test]
    fn start_resets_counters() {
        let (mock, pool, state) = setup();
        state.add_sw(7);
        let prog = DescriptorProgrammer::new(&mock, 0);
        prog.start(Direction::Rx, &pool, &state, &EngineConfig::default())
            .unwrap();
        assert_eq!(state.hw(), 0);
        assert_eq!(state.sw(), 0);
    }

    #[test]
    fn stop_respects_synchronizer_guard() {
        let (mock, pool, state) = setup();
        let prog = DescriptorProgrammer::new(&mock, 0);
        prog.start(Direction::Rx, &pool, &state, &EngineConfig::default())
            .unwrap();

        // Opposite direction still active: synchronizer must survive.
        prog.stop(Direction::Rx, &state, true).unwrap();
        assert!(!mock.engine_enabled(0, Direction::Rx));
        assert!(mock.synchronizer_enabled(0));

        // No opposite activity: synchronizer goes down too.
        prog.start(Direction::Rx, &pool, &state, &EngineConfig::default())
            .unwrap();
        prog.stop(Direction::Rx, &state, false).unwrap();
        assert!(!mock.synchronizer_enabled(0));
    }

    #[test]
    fn rejects_bad_irq_cadence() {
        let (mock, pool, state) = setup();
        let prog = DescriptorProgrammer::new(&mock, 0);
        let config = EngineConfig {
            buffers_per_irq: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            prog.start(Direction::Rx, &pool, &state, &config),
            Err(DmaError::InvalidConfig(_))
        ));
        let config = EngineConfig {
            buffers_per_irq: 32,
            ..EngineConfig::default()
        };
        assert!(matches!(
            prog.start(Direction::Rx, &pool, &state, &config),
            Err(DmaError::InvalidConfig(_))
        ));
    }
}
