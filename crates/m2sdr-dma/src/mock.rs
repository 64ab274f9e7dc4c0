//! Software device model.
//!
//! `MockSdr` implements the CSR contract of the gateware — descriptor
//! tables, loop engines, MSI vectors, the internal loopback crossbar — as an
//! in-process register file. It is what the engine runs against in tests and
//! in hardware-less setups; the register semantics mirror the device
//! documentation, not any particular test's needs.
//!
//! The model is passive: nothing advances until a caller steps it. Stepping
//! a direction makes the corresponding engine complete buffers exactly the
//! way the hardware would — walk the descriptor table, move bytes through
//! the buffer's bus address, bump the loop status, raise MSI per descriptor
//! flags.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::trace;

use m2sdr_proto::csr::{self, desc, Direction};

use crate::error::{DmaError, DmaResult};
use crate::port::RegisterPort;

/// A latched descriptor as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDescriptor {
    pub control: u32,
    pub addr: u64,
}

#[derive(Default)]
struct MockEngine {
    table: Vec<MockDescriptor>,
    pending_control: u32,
    pending_addr_lo: u32,
    pending_addr_hi: u32,
    loop_armed: bool,
    enabled: bool,
    loop_index: u32,
    loop_count: u32,
}

impl MockEngine {
    fn reg_write(&mut self, offset: u32, value: u32) {
        match offset {
            csr::DMA_ENABLE => self.enabled = value != 0,
            csr::DMA_TABLE_VALUE => self.pending_control = value,
            csr::DMA_TABLE_ADDR => self.pending_addr_lo = value,
            o if o == csr::DMA_TABLE_ADDR + 4 => self.pending_addr_hi = value,
            csr::DMA_TABLE_WE => {
                if value != 0 {
                    self.table.push(MockDescriptor {
                        control: self.pending_control,
                        addr: (self.pending_addr_hi as u64) << 32 | self.pending_addr_lo as u64,
                    });
                }
            }
            csr::DMA_TABLE_LOOP_PROG_N => self.loop_armed = value != 0,
            csr::DMA_TABLE_FLUSH => {
                if value != 0 {
                    self.table.clear();
                    self.loop_index = 0;
                    self.loop_count = 0;
                }
            }
            _ => {}
        }
    }

    fn reg_read(&self, offset: u32) -> u32 {
        match offset {
            csr::DMA_ENABLE => self.enabled as u32,
            csr::DMA_TABLE_LOOP_PROG_N => self.loop_armed as u32,
            csr::DMA_TABLE_LOOP_STATUS => {
                csr::loop_status::pack(self.loop_count as u16, self.loop_index as u16)
            }
            _ => 0,
        }
    }

    fn runnable(&self) -> bool {
        self.enabled && self.loop_armed && !self.table.is_empty()
    }

    fn current(&self) -> MockDescriptor {
        self.table[self.loop_index as usize]
    }

    fn advance(&mut self) {
        self.loop_index += 1;
        if self.loop_index as usize == self.table.len() {
            self.loop_index = 0;
            self.loop_count = (self.loop_count + 1) & 0xffff;
        }
    }
}

struct MockChannel {
    writer: MockEngine,
    reader: MockEngine,
    synchronizer: bool,
    loopback: bool,
    /// Buffers emitted by the reader engine, waiting to re-enter through
    /// the writer engine when the loopback crossbar is closed.
    loop_fifo: VecDeque<Vec<u8>>,
    /// Seed for internally generated RX data when loopback is open.
    fill_seq: u8,
}

impl MockChannel {
    fn new() -> Self {
        Self {
            writer: MockEngine::default(),
            reader: MockEngine::default(),
            synchronizer: false,
            loopback: false,
            loop_fifo: VecDeque::new(),
            fill_seq: 0,
        }
    }
}

struct MockState {
    /// Plain-storage global registers (scratch and friends).
    globals: HashMap<u32, u32>,
    msi_enable: u32,
    msi_pending: u32,
    channels: Vec<MockChannel>,
}

/// In-process register-accurate device model.
pub struct MockSdr {
    state: Mutex<MockState>,
    num_channels: usize,
}

impl MockSdr {
    pub fn new(num_channels: usize) -> Self {
        assert!(num_channels >= 1 && num_channels <= csr::MAX_CHANNELS);
        Self {
            state: Mutex::new(MockState {
                globals: HashMap::new(),
                msi_enable: 0,
                msi_pending: 0,
                channels: (0..num_channels).map(|_| MockChannel::new()).collect(),
            }),
            num_channels,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Completes up to `n` buffers on one engine, exactly as the hardware
    /// would: data moves through the descriptor's bus address, the loop
    /// status advances, MSI pending bits are raised for descriptors whose
    /// interrupt is not suppressed. Returns how many buffers completed (an
    /// RX engine starves when the loopback fifo runs dry).
    pub fn step(&self, channel: usize, direction: Direction, n: usize) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut done = 0;
        for _ in 0..n {
            let ch = &mut state.channels[channel];
            if !ch.synchronizer {
                break;
            }
            let engine = match direction {
                Direction::Rx => &ch.writer,
                Direction::Tx => &ch.reader,
            };
            if !engine.runnable() {
                break;
            }
            let d = engine.current();
            let len = (d.control & desc::LENGTH_MASK) as usize;

            match direction {
                Direction::Tx => {
                    // SAFETY: descriptor addresses are programmed from live
                    // BufferPool allocations on the host path; the model
                    // reads the buffer the engine would fetch over the bus.
                    let bytes =
                        unsafe { std::slice::from_raw_parts(d.addr as *const u8, len) }.to_vec();
                    if ch.loopback {
                        ch.loop_fifo.push_back(bytes);
                    }
                    ch.reader.advance();
                }
                Direction::Rx => {
                    let data = if ch.loopback {
                        match ch.loop_fifo.pop_front() {
                            Some(bytes) => bytes,
                            None => break, // nothing to loop back yet
                        }
                    } else {
                        let seq = ch.fill_seq;
                        ch.fill_seq = ch.fill_seq.wrapping_add(1);
                        vec![seq; len]
                    };
                    let copy = data.len().min(len);
                    // SAFETY: as above; the writer engine stores into the
                    // buffer the descriptor points at.
                    unsafe {
                        std::ptr::copy_nonoverlapping(data.as_ptr(), d.addr as *mut u8, copy);
                    }
                    ch.writer.advance();
                }
            }

            if d.control & desc::IRQ_DISABLE == 0 {
                let vector = csr::dma_vector(channel, direction);
                state.msi_pending |= 1 << vector;
            }
            done += 1;
        }
        if done > 0 {
            trace!(channel, %direction, done, "mock engine stepped");
        }
        done
    }

    /// Raises an external (non-DMA) vector, as a collaborator core would.
    pub fn raise_external(&self, vector: u32) {
        let mut state = self.state.lock().unwrap();
        state.msi_pending |= 1 << vector;
    }

    /// Buffers sitting in the loopback crossbar, emitted but not yet
    /// re-received.
    pub fn pending_loopback(&self, channel: usize) -> usize {
        self.state.lock().unwrap().channels[channel].loop_fifo.len()
    }

    pub fn descriptor_table(&self, channel: usize, direction: Direction) -> Vec<MockDescriptor> {
        let state = self.state.lock().unwrap();
        let ch = &state.channels[channel];
        match direction {
            Direction::Rx => ch.writer.table.clone(),
            Direction::Tx => ch.reader.table.clone(),
        }
    }

    pub fn engine_enabled(&self, channel: usize, direction: Direction) -> bool {
        let state = self.state.lock().unwrap();
        let ch = &state.channels[channel];
        match direction {
            Direction::Rx => ch.writer.enabled,
            Direction::Tx => ch.reader.enabled,
        }
    }

    pub fn synchronizer_enabled(&self, channel: usize) -> bool {
        self.state.lock().unwrap().channels[channel].synchronizer
    }

    pub fn loopback_enabled(&self, channel: usize) -> bool {
        self.state.lock().unwrap().channels[channel].loopback
    }

    pub fn msi_pending_raw(&self) -> u32 {
        self.state.lock().unwrap().msi_pending
    }

    fn check_channel(&self, channel: usize, addr: u32) -> DmaResult<()> {
        if channel >= self.num_channels {
            return Err(DmaError::InvalidAddress { addr });
        }
        Ok(())
    }
}

impl RegisterPort for MockSdr {
    fn read_reg(&self, addr: u32) -> DmaResult<u32> {
        if !csr::addr_in_region(addr) {
            return Err(DmaError::InvalidAddress { addr });
        }
        if addr >= csr::CSR_CHANNEL_BASE {
            let channel = ((addr - csr::CSR_CHANNEL_BASE) / csr::CSR_CHANNEL_STRIDE) as usize;
            self.check_channel(channel, addr)?;
            let state = self.state.lock().unwrap();
            let ch = &state.channels[channel];
            let offset = addr - csr::channel_base(channel);
            return Ok(match offset {
                csr::DMA_SYNCHRONIZER_ENABLE => ch.synchronizer as u32,
                csr::DMA_LOOPBACK_ENABLE => ch.loopback as u32,
                o if o < 0x40 => ch.writer.reg_read(o),
                o if o < 0x80 => ch.reader.reg_read(o - 0x40),
                _ => 0,
            });
        }
        let state = self.state.lock().unwrap();
        Ok(match addr {
            csr::CSR_INFO_VENDOR_ID => csr::VENDOR_ID,
            csr::CSR_INFO_PRODUCT_ID => csr::PRODUCT_ID,
            csr::CSR_INFO_API_VERSION => csr::API_VERSION,
            csr::CSR_MSI_ENABLE => state.msi_enable,
            csr::CSR_MSI_PENDING => state.msi_pending,
            a => state.globals.get(&a).copied().unwrap_or(0),
        })
    }

    fn write_reg(&self, addr: u32, value: u32) -> DmaResult<()> {
        if !csr::addr_in_region(addr) {
            return Err(DmaError::InvalidAddress { addr });
        }
        if addr >= csr::CSR_CHANNEL_BASE {
            let channel = ((addr - csr::CSR_CHANNEL_BASE) / csr::CSR_CHANNEL_STRIDE) as usize;
            self.check_channel(channel, addr)?;
            let mut state = self.state.lock().unwrap();
            let ch = &mut state.channels[channel];
            let offset = addr - csr::channel_base(channel);
            match offset {
                csr::DMA_SYNCHRONIZER_ENABLE => ch.synchronizer = value != 0,
                csr::DMA_LOOPBACK_ENABLE => ch.loopback = value != 0,
                o if o < 0x40 => ch.writer.reg_write(o, value),
                o if o < 0x80 => ch.reader.reg_write(o - 0x40, value),
                _ => {}
            }
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        match addr {
            // Info block is read-only; writes land nowhere.
            csr::CSR_INFO_VENDOR_ID | csr::CSR_INFO_PRODUCT_ID | csr::CSR_INFO_API_VERSION => {}
            csr::CSR_MSI_ENABLE => state.msi_enable = value,
            csr::CSR_MSI_CLEAR => state.msi_pending &= !value,
            a => {
                state.globals.insert(a, value);
            }
        }
        Ok(())
    }
}
