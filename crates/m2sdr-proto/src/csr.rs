//! CSR register map and descriptor encoding.
//!
//! The device exposes a single MMIO region of [`CSR_REGION_SIZE`] bytes.
//! All accesses are single 32-bit transactions at 32-bit-aligned byte
//! offsets. The map is split into a global block at the bottom of the region
//! and one block per DMA channel starting at [`CSR_CHANNEL_BASE`]:
//!
//! ```text
//! 0x0000  info block (vendor / product / api version)
//! 0x000c  scratch
//! 0x0010  header_enable
//! 0x0014  crossbar_mux
//! 0x0020  msi enable / pending / clear
//! 0x1000  channel 0: writer block, reader block, synchronizer, loopback
//! 0x1100  channel 1: ...
//! ```
//!
//! "Writer" is the device engine that writes host memory (RX from the host's
//! point of view); "reader" reads host memory (TX). The naming follows the
//! engine, not the host, because that is how the gateware documents it.

/// Total size of the MMIO region in bytes.
pub const CSR_REGION_SIZE: u32 = 0x2000;

/// Maximum number of DMA channels the map can describe.
pub const MAX_CHANNELS: usize = 4;

// Global block.
pub const CSR_INFO_VENDOR_ID: u32 = 0x0000;
pub const CSR_INFO_PRODUCT_ID: u32 = 0x0004;
pub const CSR_INFO_API_VERSION: u32 = 0x0008;
pub const CSR_SCRATCH: u32 = 0x000c;
pub const CSR_HEADER_ENABLE: u32 = 0x0010;
pub const CSR_CROSSBAR_MUX: u32 = 0x0014;

pub const CSR_MSI_ENABLE: u32 = 0x0020;
pub const CSR_MSI_PENDING: u32 = 0x0024;
pub const CSR_MSI_CLEAR: u32 = 0x0028;

/// Expected contents of the info block. Opens check these and fail with an
/// unsupported-gateware error on mismatch.
pub const VENDOR_ID: u32 = 0x4d32;
pub const PRODUCT_ID: u32 = 0x5344;
pub const API_VERSION: u32 = 1;

/// Base of the per-channel blocks.
pub const CSR_CHANNEL_BASE: u32 = 0x1000;
/// Stride between channel blocks.
pub const CSR_CHANNEL_STRIDE: u32 = 0x0100;

// Per-direction engine block, relative to the direction base.
pub const DMA_ENABLE: u32 = 0x00;
pub const DMA_TABLE_VALUE: u32 = 0x04;
/// 64-bit bus address of the descriptor being programmed. Written through
/// [`split64::lo_hi`]: low word at this offset, high word 4 bytes above.
pub const DMA_TABLE_ADDR: u32 = 0x08;
pub const DMA_TABLE_WE: u32 = 0x10;
pub const DMA_TABLE_LOOP_PROG_N: u32 = 0x14;
pub const DMA_TABLE_LOOP_STATUS: u32 = 0x18;
pub const DMA_TABLE_FLUSH: u32 = 0x1c;

// Per-channel, direction-independent registers, relative to the channel base.
pub const DMA_SYNCHRONIZER_ENABLE: u32 = 0x80;
pub const DMA_LOOPBACK_ENABLE: u32 = 0x84;

/// Offset of the writer (RX) engine block within a channel block.
const WRITER_BLOCK: u32 = 0x00;
/// Offset of the reader (TX) engine block within a channel block.
const READER_BLOCK: u32 = 0x40;

/// One of the two streaming directions of a channel, from the host's point
/// of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Device -> host. Serviced by the DMA *writer* engine.
    Rx,
    /// Host -> device. Serviced by the DMA *reader* engine.
    Tx,
}

impl Direction {
    /// The opposite direction on the same channel.
    pub fn opposite(self) -> Self {
        match self {
            Direction::Rx => Direction::Tx,
            Direction::Tx => Direction::Rx,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Rx => "rx",
            Direction::Tx => "tx",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte offset of a channel's register block.
pub fn channel_base(channel: usize) -> u32 {
    debug_assert!(channel < MAX_CHANNELS);
    CSR_CHANNEL_BASE + channel as u32 * CSR_CHANNEL_STRIDE
}

/// Byte offset of a direction's engine block within the region.
pub fn direction_base(channel: usize, direction: Direction) -> u32 {
    channel_base(channel)
        + match direction {
            Direction::Rx => WRITER_BLOCK,
            Direction::Tx => READER_BLOCK,
        }
}

/// MSI vector number for a DMA direction. Writer vectors are even, reader
/// vectors odd; vectors at or above `2 * MAX_CHANNELS` belong to external
/// collaborators and are forwarded, not handled.
pub fn dma_vector(channel: usize, direction: Direction) -> u32 {
    let bit = channel as u32 * 2;
    match direction {
        Direction::Rx => bit,
        Direction::Tx => bit + 1,
    }
}

/// Inverse of [`dma_vector`]. `None` for external vectors.
pub fn vector_target(vector: u32) -> Option<(usize, Direction)> {
    if vector >= 2 * MAX_CHANNELS as u32 {
        return None;
    }
    let channel = (vector / 2) as usize;
    let direction = if vector % 2 == 0 {
        Direction::Rx
    } else {
        Direction::Tx
    };
    Some((channel, direction))
}

/// Descriptor control-word encoding.
///
/// A descriptor is programmed as three 32-bit writes (control word, address
/// low, address high) latched by a write to `DMA_TABLE_WE`. The control word
/// carries the buffer length in its low 24 bits and two flag bits.
pub mod desc {
    /// Suppress the per-descriptor interrupt.
    pub const IRQ_DISABLE: u32 = 1 << 24;
    /// Suppress the end-of-frame marker on this descriptor.
    pub const LAST_DISABLE: u32 = 1 << 25;
    /// Mask of the length field.
    pub const LENGTH_MASK: u32 = (1 << 24) - 1;

    /// Builds the control word for a buffer of `len` bytes.
    pub fn control(len: usize, irq_disable: bool, last_disable: bool) -> u32 {
        debug_assert!(len as u32 <= LENGTH_MASK);
        let mut word = len as u32 & LENGTH_MASK;
        if irq_disable {
            word |= IRQ_DISABLE;
        }
        if last_disable {
            word |= LAST_DISABLE;
        }
        word
    }
}

/// Loop-status register packing: `(loop_count << 16) | loop_index`.
///
/// `loop_index` is the descriptor the engine is currently on, in `[0, N)`;
/// `loop_count` counts completed revolutions and wraps every 2^16.
pub mod loop_status {
    pub fn pack(count: u16, index: u16) -> u32 {
        (count as u32) << 16 | index as u32
    }

    pub fn count(status: u32) -> u32 {
        status >> 16
    }

    pub fn index(status: u32) -> u32 {
        status & 0xffff
    }
}

/// Helpers for 64-bit fields laid out as two 32-bit words.
///
/// The gateware is not consistent about word order: some 64-bit fields put
/// the low word at the base offset, others the high word. Call sites must go
/// through one of these named pairs so the convention in force is visible
/// where the access happens, never buried in generic code.
pub mod split64 {
    /// Word order: low word at `base`, high word at `base + 4`.
    pub fn lo_hi(value: u64) -> [(u32, u32); 2] {
        [(0, value as u32), (4, (value >> 32) as u32)]
    }

    /// Word order: high word at `base`, low word at `base + 4`.
    pub fn hi_lo(value: u64) -> [(u32, u32); 2] {
        [(0, (value >> 32) as u32), (4, value as u32)]
    }

    /// Reassembles a value read in low-then-high order.
    pub fn from_lo_hi(lo: u32, hi: u32) -> u64 {
        (hi as u64) << 32 | lo as u64
    }

    /// Reassembles a value read in high-then-low order.
    pub fn from_hi_lo(hi: u32, lo: u32) -> u64 {
        (hi as u64) << 32 | lo as u64
    }
}

/// Whether `addr` is a valid single-word access into the region.
pub fn addr_in_region(addr: u32) -> bool {
    addr % 4 == 0 && addr < CSR_REGION_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_blocks_fit_in_region() {
        let last = direction_base(MAX_CHANNELS - 1, Direction::Tx) + DMA_TABLE_FLUSH;
        assert!(last < CSR_REGION_SIZE);
    }

    #[test]
    fn direction_bases_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for ch in 0..MAX_CHANNELS {
            for dir in [Direction::Rx, Direction::Tx] {
                assert!(seen.insert(direction_base(ch, dir)));
            }
        }
    }

    #[test]
    fn vector_roundtrip() {
        for ch in 0..MAX_CHANNELS {
            for dir in [Direction::Rx, Direction::Tx] {
                let v = dma_vector(ch, dir);
                assert_eq!(vector_target(v), Some((ch, dir)));
            }
        }
        assert_eq!(vector_target(2 * MAX_CHANNELS as u32), None);
        assert_eq!(vector_target(31), None);
    }

    #[test]
    fn descriptor_control_word() {
        let word = desc::control(8192, true, true);
        assert_eq!(word & desc::LENGTH_MASK, 8192);
        assert_ne!(word & desc::IRQ_DISABLE, 0);
        assert_ne!(word & desc::LAST_DISABLE, 0);

        let plain = desc::control(8192, false, false);
        assert_eq!(plain, 8192);
    }

    #[test]
    fn loop_status_packing() {
        let status = loop_status::pack(3, 17);
        assert_eq!(loop_status::count(status), 3);
        assert_eq!(loop_status::index(status), 17);
    }

    #[test]
    fn split64_word_orders() {
        let value = 0x1122_3344_5566_7788u64;
        assert_eq!(split64::lo_hi(value), [(0, 0x5566_7788), (4, 0x1122_3344)]);
        assert_eq!(split64::hi_lo(value), [(0, 0x1122_3344), (4, 0x5566_7788)]);
        assert_eq!(split64::from_lo_hi(0x5566_7788, 0x1122_3344), value);
        assert_eq!(split64::from_hi_lo(0x1122_3344, 0x5566_7788), value);
    }

    #[test]
    fn region_bounds() {
        assert!(addr_in_region(CSR_SCRATCH));
        assert!(addr_in_region(direction_base(0, Direction::Tx) + DMA_TABLE_LOOP_STATUS));
        assert!(!addr_in_region(CSR_REGION_SIZE));
        assert!(!addr_in_region(2)); // unaligned
    }
}
