//! Ring header layout and geometry.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crate::error::{ShmError, ShmResult};

/// Size of the header at the start of the file.
pub const SHM_HEADER_SIZE: usize = 64;

/// Minimum slot count a ring may be created with.
pub const MIN_SLOTS: u32 = 16;

/// Bytes per sample assumed for legacy files whose header predates the
/// `sample_size` field and reads zero: 4-byte Complex-Int16.
pub const LEGACY_SAMPLE_SIZE: u32 = 4;

/// Header flags.
pub mod flags {
    /// Producer finished; consumers drain and terminate. Monotonic.
    pub const WRITER_DONE: u16 = 1 << 0;
}

/// Creation parameters for a ring.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Samples per chunk per channel.
    pub chunk_size: u32,
    /// Slots in the ring. At least [`MIN_SLOTS`].
    pub num_slots: u32,
    pub num_channels: u16,
    /// Bytes per sample.
    pub sample_size: u32,
}

impl RingConfig {
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_size as usize * self.sample_size as usize * self.num_channels as usize
    }

    pub fn total_size(&self) -> usize {
        SHM_HEADER_SIZE + self.num_slots as usize * self.chunk_bytes()
    }

    pub fn validate(&self) -> ShmResult<()> {
        if self.num_slots < MIN_SLOTS {
            return Err(ShmError::InvalidConfig(format!(
                "num_slots {} below minimum {}",
                self.num_slots, MIN_SLOTS
            )));
        }
        if self.chunk_size == 0 || self.num_channels == 0 || self.sample_size == 0 {
            return Err(ShmError::InvalidConfig(
                "chunk_size, num_channels and sample_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// The 64 bytes at the start of the shared file.
///
/// `#[repr(C)]` so every process mapping the file agrees on the layout.
/// Index and counter fields are atomics because two processes update them
/// concurrently through the same mapping.
#[repr(C, align(64))]
pub struct RingHeader {
    pub write_index: AtomicU64,
    pub read_index: AtomicU64,
    pub error_count: AtomicU64,
    pub chunk_size: u32,
    pub num_slots: u32,
    pub num_channels: u16,
    pub flags: AtomicU16,
    pub sample_size: u32,
    pub buffer_stall_count: AtomicU64,
    _reserved: [u8; 16],
}

impl RingHeader {
    /// Initializes a freshly created header. Producer-side only.
    pub fn init(&mut self, config: &RingConfig) {
        self.write_index = AtomicU64::new(0);
        self.read_index = AtomicU64::new(0);
        self.error_count = AtomicU64::new(0);
        self.chunk_size = config.chunk_size;
        self.num_slots = config.num_slots;
        self.num_channels = config.num_channels;
        self.flags = AtomicU16::new(0);
        self.sample_size = config.sample_size;
        self.buffer_stall_count = AtomicU64::new(0);
        self._reserved = [0u8; 16];
    }

    /// Bytes per sample, with the legacy zero meaning 4-byte Complex-Int16.
    pub fn effective_sample_size(&self) -> u32 {
        if self.sample_size == 0 {
            LEGACY_SAMPLE_SIZE
        } else {
            self.sample_size
        }
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_size as usize
            * self.effective_sample_size() as usize
            * self.num_channels as usize
    }

    pub fn total_size(&self) -> usize {
        SHM_HEADER_SIZE + self.num_slots as usize * self.chunk_bytes()
    }

    /// Byte offset of slot `index` within the file.
    pub fn slot_offset(&self, index: u64) -> usize {
        SHM_HEADER_SIZE + (index % self.num_slots as u64) as usize * self.chunk_bytes()
    }

    /// Geometry sanity check against the mapped file's size. Catches stale
    /// or foreign files at open time.
    pub fn validate(&self, file_size: usize) -> ShmResult<()> {
        if self.num_slots < MIN_SLOTS {
            return Err(ShmError::InvalidHeader(format!(
                "num_slots {} below minimum {}",
                self.num_slots, MIN_SLOTS
            )));
        }
        if self.chunk_size == 0 || self.num_channels == 0 {
            return Err(ShmError::InvalidHeader(
                "zero chunk_size or num_channels".into(),
            ));
        }
        let expected = self.total_size();
        if file_size != expected {
            return Err(ShmError::InvalidHeader(format!(
                "file is {file_size} bytes, header describes {expected}"
            )));
        }
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        if write < read || write - read > self.num_slots as u64 {
            return Err(ShmError::InvalidHeader(format!(
                "inconsistent indices: write {write}, read {read}"
            )));
        }
        Ok(())
    }

    pub fn writer_done(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flags::WRITER_DONE != 0
    }

    /// Sets `writer_done`. Monotonic by construction: fetch_or never clears.
    pub fn set_writer_done(&self) {
        self.flags.fetch_or(flags::WRITER_DONE, Ordering::Release);
    }

    /// Chunks available to read.
    pub fn available(&self) -> u64 {
        let write = self.write_index.load(Ordering::Acquire);
        let read = self.read_index.load(Ordering::Acquire);
        write - read
    }

    /// Free slots available to write.
    pub fn free(&self) -> u64 {
        self.num_slots as u64 - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_exactly_64_bytes() {
        assert_eq!(std::mem::size_of::<RingHeader>(), SHM_HEADER_SIZE);
        assert_eq!(std::mem::align_of::<RingHeader>(), 64);
    }

    fn test_header(config: &RingConfig) -> RingHeader {
        // SAFETY: RingHeader is repr(C) with plain-integer fields; the
        // zeroed value is valid and immediately overwritten by init().
        let mut header: RingHeader = unsafe { std::mem::zeroed() };
        header.init(config);
        header
    }

    #[test]
    fn slot_offsets_wrap() {
        let config = RingConfig {
            chunk_size: 2048,
            num_slots: 64,
            num_channels: 2,
            sample_size: 4,
        };
        let header = test_header(&config);
        assert_eq!(header.chunk_bytes(), 2048 * 4 * 2);
        assert_eq!(header.slot_offset(0), SHM_HEADER_SIZE);
        assert_eq!(header.slot_offset(1), SHM_HEADER_SIZE + 16384);
        assert_eq!(header.slot_offset(64), SHM_HEADER_SIZE);
        assert_eq!(header.slot_offset(65), header.slot_offset(1));
    }

    #[test]
    fn legacy_sample_size_means_complex_int16() {
        let config = RingConfig {
            chunk_size: 1024,
            num_slots: 16,
            num_channels: 1,
            sample_size: 4,
        };
        let mut header = test_header(&config);
        header.sample_size = 0;
        assert_eq!(header.effective_sample_size(), LEGACY_SAMPLE_SIZE);
        assert_eq!(header.chunk_bytes(), 1024 * 4);
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        let config = RingConfig {
            chunk_size: 1024,
            num_slots: 16,
            num_channels: 1,
            sample_size: 4,
        };
        let header = test_header(&config);
        header.validate(header.total_size()).unwrap();
        assert!(header.validate(header.total_size() - 1).is_err());

        let mut small = test_header(&config);
        small.num_slots = 8;
        assert!(small.validate(small.total_size()).is_err());
    }

    #[test]
    fn validate_rejects_inconsistent_indices() {
        let config = RingConfig {
            chunk_size: 64,
            num_slots: 16,
            num_channels: 1,
            sample_size: 4,
        };
        let header = test_header(&config);
        header.write_index.store(3, Ordering::Release);
        header.read_index.store(5, Ordering::Release);
        assert!(header.validate(header.total_size()).is_err());
    }

    #[test]
    fn writer_done_is_monotonic() {
        let config = RingConfig {
            chunk_size: 64,
            num_slots: 16,
            num_channels: 1,
            sample_size: 4,
        };
        let header = test_header(&config);
        assert!(!header.writer_done());
        header.set_writer_done();
        header.set_writer_done();
        assert!(header.writer_done());
    }

    #[test]
    fn config_validation() {
        let bad = RingConfig {
            chunk_size: 0,
            num_slots: 16,
            num_channels: 1,
            sample_size: 4,
        };
        assert!(bad.validate().is_err());
        let small = RingConfig {
            chunk_size: 64,
            num_slots: 15,
            num_channels: 1,
            sample_size: 4,
        };
        assert!(small.validate().is_err());
    }
}
