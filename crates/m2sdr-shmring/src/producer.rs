//! Ring producer.

use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{ShmError, ShmResult};
use crate::layout::{RingConfig, RingHeader};
use crate::unix::{close_ring_file, create_ring_file};

/// How long a blocked write sleeps between capacity polls.
const STALL_POLL: Duration = Duration::from_micros(100);

/// Writes sample chunks into the ring.
///
/// # Thread Safety
///
/// `Send` but not `Sync`: one writer thread (single producer in SPSC).
pub struct RingProducer {
    ptr: *mut u8,
    fd: libc::c_int,
    size: usize,
    path: PathBuf,
}

// SAFETY: the mapping may move between threads; concurrent access to the
// shared region is coordinated entirely through the header atomics.
unsafe impl Send for RingProducer {}

impl RingProducer {
    /// Creates the ring file at `path` and initializes the header. An
    /// existing file at the path is reused and reinitialized.
    pub fn create(path: &Path, config: &RingConfig) -> ShmResult<Self> {
        config.validate()?;
        let size = config.total_size();

        info!(
            path = %path.display(),
            size,
            chunk_size = config.chunk_size,
            num_slots = config.num_slots,
            num_channels = config.num_channels,
            sample_size = config.sample_size,
            "creating shared-memory ring"
        );

        let (ptr, fd) = create_ring_file(path, size)?;

        // SAFETY: the mapping is at least header-sized and exclusively ours
        // until this function returns.
        let header = unsafe { &mut *(ptr as *mut RingHeader) };
        header.init(config);
        // SAFETY: zero the slot area so consumers never observe file
        // garbage from a reused path.
        unsafe {
            ptr::write_bytes(ptr.add(crate::SHM_HEADER_SIZE), 0, size - crate::SHM_HEADER_SIZE);
        }

        Ok(Self {
            ptr,
            fd,
            size,
            path: path.to_path_buf(),
        })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the mapping outlives self and starts with a valid header.
        unsafe { &*(self.ptr as *const RingHeader) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_bytes(&self) -> usize {
        self.header().chunk_bytes()
    }

    /// Chunks currently waiting to be consumed.
    pub fn pending(&self) -> u64 {
        self.header().available()
    }

    pub fn stall_count(&self) -> u64 {
        self.header().buffer_stall_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.header().error_count.load(Ordering::Relaxed)
    }

    /// Records over/underflow events observed on the streaming side. The
    /// meaning is direction-dependent: lost buffers for an RX producer,
    /// underflows for a TX pipeline. Not an error of the ring itself.
    pub fn add_errors(&self, n: u64) {
        self.header().error_count.fetch_add(n, Ordering::Relaxed);
    }

    /// Attempts to write one chunk. Returns the slot index it landed in, or
    /// `None` when the ring is full, in which case the stall counter is
    /// bumped and the caller decides whether to retry or drop.
    pub fn try_write(&mut self, chunk: &[u8]) -> ShmResult<Option<u64>> {
        let header = self.header();
        let expected = header.chunk_bytes();
        if chunk.len() != expected {
            return Err(ShmError::ChunkSize {
                got: chunk.len(),
                expected,
            });
        }

        let read = header.read_index.load(Ordering::Acquire);
        let write = header.write_index.load(Ordering::Relaxed);
        if write - read >= header.num_slots as u64 {
            header.buffer_stall_count.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let offset = header.slot_offset(write);
        // SAFETY: the slot at write_index is the producer's exclusive slot:
        // the consumer only touches `[read_index, write_index)`.
        unsafe {
            ptr::copy_nonoverlapping(chunk.as_ptr(), self.ptr.add(offset), expected);
        }

        // Publish: every byte stored above happens-before this index store.
        header.write_index.store(write + 1, Ordering::Release);
        Ok(Some(write))
    }

    /// Writes one chunk, polling while the ring is full. `None` deadline
    /// waits forever.
    pub fn write(&mut self, chunk: &[u8], timeout: Option<Duration>) -> ShmResult<u64> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(slot) = self.try_write(chunk)? {
                return Ok(slot);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(ShmError::Timeout);
                }
            }
            std::thread::sleep(STALL_POLL);
        }
    }

    /// Marks the stream finished. Consumers drain what is left and
    /// terminate cleanly. Irreversible.
    pub fn finish(&self) {
        debug!(path = %self.path.display(), "marking ring writer done");
        self.header().set_writer_done();
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        // A vanished producer looks exactly like a finished one.
        self.finish();
        // SAFETY: mapping created in `create`, closed exactly once here.
        unsafe {
            close_ring_file(self.ptr, self.size, self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RingConfig {
        RingConfig {
            chunk_size: 256,
            num_slots: 16,
            num_channels: 1,
            sample_size: 4,
        }
    }

    fn temp_ring() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.shm");
        (dir, path)
    }

    #[test]
    fn create_and_write() {
        let (_dir, path) = temp_ring();
        let mut producer = RingProducer::create(&path, &config()).unwrap();
        assert_eq!(producer.chunk_bytes(), 1024);

        let chunk = vec![0x5a; 1024];
        assert_eq!(producer.try_write(&chunk).unwrap(), Some(0));
        assert_eq!(producer.try_write(&chunk).unwrap(), Some(1));
        assert_eq!(producer.pending(), 2);
    }

    #[test]
    fn wrong_chunk_size_is_rejected() {
        let (_dir, path) = temp_ring();
        let mut producer = RingProducer::create(&path, &config()).unwrap();
        let short = vec![0u8; 100];
        assert!(matches!(
            producer.try_write(&short),
            Err(ShmError::ChunkSize { got: 100, expected: 1024 })
        ));
    }

    #[test]
    fn full_ring_stalls() {
        let (_dir, path) = temp_ring();
        let mut producer = RingProducer::create(&path, &config()).unwrap();
        let chunk = vec![1u8; 1024];
        for _ in 0..16 {
            assert!(producer.try_write(&chunk).unwrap().is_some());
        }
        // Slot 17 has nowhere to go: exactly one boundary report per try.
        assert_eq!(producer.try_write(&chunk).unwrap(), None);
        assert_eq!(producer.stall_count(), 1);
        assert!(matches!(
            producer.write(&chunk, Some(Duration::from_millis(5))),
            Err(ShmError::Timeout)
        ));
        assert!(producer.stall_count() > 1);
    }

    #[test]
    fn bad_config_is_rejected() {
        let (_dir, path) = temp_ring();
        let bad = RingConfig {
            num_slots: 8,
            ..config()
        };
        assert!(RingProducer::create(&path, &bad).is_err());
    }

    #[test]
    fn error_accounting() {
        let (_dir, path) = temp_ring();
        let producer = RingProducer::create(&path, &config()).unwrap();
        producer.add_errors(3);
        producer.add_errors(2);
        assert_eq!(producer.error_count(), 5);
    }
}
