//! Ring consumer.

use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::ShmResult;
use crate::layout::RingHeader;
use crate::unix::{close_ring_file, open_ring_file};

/// How long a blocked read sleeps between polls.
const EMPTY_POLL: Duration = Duration::from_micros(100);

/// Reads sample chunks from a ring created by a [`crate::RingProducer`].
///
/// # Thread Safety
///
/// `Send` but not `Sync`: one reader thread (single consumer in SPSC).
pub struct RingConsumer {
    ptr: *mut u8,
    fd: libc::c_int,
    size: usize,
    path: PathBuf,
    chunk: Vec<u8>,
}

// SAFETY: as the producer; coordination goes through the header atomics.
unsafe impl Send for RingConsumer {}

impl RingConsumer {
    /// Opens an existing ring. Fails if the file is missing or its header
    /// does not describe a consistent ring (stale or foreign file).
    pub fn open(path: &Path) -> ShmResult<Self> {
        let (ptr, fd, size) = open_ring_file(path)?;
        // SAFETY: open_ring_file validated the header against the file.
        let chunk_bytes = unsafe { &*(ptr as *const RingHeader) }.chunk_bytes();

        debug!(path = %path.display(), size, chunk_bytes, "opened shared-memory ring");

        Ok(Self {
            ptr,
            fd,
            size,
            path: path.to_path_buf(),
            chunk: vec![0u8; chunk_bytes],
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
        self.chunk.len()
    }

    pub fn available(&self) -> u64 {
        self.header().available()
    }

    pub fn writer_done(&self) -> bool {
        self.header().writer_done()
    }

    pub fn error_count(&self) -> u64 {
        self.header().error_count.load(Ordering::Relaxed)
    }

    /// Records underflow events observed downstream (TX pipelines, where
    /// the consumer side talks to the device).
    pub fn add_errors(&self, n: u64) {
        self.header().error_count.fetch_add(n, Ordering::Relaxed);
    }

    /// Reads the next chunk without blocking. `None` when the ring is
    /// empty.
    pub fn try_read(&mut self) -> Option<&[u8]> {
        let chunk_ptr = self.chunk.as_mut_ptr();
        let chunk_len = self.chunk.len();
        let header = self.header();
        let write = header.write_index.load(Ordering::Acquire);
        let read = header.read_index.load(Ordering::Relaxed);
        if read >= write {
            return None;
        }

        let offset = header.slot_offset(read);
        // SAFETY: slots in [read_index, write_index) are the consumer's;
        // the acquire load of write_index made the producer's bytes
        // visible.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.add(offset), chunk_ptr, chunk_len);
        }

        // Free the slot: the copy above happens-before this index store, so
        // the producer cannot overwrite a slot still being read.
        header.read_index.store(read + 1, Ordering::Release);
        Some(&self.chunk)
    }

    /// Reads the next chunk, blocking up to `timeout` (`None` = forever).
    ///
    /// Returns `Ok(None)` exactly when the producer marked the stream done
    /// and everything has been drained: the clean end of stream.
    pub fn read(&mut self, timeout: Option<Duration>) -> ShmResult<Option<&[u8]>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Borrow-checker friendly probe: read data only after deciding.
            if self.available() > 0 {
                return Ok(self.try_read());
            }
            if self.writer_done() {
                return Ok(None);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(crate::ShmError::Timeout);
                }
            }
            std::thread::sleep(EMPTY_POLL);
        }
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        // SAFETY: mapping from open(), closed exactly once here. The file
        // itself stays; consumers join and leave without destroying it.
        unsafe {
            close_ring_file(self.ptr, self.size, self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RingConfig;
    use crate::producer::RingProducer;
    use std::path::PathBuf;

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
    fn open_missing_file_fails() {
        let (_dir, path) = temp_ring();
        assert!(RingConsumer::open(&path).is_err());
    }

    #[test]
    fn open_garbage_file_fails() {
        let (_dir, path) = temp_ring();
        std::fs::write(&path, vec![0xffu8; 4096]).unwrap();
        assert!(RingConsumer::open(&path).is_err());
    }

    #[test]
    fn roundtrip_preserves_bytes() {
        let (_dir, path) = temp_ring();
        let mut producer = RingProducer::create(&path, &config()).unwrap();
        let mut consumer = RingConsumer::open(&path).unwrap();

        let chunk: Vec<u8> = (0..1024).map(|i| (i * 7) as u8).collect();
        producer.try_write(&chunk).unwrap().unwrap();

        let got = consumer.try_read().expect("chunk available");
        assert_eq!(got, chunk.as_slice());
        assert!(consumer.try_read().is_none());
    }

    #[test]
    fn freeing_slots_unblocks_producer() {
        let (_dir, path) = temp_ring();
        let mut producer = RingProducer::create(&path, &config()).unwrap();
        let mut consumer = RingConsumer::open(&path).unwrap();

        let chunk = vec![9u8; 1024];
        for _ in 0..16 {
            producer.try_write(&chunk).unwrap().unwrap();
        }
        assert_eq!(producer.try_write(&chunk).unwrap(), None);

        consumer.try_read().unwrap();
        assert!(producer.try_write(&chunk).unwrap().is_some());
    }

    #[test]
    fn writer_done_terminates_reader() {
        let (_dir, path) = temp_ring();
        let mut producer = RingProducer::create(&path, &config()).unwrap();
        let mut consumer = RingConsumer::open(&path).unwrap();

        let chunk = vec![3u8; 1024];
        producer.try_write(&chunk).unwrap().unwrap();
        producer.finish();

        // Drain, then clean termination.
        assert!(consumer.read(Some(Duration::from_millis(100))).unwrap().is_some());
        assert!(consumer.read(Some(Duration::from_millis(100))).unwrap().is_none());
    }

    #[test]
    fn dropped_producer_reads_as_done() {
        let (_dir, path) = temp_ring();
        let producer = RingProducer::create(&path, &config()).unwrap();
        let consumer = RingConsumer::open(&path).unwrap();
        drop(producer);
        assert!(consumer.writer_done());
    }
}
