//! Buffer pool: the fixed ring of DMA buffers for one direction.
//!
//! A pool owns `N` physically-addressable buffers of `B` bytes each, both
//! powers of two. Buffer identity is stable for the pool's lifetime: index
//! `i` always names the same memory and the same bus address. Slot ownership
//! (software vs hardware) is a ring invariant enforced by the callers, not
//! by this module; the pool only hands out raw views.

use std::ptr::{self, NonNull};

use tracing::debug;

use crate::error::{DmaError, DmaResult};

/// One DMA buffer: host-virtual view plus the bus address the device uses.
struct DmaBuffer {
    ptr: NonNull<u8>,
    bus_addr: u64,
    len: usize,
    owned: bool,
}

// SAFETY: the buffer memory is plain bytes; which thread may touch which
// slot at which moment is governed by the ring counters, not by this type.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocates one page-aligned anonymous mapping. This is the host-side
    /// stand-in for a coherent allocation; the kernel path replaces it with
    /// buffers obtained from the driver.
    fn alloc(len: usize) -> DmaResult<Self> {
        // SAFETY: anonymous mapping, no fd involved; failure is reported as
        // MAP_FAILED and checked before use.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(DmaError::OutOfMemory(format!(
                "mmap of {} byte buffer failed: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }
        let ptr = NonNull::new(raw as *mut u8)
            .ok_or_else(|| DmaError::OutOfMemory("mmap returned null".into()))?;
        Ok(Self {
            ptr,
            // On the host path the virtual address doubles as the bus
            // address; the software device model dereferences it directly.
            bus_addr: ptr.as_ptr() as u64,
            len,
            owned: true,
        })
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: owned buffers came from our own mmap with this length
            // and are unmapped exactly once.
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Ordered, fixed-size set of DMA buffers for one `(channel, direction)`.
pub struct BufferPool {
    channel: usize,
    buffers: Vec<DmaBuffer>,
    buf_size: usize,
}

impl BufferPool {
    /// Allocates `count` buffers of `size` bytes. All-or-nothing: if any
    /// allocation fails, everything already allocated is released and the
    /// error propagates.
    pub fn new(channel: usize, count: usize, size: usize) -> DmaResult<Self> {
        Self::check_geometry(count, size)?;
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            // A failure here drops `buffers`, unmapping everything so far.
            buffers.push(DmaBuffer::alloc(size)?);
        }
        debug!(channel, count, size, "allocated dma buffer pool");
        Ok(Self {
            channel,
            buffers,
            buf_size: size,
        })
    }

    /// Builds a pool over an externally mapped region of `count * size`
    /// contiguous bytes (the zero-copy view of a kernel-owned ring).
    /// `bus_addrs`, when present, carries the device-side addresses; it
    /// must have exactly `count` entries.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `count * size` bytes that
    /// outlives the pool. The pool does not unmap it.
    pub unsafe fn from_raw_parts(
        channel: usize,
        base: NonNull<u8>,
        count: usize,
        size: usize,
        bus_addrs: Option<&[u64]>,
    ) -> DmaResult<Self> {
        Self::check_geometry(count, size)?;
        if let Some(addrs) = bus_addrs {
            if addrs.len() != count {
                return Err(DmaError::InvalidConfig(format!(
                    "expected {} bus addresses, got {}",
                    count,
                    addrs.len()
                )));
            }
        }
        let mut buffers = Vec::with_capacity(count);
        for i in 0..count {
            let ptr = NonNull::new_unchecked(base.as_ptr().add(i * size));
            buffers.push(DmaBuffer {
                ptr,
                bus_addr: bus_addrs
                    .map(|a| a[i])
                    .unwrap_or(ptr.as_ptr() as u64),
                len: size,
                owned: false,
            });
        }
        Ok(Self {
            channel,
            buffers,
            buf_size: size,
        })
    }

    fn check_geometry(count: usize, size: usize) -> DmaResult<()> {
        if count == 0 || !count.is_power_of_two() {
            return Err(DmaError::InvalidConfig(format!(
                "buffer count {count} is not a power of two"
            )));
        }
        if size == 0 || !size.is_power_of_two() {
            return Err(DmaError::InvalidConfig(format!(
                "buffer size {size} is not a power of two"
            )));
        }
        Ok(())
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Number of buffers in the ring. Always a power of two.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes per buffer. Always a power of two.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Device-side address of buffer `i`. Stable for the pool's lifetime.
    pub fn bus_address(&self, i: usize) -> u64 {
        self.buffers[i].bus_addr
    }

    /// Host-virtual address of buffer `i`. Stable for the pool's lifetime.
    pub fn host_ptr(&self, i: usize) -> NonNull<u8> {
        self.buffers[i].ptr
    }

    /// Shared view of slot `i`.
    ///
    /// # Safety
    ///
    /// The caller must hold the ring invariant: the slot is not hardware's
    /// current working slot for the opposite role.
    pub unsafe fn slot(&self, i: usize) -> &[u8] {
        std::slice::from_raw_parts(self.buffers[i].ptr.as_ptr(), self.buf_size)
    }

    /// Exclusive view of slot `i`.
    ///
    /// # Safety
    ///
    /// As [`Self::slot`], plus no other software view of the slot may exist.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, i: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.buffers[i].ptr.as_ptr(), self.buf_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_stable_buffers() {
        let pool = BufferPool::new(0, 8, 4096).unwrap();
        assert_eq!(pool.len(), 8);
        assert_eq!(pool.buf_size(), 4096);

        let addr0 = pool.bus_address(0);
        let ptr0 = pool.host_ptr(0);
        for _ in 0..3 {
            assert_eq!(pool.bus_address(0), addr0);
            assert_eq!(pool.host_ptr(0), ptr0);
        }
        // Distinct buffers, distinct memory.
        let addrs: std::collections::HashSet<u64> =
            (0..pool.len()).map(|i| pool.bus_address(i)).collect();
        assert_eq!(addrs.len(), pool.len());
    }

    #[test]
    fn slots_are_readable_and_writable() {
        let pool = BufferPool::new(0, 4, 4096).unwrap();
        // SAFETY: single-threaded test, no hardware side.
        unsafe {
            pool.slot_mut(2)[..4].copy_from_slice(&[1, 2, 3, 4]);
            assert_eq!(&pool.slot(2)[..4], &[1, 2, 3, 4]);
            assert_eq!(pool.slot(1)[0], 0);
        }
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(matches!(
            BufferPool::new(0, 3, 4096),
            Err(DmaError::InvalidConfig(_))
        ));
        assert!(matches!(
            BufferPool::new(0, 64, 1000),
            Err(DmaError::InvalidConfig(_))
        ));
        assert!(matches!(
            BufferPool::new(0, 0, 4096),
            Err(DmaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn borrowed_pool_does_not_own_memory() {
        let backing = vec![0u8; 4 * 1024];
        let base = NonNull::new(backing.as_ptr() as *mut u8).unwrap();
        // SAFETY: `backing` outlives the pool.
        let pool = unsafe { BufferPool::from_raw_parts(0, base, 4, 1024, None) }.unwrap();
        assert_eq!(pool.bus_address(1), backing.as_ptr() as u64 + 1024);
        drop(pool);
        // `backing` still valid and droppable afterwards.
        drop(backing);
    }
}
