//! User-space ring discipline over a buffer pool.
//!
//! A `UserRing` is the software side of one direction: cursors derived from
//! the direction counters, coupled either to the mapped pool slots
//! (zero-copy) or to a private staging buffer (staged). The slot at
//! `sw_count mod N` is software's exclusive working slot; everything the
//! ring hands out respects that invariant.

use std::sync::Arc;

use m2sdr_proto::Direction;

use crate::counters::{DirectionState, Timeout};
use crate::error::{DmaError, DmaResult};
use crate::pool::BufferPool;

/// How buffer contents reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Slices point straight into the mapped DMA buffers.
    ZeroCopy,
    /// Slices point into a private staging buffer; `submit`/`consume`
    /// perform the copy.
    Staged,
}

/// Software cursor over one direction's buffer ring.
pub struct UserRing {
    pool: Arc<BufferPool>,
    state: Arc<DirectionState>,
    mode: AccessMode,
    staging: Vec<u8>,
}

impl UserRing {
    pub fn new(
        pool: Arc<BufferPool>,
        state: Arc<DirectionState>,
        mode: AccessMode,
    ) -> DmaResult<Self> {
        if pool.len() as u64 != state.ring_len() {
            return Err(DmaError::InvalidConfig(format!(
                "pool of {} buffers does not match ring length {}",
                pool.len(),
                state.ring_len()
            )));
        }
        let staging = match mode {
            AccessMode::Staged => vec![0u8; pool.buf_size()],
            AccessMode::ZeroCopy => Vec::new(),
        };
        Ok(Self {
            pool,
            state,
            mode,
            staging,
        })
    }

    pub fn direction(&self) -> Direction {
        self.state.direction()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn state(&self) -> &DirectionState {
        &self.state
    }

    fn ring_len(&self) -> u64 {
        self.state.ring_len()
    }

    fn slot_index(&self) -> usize {
        (self.state.sw() % self.ring_len()) as usize
    }

    /// Cache maintenance before reading a buffer the device wrote.
    ///
    /// The PCIe host path maps coherent memory and needs nothing; on
    /// embedded-ARM platforms where coherent buffers are cached this is
    /// where the invalidate belongs.
    pub fn fence_before_read(&self) {
        #[cfg(target_arch = "aarch64")]
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// Cache maintenance after writing a buffer the device will read.
    /// Mirror of [`Self::fence_before_read`].
    pub fn fence_after_write(&self) {
        #[cfg(target_arch = "aarch64")]
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    // --- TX ---------------------------------------------------------------

    /// Room check against the safety watermark: at most half the ring may
    /// be in flight.
    fn tx_has_room(state: &DirectionState) -> bool {
        state.recover_tx_underflow();
        (state.tx_level() as u64) < state.ring_len() / 2
    }

    /// Returns the working slot for the next buffer to transmit, or `None`
    /// if the ring is at the safety watermark.
    pub fn next_write_buffer(&mut self) -> Option<&mut [u8]> {
        if !Self::tx_has_room(&self.state) {
            return None;
        }
        let index = self.slot_index();
        match self.mode {
            AccessMode::Staged => Some(self.staging.as_mut_slice()),
            // SAFETY: the slot at sw mod N is software's exclusive working
            // slot by the ring invariant; `self` is the single software
            // owner of this direction.
            AccessMode::ZeroCopy => Some(unsafe { self.pool.slot_mut(index) }),
        }
    }

    /// Blocking variant of [`Self::next_write_buffer`]. Wakes on counter
    /// progress, level-triggered.
    pub fn wait_write_buffer(&mut self, timeout: Timeout) -> DmaResult<&mut [u8]> {
        let state = Arc::clone(&self.state);
        state.wait_until(timeout, || Self::tx_has_room(&state))?;
        self.next_write_buffer().ok_or(DmaError::WouldBlock)
    }

    /// Publishes the slot written through [`Self::next_write_buffer`] and
    /// advances `sw_count` by one.
    pub fn submit(&mut self) {
        let index = self.slot_index();
        if self.mode == AccessMode::Staged {
            // SAFETY: as in next_write_buffer; the copy happens before the
            // counter advance publishes the slot to the device.
            unsafe {
                self.pool.slot_mut(index).copy_from_slice(&self.staging);
            }
        }
        self.fence_after_write();
        self.state.add_sw(1);
        debug_assert!(self.state.tx_level() as u64 <= self.ring_len());
    }

    // --- RX ---------------------------------------------------------------

    fn rx_has_data(state: &DirectionState) -> bool {
        state.recover_rx_overflow();
        state.rx_available() > 0
    }

    /// Returns the next completed buffer, or `None` if the ring is empty.
    /// Runs overflow recovery first: buffers beyond the half-ring watermark
    /// are declared lost and skipped without copying.
    pub fn next_read_buffer(&mut self) -> Option<&[u8]> {
        if !Self::rx_has_data(&self.state) {
            return None;
        }
        self.fence_before_read();
        let index = self.slot_index();
        match self.mode {
            AccessMode::Staged => {
                // SAFETY: slot at sw mod N is software's exclusive working
                // slot; copied out before consume() frees it.
                let slot = unsafe { self.pool.slot(index) };
                self.staging.copy_from_slice(slot);
                Some(self.staging.as_slice())
            }
            // SAFETY: as above; the caller must call consume() before the
            // next next_read_buffer, upholding single-slot access.
            AccessMode::ZeroCopy => Some(unsafe { self.pool.slot(index) }),
        }
    }

    /// Blocking variant of [`Self::next_read_buffer`].
    pub fn wait_read_buffer(&mut self, timeout: Timeout) -> DmaResult<&[u8]> {
        let state = Arc::clone(&self.state);
        state.wait_until(timeout, || Self::rx_has_data(&state))?;
        self.next_read_buffer().ok_or(DmaError::WouldBlock)
    }

    /// Marks the buffer returned by [`Self::next_read_buffer`] as free and
    /// advances `sw_count` by one.
    pub fn consume(&mut self) {
        self.state.add_sw(1);
    }

    // --- readiness --------------------------------------------------------

    /// `poll`-style readability: more than two completed buffers waiting.
    pub fn poll_readable(&self) -> bool {
        self.state.rx_available() > 2
    }

    /// `poll`-style writability: in-flight level under the watermark.
    pub fn poll_writable(&self) -> bool {
        (self.state.tx_level().max(0) as u64) < self.ring_len() / 2
    }
}
