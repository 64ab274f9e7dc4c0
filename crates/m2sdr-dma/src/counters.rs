//! Per-direction counter tracking and wait queue.
//!
//! Each `(channel, direction)` carries two monotonic 64-bit counts:
//! `hw_count`, the buffers the hardware has completed, and `sw_count`, the
//! buffers software has produced (TX) or consumed (RX). The device only
//! exposes its progress as a 32-bit loop-status word, so the 64-bit value is
//! reconstructed here and kept monotonic across register wraps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use m2sdr_proto::csr::loop_status;
use m2sdr_proto::Direction;

use crate::error::{DmaError, DmaResult};

/// Deadline for a blocking ring operation, from the caller's millisecond
/// convention: `0` means non-blocking, negative means wait forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    NonBlocking,
    Forever,
    Ms(u64),
}

impl Timeout {
    pub fn from_ms(timeout_ms: i64) -> Self {
        match timeout_ms {
            0 => Timeout::NonBlocking,
            ms if ms < 0 => Timeout::Forever,
            ms => Timeout::Ms(ms as u64),
        }
    }

    fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Ms(ms) => Some(Instant::now() + Duration::from_millis(ms)),
            _ => None,
        }
    }
}

/// Counter, enable and wait state for one direction of one channel.
pub struct DirectionState {
    direction: Direction,
    ring_len: u64,
    hw_count: AtomicU64,
    sw_count: AtomicU64,
    /// Last reconstructed value, used to detect loop-count wraps. Written
    /// only by the interrupt path.
    hw_last: AtomicU64,
    enabled: AtomicBool,
    cancelled: AtomicBool,
    lost_buffers: AtomicU64,
    underflows: AtomicU64,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl DirectionState {
    /// `ring_len` must be a power of two; the wrap reconstruction relies on
    /// the span `ring_len << 16` being a bit mask.
    pub fn new(direction: Direction, ring_len: usize) -> Self {
        assert!(
            ring_len.is_power_of_two(),
            "ring length must be a power of two"
        );
        Self {
            direction,
            ring_len: ring_len as u64,
            hw_count: AtomicU64::new(0),
            sw_count: AtomicU64::new(0),
            hw_last: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            lost_buffers: AtomicU64::new(0),
            underflows: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Ring capacity. Always a power of two.
    pub fn ring_len(&self) -> u64 {
        debug_assert!(self.ring_len.is_power_of_two());
        self.ring_len
    }

    pub fn hw(&self) -> u64 {
        self.hw_count.load(Ordering::Acquire)
    }

    pub fn sw(&self) -> u64 {
        self.sw_count.load(Ordering::Acquire)
    }

    /// Advances `sw_count` by exactly `n` buffers.
    pub fn add_sw(&self, n: u64) {
        self.sw_count.fetch_add(n, Ordering::Release);
    }

    /// Reconstructs the 64-bit hardware count from the device's 32-bit
    /// `(loop_count << 16) | loop_index` status and wakes waiters.
    ///
    /// The low `ring_len * 2^16` span of the previous value is replaced by
    /// the raw sample; if that made the count go backwards, the register
    /// wrapped and one full span is added. The result never decreases as
    /// long as this is called at least once per wrap period.
    pub fn advance_hw(&self, status: u32) -> u64 {
        let raw = loop_status::count(status) as u64 * self.ring_len
            + loop_status::index(status) as u64;
        let span = self.ring_len << 16;
        let prev = self.hw_last.load(Ordering::Relaxed);
        let mut hw = (prev & !(span - 1)) | raw;
        if hw < prev {
            hw += span;
        }
        self.hw_last.store(hw, Ordering::Relaxed);
        self.hw_count.store(hw, Ordering::Release);
        self.notify();
        hw
    }

    /// Sets the hardware count to an absolute value (control-channel path,
    /// where the driver already did the reconstruction) and wakes waiters.
    pub fn set_hw(&self, hw: u64) {
        self.hw_count.store(hw, Ordering::Release);
        self.hw_last.store(hw, Ordering::Relaxed);
        self.notify();
    }

    /// Advances the hardware count by `n` completed buffers and wakes
    /// waiters. For transports that complete buffers in software (UDP ring)
    /// rather than through a loop-status register.
    pub fn add_hw(&self, n: u64) {
        let hw = self.hw_count.fetch_add(n, Ordering::Release) + n;
        self.hw_last.store(hw, Ordering::Relaxed);
        self.notify();
    }

    /// Zeroes every counter. Called on the 0→1 enable transition when no
    /// other lock holder keeps them steady.
    pub fn reset(&self) {
        self.hw_count.store(0, Ordering::Release);
        self.sw_count.store(0, Ordering::Release);
        self.hw_last.store(0, Ordering::Relaxed);
        self.lost_buffers.store(0, Ordering::Relaxed);
        self.underflows.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::AcqRel)
    }

    /// RX occupancy: completed buffers not yet consumed.
    pub fn rx_available(&self) -> u64 {
        self.hw().wrapping_sub(self.sw())
    }

    /// TX fill level, signed. Negative means the device ran dry.
    pub fn tx_level(&self) -> i64 {
        self.sw().wrapping_sub(self.hw()) as i64
    }

    /// RX overflow recovery: when the hardware has run more than half the
    /// ring ahead, the oldest buffers are declared lost. `sw_count` jumps
    /// forward without any copy, each skipped buffer is counted, and the
    /// ring keeps running. Returns how many buffers were lost.
    pub fn recover_rx_overflow(&self) -> u64 {
        let half = self.ring_len / 2;
        let occupancy = self.rx_available();
        if occupancy <= half {
            return 0;
        }
        let lost = occupancy - half;
        self.sw_count.fetch_add(lost, Ordering::Release);
        self.lost_buffers.fetch_add(lost, Ordering::Relaxed);
        tracing::warn!(
            direction = %self.direction,
            lost,
            total_lost = self.lost_buffers(),
            "rx overflow, oldest buffers dropped"
        );
        lost
    }

    /// TX underflow recovery: the device ran dry and replayed stale ring
    /// contents. The deficit is counted, `sw_count` resynchronizes to the
    /// hardware position, and the next submitted buffer is accepted as
    /// usual. Returns the number of underflown buffers.
    pub fn recover_tx_underflow(&self) -> u64 {
        let level = self.tx_level();
        if level >= 0 {
            return 0;
        }
        let deficit = (-level) as u64;
        self.sw_count.fetch_add(deficit, Ordering::Release);
        self.underflows.fetch_add(deficit, Ordering::Relaxed);
        tracing::warn!(
            direction = %self.direction,
            deficit,
            total_underflows = self.underflows(),
            "tx underflow, device replayed stale buffers"
        );
        deficit
    }

    pub fn lost_buffers(&self) -> u64 {
        self.lost_buffers.load(Ordering::Relaxed)
    }

    pub fn add_lost(&self, n: u64) {
        self.lost_buffers.fetch_add(n, Ordering::Relaxed);
    }

    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    pub fn add_underflows(&self, n: u64) {
        self.underflows.fetch_add(n, Ordering::Relaxed);
    }

    /// Wakes every waiter on this direction.
    pub fn notify(&self) {
        // Take and drop the lock so a waiter between its predicate check
        // and its wait cannot miss the wake.
        drop(self.wait_lock.lock().unwrap());
        self.wait_cv.notify_all();
    }

    /// Cancels in-flight blocking waits; they return `Interrupted`.
    pub fn cancel_waiters(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify();
    }

    /// Blocks until `ready()` holds, the timeout elapses, or the wait is
    /// cancelled. Level-triggered: the predicate is re-evaluated after every
    /// wake. With `Timeout::NonBlocking`, returns `WouldBlock` immediately
    /// if not ready.
    pub fn wait_until<F>(&self, timeout: Timeout, ready: F) -> DmaResult<()>
    where
        F: Fn() -> bool,
    {
        if ready() {
            return Ok(());
        }
        if timeout == Timeout::NonBlocking {
            return Err(DmaError::WouldBlock);
        }
        let deadline = timeout.deadline();
        let mut guard = self.wait_lock.lock().unwrap();
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return Err(DmaError::Interrupted);
            }
            if ready() {
                return Ok(());
            }
            let wait_for = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(DmaError::Timeout);
                    }
                    d - now
                }
                // Bounded sleep so a lost wake cannot hang a forever-wait;
                // the predicate loop makes spurious wakes harmless.
                None => Duration::from_millis(100),
            };
            let (g, _timed_out) = self.wait_cv.wait_timeout(guard, wait_for).unwrap();
            guard = g;
        }
    }
}
