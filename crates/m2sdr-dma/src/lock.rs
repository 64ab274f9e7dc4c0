//! Channel lock arbitration.
//!
//! At most one holder per `(channel, direction)` across every open of the
//! device. Holders are identified by an opaque id tied to the open handle;
//! when a handle goes away, [`ChannelLockArbiter::release_all`] sweeps the
//! locks it still held so the owning code can stop the engines.

use std::sync::Mutex;

use tracing::debug;

use m2sdr_proto::Direction;

use crate::error::{DmaError, DmaResult};

/// Opaque identity of a lock holder (one per open handle).
pub type HolderId = u64;

#[derive(Default, Clone, Copy)]
struct ChannelLocks {
    rx: Option<HolderId>,
    tx: Option<HolderId>,
}

impl ChannelLocks {
    fn slot(&mut self, direction: Direction) -> &mut Option<HolderId> {
        match direction {
            Direction::Rx => &mut self.rx,
            Direction::Tx => &mut self.tx,
        }
    }

    fn get(&self, direction: Direction) -> Option<HolderId> {
        match direction {
            Direction::Rx => self.rx,
            Direction::Tx => self.tx,
        }
    }
}

/// Process-wide lock table for one device.
pub struct ChannelLockArbiter {
    table: Mutex<Vec<ChannelLocks>>,
}

impl ChannelLockArbiter {
    pub fn new(num_channels: usize) -> Self {
        Self {
            table: Mutex::new(vec![ChannelLocks::default(); num_channels]),
        }
    }

    /// Acquires the lock for `holder`. Re-acquisition by the current holder
    /// succeeds; any other holder gets `Busy`.
    pub fn request(&self, holder: HolderId, channel: usize, direction: Direction) -> DmaResult<()> {
        let mut table = self.table.lock().unwrap();
        let slot = table[channel].slot(direction);
        match *slot {
            None => {
                *slot = Some(holder);
                debug!(channel, %direction, holder, "channel lock acquired");
                Ok(())
            }
            Some(owner) if owner == holder => Ok(()),
            Some(_) => Err(DmaError::Busy { channel, direction }),
        }
    }

    /// Releases the lock if `holder` owns it. Release by a non-holder is a
    /// no-op.
    pub fn release(&self, holder: HolderId, channel: usize, direction: Direction) {
        let mut table = self.table.lock().unwrap();
        let slot = table[channel].slot(direction);
        if *slot == Some(holder) {
            *slot = None;
            debug!(channel, %direction, holder, "channel lock released");
        }
    }

    /// Whether the lock is currently held (by anyone). Non-destructive.
    pub fn is_locked(&self, channel: usize, direction: Direction) -> bool {
        self.table.lock().unwrap()[channel].get(direction).is_some()
    }

    /// Whether `holder` owns the lock.
    pub fn holds(&self, holder: HolderId, channel: usize, direction: Direction) -> bool {
        self.table.lock().unwrap()[channel].get(direction) == Some(holder)
    }

    /// Releases every lock `holder` still owns and returns them, so the
    /// caller can stop the corresponding engines.
    pub fn release_all(&self, holder: HolderId) -> Vec<(usize, Direction)> {
        let mut table = self.table.lock().unwrap();
        let mut released = Vec::new();
        for (channel, locks) in table.iter_mut().enumerate() {
            for direction in [Direction::Rx, Direction::Tx] {
                let slot = locks.slot(direction);
                if *slot == Some(holder) {
                    *slot = None;
                    released.push((channel, direction));
                }
            }
        }
        if !released.is_empty() {
            debug!(holder, count = released.len(), "swept dropped holder's locks");
        }
        released
    }
}
