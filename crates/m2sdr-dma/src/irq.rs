//! Interrupt demultiplexing.
//!
//! One entry point services every pending MSI vector: DMA vectors update the
//! affected direction's counters and wake its waiters, external vectors are
//! forwarded to registered callbacks, unknown vectors are cleared and
//! otherwise ignored. The service routine never blocks; it is safe to call
//! from an interrupt-context shim as well as from a polling loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::{trace, warn};

use m2sdr_proto::csr;

use crate::counters::DirectionState;
use crate::error::DmaResult;
use crate::port::RegisterPort;

/// Handler for a vector owned by an external collaborator (SATA streamer
/// and similar cores sharing the MSI space).
pub type VectorCallback = Box<dyn Fn() + Send + Sync>;

/// Per-channel pair of direction states, as the demultiplexer sees them.
pub struct ChannelDirections {
    pub rx: Arc<DirectionState>,
    pub tx: Arc<DirectionState>,
}

impl ChannelDirections {
    fn get(&self, direction: csr::Direction) -> &DirectionState {
        match direction {
            csr::Direction::Rx => &self.rx,
            csr::Direction::Tx => &self.tx,
        }
    }
}

/// Walks pending vectors and dispatches them.
pub struct InterruptDemux {
    callbacks: Mutex<HashMap<u32, VectorCallback>>,
}

impl Default for InterruptDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptDemux {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a callback for an external vector. Replaces any previous
    /// registration for the same vector.
    pub fn register_callback(&self, vector: u32, callback: VectorCallback) {
        self.callbacks.lock().unwrap().insert(vector, callback);
    }

    pub fn unregister_callback(&self, vector: u32) {
        self.callbacks.lock().unwrap().remove(&vector);
    }

    /// Services one interrupt: reads the pending vectors, masks them
    /// against the enabled set, handles each, then clears what was handled.
    /// Returns the number of vectors handled.
    pub fn service<P: RegisterPort + ?Sized>(
        &self,
        port: &P,
        channels: &[ChannelDirections],
    ) -> DmaResult<usize> {
        let pending = port.read_reg(csr::CSR_MSI_PENDING)?;
        let enabled = port.read_reg(csr::CSR_MSI_ENABLE)?;
        let active = pending & enabled;
        if active == 0 {
            return Ok(0);
        }

        let mut handled = 0;
        for vector in 0..32 {
            if active & (1 << vector) == 0 {
                continue;
            }
            match csr::vector_target(vector) {
                Some((channel, direction)) if channel < channels.len() => {
                    let base = csr::direction_base(channel, direction);
                    let status = port.read_reg(base + csr::DMA_TABLE_LOOP_STATUS)?;
                    let state = channels[channel].get(direction);
                    let hw = state.advance_hw(status);
                    trace!(channel, %direction, hw, "dma vector serviced");
                }
                Some((channel, direction)) => {
                    // A vector for a channel this open does not drive;
                    // cleared below, nothing to update.
                    trace!(channel, %direction, "vector for undriven channel");
                }
                None => {
                    let callbacks = self.callbacks.lock().unwrap();
                    match callbacks.get(&vector) {
                        Some(callback) => callback(),
                        None => warn!(vector, "unclaimed external vector, clearing"),
                    }
                }
            }
            handled += 1;
        }

        port.write_reg(csr::CSR_MSI_CLEAR, active)?;
        Ok(handled)
    }
}
