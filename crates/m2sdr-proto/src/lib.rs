//! ABI layer shared by every M2SDR transport.
//!
//! This crate holds everything whose exact numeric values matter beyond a
//! single process: the CSR register map the gateware exposes, the descriptor
//! encoding the DMA engines consume, the control-channel operation codes the
//! kernel driver accepts, the DMA `mmap` layout, and the stable error codes.
//!
//! Nothing here performs I/O. The goal is that the kernel driver, the
//! user-space runtime and the software device model all agree on one set of
//! constants, checked by the tests at the bottom of each module.

pub mod csr;
pub mod ctl;
pub mod error;

pub use csr::Direction;
pub use error::ErrorCode;

/// Bytes per DMA buffer. Must be a power of two; the ring arithmetic in the
/// runtime relies on it.
pub const DMA_BUFFER_SIZE: usize = 8192;

/// Buffers per direction ring. Must be a power of two.
pub const DMA_BUFFER_COUNT: usize = 256;

/// Every how many buffers the engine raises an interrupt. Coalescing factor
/// for MSI cadence; descriptors at indices that are not multiples of this
/// carry the irq-disable flag.
pub const DMA_BUFFERS_PER_IRQ: usize = 8;
