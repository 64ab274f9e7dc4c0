//! Error types for the DMA engine.

use m2sdr_proto::ErrorCode;
use thiserror::Error;

/// Errors that can occur while driving the streaming engine.
#[derive(Error, Debug)]
pub enum DmaError {
    /// Register access outside the MMIO region
    #[error("invalid register address {addr:#06x}")]
    InvalidAddress { addr: u32 },

    /// Transport failure while touching the device
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer allocation failed
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Channel lock held by another owner
    #[error("channel {channel} {direction} is locked by another owner")]
    Busy {
        channel: usize,
        direction: m2sdr_proto::Direction,
    },

    /// Blocking call exceeded its deadline
    #[error("timed out waiting for ring progress")]
    Timeout,

    /// Blocking call cancelled
    #[error("wait interrupted")]
    Interrupted,

    /// Non-blocking call found the ring empty or full
    #[error("ring not ready")]
    WouldBlock,

    /// Malformed engine or ring parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Gateware or build lacks the requested feature
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DmaError {
    /// Stable numeric kind for ABI surfaces and logs.
    pub fn kind(&self) -> ErrorCode {
        match self {
            DmaError::InvalidAddress { .. } => ErrorCode::InvalidArgument,
            DmaError::Io(_) => ErrorCode::Io,
            DmaError::OutOfMemory(_) => ErrorCode::OutOfMemory,
            DmaError::Busy { .. } => ErrorCode::Busy,
            DmaError::Timeout => ErrorCode::Timeout,
            DmaError::Interrupted => ErrorCode::Interrupted,
            DmaError::WouldBlock => ErrorCode::WouldBlock,
            DmaError::InvalidConfig(_) => ErrorCode::InvalidArgument,
            DmaError::Unsupported(_) => ErrorCode::Unsupported,
        }
    }
}

/// Result type for engine operations.
pub type DmaResult<T> = Result<T, DmaError>;
