//! Stable numeric error taxonomy.
//!
//! These codes cross the kernel/user boundary and appear in logs and tools;
//! the values are ABI and must not change. Rich error types live in the
//! crates that produce them and map down to a code via `kind()`.

/// Outcome kind of a streaming-engine operation.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    /// Malformed parameters: bad address, unknown format, size not a
    /// multiple of the buffer size.
    InvalidArgument = 1,
    /// Transport failure: MMIO access error, socket error, kernel copy
    /// failure.
    Io = 2,
    /// A blocking call exceeded its deadline.
    Timeout = 3,
    /// Allocation failed.
    OutOfMemory = 4,
    /// Feature absent in the loaded gateware or build.
    Unsupported = 5,
    /// Channel lock held by another owner.
    Busy = 6,
    /// A blocking call was cancelled.
    Interrupted = 7,
    /// A non-blocking call found the ring empty or full.
    WouldBlock = 8,
}

impl ErrorCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::InvalidArgument),
            2 => Some(Self::Io),
            3 => Some(Self::Timeout),
            4 => Some(Self::OutOfMemory),
            5 => Some(Self::Unsupported),
            6 => Some(Self::Busy),
            7 => Some(Self::Interrupted),
            8 => Some(Self::WouldBlock),
            _ => None,
        }
    }
}
