//! Facade error type.

use m2sdr_proto::ErrorCode;
use thiserror::Error;

/// Errors surfaced by the device and streaming API.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed parameters
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking call exceeded its deadline
    #[error("operation timed out")]
    Timeout,

    /// Allocation failed
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Feature absent in the loaded gateware or build
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Channel lock held by another owner
    #[error("device busy")]
    Busy,

    /// Blocking call cancelled
    #[error("operation interrupted")]
    Interrupted,

    /// Non-blocking call found the ring empty or full
    #[error("operation would block")]
    WouldBlock,
}

impl Error {
    /// Stable numeric kind (ABI taxonomy).
    pub fn kind(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::Io(_) => ErrorCode::Io,
            Error::Timeout => ErrorCode::Timeout,
            Error::OutOfMemory(_) => ErrorCode::OutOfMemory,
            Error::Unsupported(_) => ErrorCode::Unsupported,
            Error::Busy => ErrorCode::Busy,
            Error::Interrupted => ErrorCode::Interrupted,
            Error::WouldBlock => ErrorCode::WouldBlock,
        }
    }
}

impl From<m2sdr_dma::DmaError> for Error {
    fn from(e: m2sdr_dma::DmaError) -> Self {
        use m2sdr_dma::DmaError;
        match e {
            DmaError::InvalidAddress { addr } => {
                Error::InvalidArgument(format!("register address {addr:#06x}"))
            }
            DmaError::Io(io) => Error::Io(io),
            DmaError::OutOfMemory(msg) => Error::OutOfMemory(msg),
            DmaError::Busy { .. } => Error::Busy,
            DmaError::Timeout => Error::Timeout,
            DmaError::Interrupted => Error::Interrupted,
            DmaError::WouldBlock => Error::WouldBlock,
            DmaError::InvalidConfig(msg) => Error::InvalidArgument(msg),
            DmaError::Unsupported(msg) => Error::Unsupported(msg),
        }
    }
}

impl From<m2sdr_shmring::ShmError> for Error {
    fn from(e: m2sdr_shmring::ShmError) -> Self {
        use m2sdr_shmring::ShmError;
        match e {
            ShmError::Timeout => Error::Timeout,
            ShmError::Io(io) => Error::Io(io),
            ShmError::InvalidConfig(msg) | ShmError::InvalidHeader(msg) => {
                Error::InvalidArgument(msg)
            }
            ShmError::ChunkSize { got, expected } => Error::InvalidArgument(format!(
                "chunk of {got} bytes, ring expects {expected}"
            )),
            ShmError::File(msg) | ShmError::Mmap(msg) => {
                Error::Io(std::io::Error::other(msg))
            }
        }
    }
}

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(Error::Busy.kind(), ErrorCode::Busy);
        assert_eq!(Error::Timeout.kind(), ErrorCode::Timeout);
        assert_eq!(
            Error::InvalidArgument("x".into()).kind(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn dma_errors_convert_with_kind_intact() {
        let e: Error = m2sdr_dma::DmaError::Timeout.into();
        assert_eq!(e.kind(), ErrorCode::Timeout);
        let e: Error = m2sdr_dma::DmaError::Busy {
            channel: 1,
            direction: m2sdr_proto::Direction::Rx,
        }
        .into();
        assert_eq!(e.kind(), ErrorCode::Busy);
    }
}
